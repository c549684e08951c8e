//! Command dispatch: maps client method names to handlers.
//!
//! Handlers get a [`CommandContext`] bound to an already resolved device
//! session and talk to the device through [`CommandContext::forward`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::bridge::Bridge;
use crate::error::CommandError;

/// Everything a command needs to reach the device serving its resource.
#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    pub bridge: &'a Bridge,
    pub downstream_session_id: &'a str,
    pub resource_id: &'a str,
    pub timeout: Duration,
}

impl CommandContext<'_> {
    /// Send `method` to the device and wait for the correlated reply.
    pub async fn forward(&self, method: &str, params: Value) -> Result<Value, CommandError> {
        self.bridge
            .send_command(self.downstream_session_id, method, params, Some(self.timeout))
            .await
            .map_err(CommandError::from)
    }
}

pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, _params: &Value) -> Result<(), CommandError> {
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        ctx: CommandContext<'a>,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, CommandError>>;
}

/// Forwards a method to the device unchanged, after checking that the
/// required params are present.
pub struct ForwardCommand {
    name: String,
    required: Vec<String>,
}

impl ForwardCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
        }
    }

    pub fn require(mut self, param: impl Into<String>) -> Self {
        self.required.push(param.into());
        self
    }
}

impl Command for ForwardCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &Value) -> Result<(), CommandError> {
        if self.required.is_empty() {
            return Ok(());
        }
        let Some(obj) = params.as_object() else {
            return Err(CommandError::InvalidParams(format!(
                "{} expects an object with {}",
                self.name,
                self.required.join(", ")
            )));
        };
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|key| obj.get(key.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CommandError::InvalidParams(format!(
                "{} is missing required params: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }

    fn execute<'a>(
        &'a self,
        ctx: CommandContext<'a>,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, CommandError>> {
        Box::pin(async move { ctx.forward(&self.name, params).await })
    }
}

/// Name → handler map.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
    passthrough: bool,
}

impl CommandRegistry {
    /// Empty registry. With `passthrough`, unknown methods are forwarded to
    /// the device as-is instead of being rejected.
    pub fn new(passthrough: bool) -> Self {
        Self {
            commands: HashMap::new(),
            passthrough,
        }
    }

    /// Registry with the built-in commands.
    pub fn with_builtins(passthrough: bool) -> Self {
        let mut registry = Self::new(passthrough);
        registry.register(ForwardCommand::new("ping"));
        registry
    }

    pub fn register(&mut self, command: impl Command + 'static) {
        let command: Arc<dyn Command> = Arc::new(command);
        self.commands.insert(command.name().to_string(), command);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and run `method` against the device bound in `ctx`.
    pub async fn dispatch(
        &self,
        ctx: CommandContext<'_>,
        method: &str,
        params: Value,
    ) -> Result<Value, CommandError> {
        let command: Arc<dyn Command> = match self.get(method) {
            Some(command) => command,
            None if self.passthrough => Arc::new(ForwardCommand::new(method)),
            None => return Err(CommandError::UnknownMethod(method.to_string())),
        };
        command.validate(&params)?;
        command.execute(ctx, params).await
    }
}
