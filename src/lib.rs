//! docbridge routes commands from automation clients to the device process
//! that has the matching document open.
//!
//! Clients ("upstream") and devices ("downstream") connect over independent
//! WebSockets and are paired by a shared resource id. The [`bridge::Bridge`]
//! service object tracks both sides, resolves routes, and correlates every
//! command sent to a device with its asynchronous reply.

pub mod api;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod downstream;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod shutdown;
pub mod upstream;
