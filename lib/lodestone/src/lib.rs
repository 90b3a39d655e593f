#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! The engine half of the routed traffic overlay: the client state machine,
//! the server session table, the ping and stats machinery, and the route
//! controller interface. The wire and token plumbing lives in `magnetite`.

pub mod client;
pub mod config;
pub mod controller;
pub mod ping;
pub mod queue;
pub mod runtime;
pub mod server;

pub use crate::client::{Client, ClientError, ClientMode, ClientState, Counter};
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::runtime::Runtime;
pub use crate::server::{Server, ServerError};
