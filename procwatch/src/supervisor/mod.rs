// Job supervision: lifecycle, registry and the websocket action protocol
// Shared between the daemon and the CLI binaries

pub mod action_server;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod protocol;
pub mod service;
pub mod signals;
