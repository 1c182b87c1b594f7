pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod room;
pub mod server;
