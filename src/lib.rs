mod collections;
pub mod types;
pub mod config;
pub mod error;
pub mod network;
pub mod world;
pub mod children;
pub mod dns;
pub mod reboot;
pub mod status;
pub mod commands;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use network::Network;
pub use server::Server;
pub use world::World;

mod prelude {
    pub(crate) use crate::collections::*;
    pub(crate) use crate::types::*;
    pub(crate) use crate::network::{ConnState, Inbox, Inboxes};
    pub(crate) use std::{io, time};
    pub(crate) use std::net::TcpStream;
}
