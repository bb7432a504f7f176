//! CLI command implementations

mod config;
mod connect;

pub use config::{config_get, config_init, config_path, config_set, config_show, load};
pub use connect::{connect_command, parse_ssh_target, ConnectArgs, Via};
