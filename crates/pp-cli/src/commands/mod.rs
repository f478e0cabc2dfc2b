//! CLI command implementations

mod config;
mod master;
mod slave;

pub use config::{config_init, config_path, config_show};
pub use master::master_command;
pub use slave::slave_command;
