//! Command implementations for the CLI.

mod bind;
mod config;
mod simulate;
mod status;

pub use bind::{cmd_bind, cmd_unbind};
pub use config::cmd_config;
pub use simulate::cmd_simulate;
pub use status::cmd_status;
