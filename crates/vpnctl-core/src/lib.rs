pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::Settings;
pub use constants::*;
pub use error::VpnctlError;
pub use types::*;
