mod canal;
mod env;
mod error;
mod validation;

pub use canal::{CanalConfig, DumpConfig};
pub use env::resolve_env;
pub use error::{ConfigError, ConfigResult};
pub use validation::validate_config;
