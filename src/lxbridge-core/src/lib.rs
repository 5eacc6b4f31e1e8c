pub mod config;
pub mod logging;
pub mod models;
pub mod paths;

pub use config::{Config, ConfigError, LogLevel, LoggingConfig, RuntimeConfig, ValidationError};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use models::{InvocationResult, MusicRequestInfo, Query, RequestPayload, MUSIC_URL_ACTION};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "lxbridge";
pub const APP_AUTHOR: &str = "lxbridge";
pub const APP_QUALIFIER: &str = "io";
