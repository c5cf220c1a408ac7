pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{LogConfig, LogFormat, RetryConfig, StrataConfig};
