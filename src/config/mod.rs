pub mod display;
pub mod parser;
pub mod types;
pub mod validate;

pub use display::display_config;
pub use parser::{ConfigError, ConfigParser, FromYaml, ParseResult};
pub use types::{
    AppConfig, FastcgiExtensionConfig, FastcgiHostConfig, RouteConfig, RoutingError, ServerConfig,
};
pub use validate::validate_configs;
