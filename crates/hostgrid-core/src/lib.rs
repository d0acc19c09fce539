pub mod config;
pub mod duration;
pub mod snowflake;
pub mod subdomain;

pub use config::HostgridConfig;
pub use duration::parse_duration;
pub use snowflake::{
    SnowflakeError, SnowflakeGenerator, SnowflakeId, SnowflakeResult, WORKER_ID_SPACE,
};
pub use subdomain::{validate_subdomain, SubdomainError};
