use std::num::NonZeroU32;

use envconfig::Envconfig;
use log_common::config::NonEmptyString;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "QUEUE_NAME")]
    pub queue_name: NonEmptyString,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(from = "MAX_BODY_SIZE", default = "5000000")]
    pub max_body_size: usize,

    #[envconfig(from = "CONCURRENCY_LIMIT", default = "100")]
    pub concurrency_limit: usize,

    /// Deliveries each enqueued record may use before it is dead-lettered.
    #[envconfig(from = "MAX_ATTEMPTS", default = "3")]
    pub max_attempts: NonZeroU32,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
