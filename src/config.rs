//! Environment-variable configuration, loaded and validated once at startup.
//!
//! Mirrors the key table in the system spec: every key is optional with a
//! documented default except where noted, and the whole thing fails fast
//! (before any container is created) on an invalid combination.

use std::env;

use crate::error::ConfigError;

/// Balancer configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub image_name: String,
    pub memory_limit: String,
    pub server_port: u16,
    pub lb_port_start: u16,
    pub fast_api_port: u16,
    pub initial_node_count: u32,
    pub health_check_time_secs: u64,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub max_memory_usage_threshold: f64,
    pub min_memory_usage_threshold: f64,
    pub scale_up_node_count: u32,
    pub scale_down_node_count: u32,
}

impl Config {
    /// Load configuration from the process environment and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            image_name: env_or("IMAGE_NAME", "flask_docker"),
            memory_limit: env_or("MEMORY_LIMIT", "140m"),
            server_port: env_parse_or("SERVER_PORT", 5000)?,
            lb_port_start: env_parse_or("LB_PORT_START", 9000)?,
            fast_api_port: env_parse_or("FAST_API_PORT", 8000)?,
            initial_node_count: env_parse_or("INITIAL_NODE_COUNT", 3)?,
            health_check_time_secs: env_parse_or("HEALTH_CHECK_TIME", 10)?,
            min_nodes: env_parse_or("MIN_NODES", 1)?,
            max_nodes: env_parse_or("MAX_NODES", 10)?,
            max_memory_usage_threshold: env_parse_or("MAX_MEMORY_USAGE_THRESHOLD", 70.0)?,
            min_memory_usage_threshold: env_parse_or("MIN_MEMORY_USAGE_THRESHOLD", 20.0)?,
            scale_up_node_count: env_parse_or("SCALE_UP_NODE_COUNT", 1)?,
            scale_down_node_count: env_parse_or("SCALE_DOWN_NODE_COUNT", 1)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_nodes > self.max_nodes {
            return Err(ConfigError::BadBounds {
                min: self.min_nodes,
                max: self.max_nodes,
            });
        }
        if self.initial_node_count < self.min_nodes || self.initial_node_count > self.max_nodes {
            return Err(ConfigError::InitialOutOfBounds {
                initial: self.initial_node_count,
                min: self.min_nodes,
                max: self.max_nodes,
            });
        }
        if self.min_memory_usage_threshold >= self.max_memory_usage_threshold {
            return Err(ConfigError::BadThresholds {
                min: self.min_memory_usage_threshold,
                max: self.max_memory_usage_threshold,
            });
        }
        Ok(())
    }
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            value,
            reason: "could not parse value",
        }),
        Err(_) => Ok(default),
    }
}
