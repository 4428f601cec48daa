//! Runtime configuration, read from environment variables with defaults
//! matching the literal values spec.md §4.4/§5 name (SPEC_FULL.md §3: "a
//! plain `ServerConfig` struct ... constructed from environment variables").

use std::time::Duration;

use vmt::{DEFAULT_APPLICATION_TIMEOUT_SECS, DEFAULT_WIRE_TIMEOUT_SECS};

/// `original_source/common/inc/vmaccel_defs.h`'s `VMACCEL_VMCL_BASE_PORT`.
const DEFAULT_STREAM_BASE_PORT: u16 = 5100;
/// `original_source/common/inc/vmaccel_defs.h`'s `VMACCEL_MAX_STREAMS`.
const DEFAULT_MAX_STREAMS: u32 = 4;
const DEFAULT_RPC_PORT: u16 = 5099;
const DEFAULT_REGISTERED_CAPACITY: u32 = 16;
const DEFAULT_EXTERNAL_CAPACITY: u32 = 256;
const DEFAULT_MAX_CONTEXTS: u32 = 32;
const DEFAULT_MAX_SURFACES: u32 = 256;
const DEFAULT_MAX_KERNELS: u32 = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub rpc_listen_addr: String,
    pub stream_host: String,
    pub stream_base_port: u16,
    pub max_streams: u32,
    pub wire_timeout: Duration,
    pub application_timeout: Duration,
    pub registered_capacity: u32,
    pub external_capacity: u32,
    pub max_contexts: u32,
    pub max_surfaces: u32,
    pub max_kernels: u32,
}

impl ServerConfig {
    /// Build configuration from the environment, falling back to the
    /// defaults above for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            rpc_listen_addr: env_string("VMACCEL_RPC_LISTEN", format!("0.0.0.0:{DEFAULT_RPC_PORT}")),
            stream_host: env_string("VMACCEL_STREAM_HOST", "0.0.0.0".to_owned()),
            stream_base_port: env_parsed("VMACCEL_VMCL_BASE_PORT", DEFAULT_STREAM_BASE_PORT),
            max_streams: env_parsed("VMACCEL_MAX_STREAMS", DEFAULT_MAX_STREAMS),
            wire_timeout: Duration::from_secs(env_parsed("VMACCEL_WIRE_TIMEOUT_SECS", DEFAULT_WIRE_TIMEOUT_SECS)),
            application_timeout: Duration::from_secs(env_parsed(
                "VMACCEL_APPLICATION_TIMEOUT_SECS",
                DEFAULT_APPLICATION_TIMEOUT_SECS,
            )),
            registered_capacity: env_parsed("VMACCEL_REGISTERED_CAPACITY", DEFAULT_REGISTERED_CAPACITY),
            external_capacity: env_parsed("VMACCEL_EXTERNAL_CAPACITY", DEFAULT_EXTERNAL_CAPACITY),
            max_contexts: env_parsed("VMACCEL_MAX_CONTEXTS", DEFAULT_MAX_CONTEXTS),
            max_surfaces: env_parsed("VMACCEL_MAX_SURFACES", DEFAULT_MAX_SURFACES),
            max_kernels: env_parsed("VMACCEL_MAX_KERNELS", DEFAULT_MAX_KERNELS),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_environment_is_unset() {
        std::env::remove_var("VMACCEL_RPC_LISTEN");
        let config = ServerConfig::from_env();
        assert_eq!(config.rpc_listen_addr, format!("0.0.0.0:{DEFAULT_RPC_PORT}"));
        assert_eq!(config.stream_base_port, DEFAULT_STREAM_BASE_PORT);
        assert_eq!(config.max_streams, DEFAULT_MAX_STREAMS);
    }
}
