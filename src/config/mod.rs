//! Configuration: server settings and per-session inline overrides.

pub mod session_config;
pub mod settings;

pub use session_config::{AuditScope, SessionConfig};
pub use settings::{
    AuditConfig, AuditorConfig, CacheConfig, CodexConfig, SessionStoreConfig, StagnationConfig,
};
