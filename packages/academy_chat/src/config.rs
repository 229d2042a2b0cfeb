//! Client configuration, figment-deserialized from defaults / chat.toml /
//! env vars.
//!
//! Three equivalent ways to configure:
//!
//!   chat.toml:    [reconnect]
//!                 max_attempts = 10
//!
//!   env var:      ACADEMY_RECONNECT__MAX_ATTEMPTS=10   (double underscore = nesting)
//!
//!   (single underscore stays within field names: ACADEMY_TYPING__QUIET_INTERVAL_MS)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Backend endpoints (lives under `[endpoints]` in chat.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
        }
    }
}

/// Reconnection budget and backoff bounds (lives under `[reconnect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Transport retries before the session fails permanently.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Bounded wait for the `connected`/`auth_error` handshake reply.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Typing debounce tunables (lives under `[typing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Quiet interval after the last keystroke before a stop is emitted.
    #[serde(default = "default_quiet_interval_ms")]
    pub quiet_interval_ms: u64,
    /// How long a remote typing indicator survives without a refresh.
    /// Larger than the quiet interval so a lost remote stop event cannot
    /// leave a stale indicator forever.
    #[serde(default = "default_remote_expiry_ms")]
    pub remote_expiry_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            quiet_interval_ms: default_quiet_interval_ms(),
            remote_expiry_ms: default_remote_expiry_ms(),
        }
    }
}

impl TypingConfig {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn remote_expiry(&self) -> Duration {
        Duration::from_millis(self.remote_expiry_ms)
    }
}

/// Outbound delivery tunables (lives under `[delivery]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bounded wait for a send acknowledgment before the entry is marked
    /// failed.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Observation window that coalesces read-receipt emissions.
    #[serde(default = "default_read_flush_ms")]
    pub read_flush_ms: u64,
    /// Page size for message-history bootstrap fetches.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            read_flush_ms: default_read_flush_ms(),
            page_size: default_page_size(),
        }
    }
}

impl DeliveryConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn read_flush(&self) -> Duration {
        Duration::from_millis(self.read_flush_ms)
    }
}

fn default_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_max_attempts() -> u32 {
    8
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_quiet_interval_ms() -> u64 {
    2_000
}
fn default_remote_expiry_ms() -> u64 {
    6_000
}
fn default_ack_timeout_ms() -> u64 {
    10_000
}
fn default_read_flush_ms() -> u64 {
    250
}
fn default_page_size() -> usize {
    50
}

/// Build a figment that layers: defaults → chat.toml → ACADEMY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ACADEMY_RECONNECT__MAX_ATTEMPTS=10`  →  `reconnect.max_attempts = 10`
///   `ACADEMY_ENDPOINTS__WS_URL=wss://…`   →  `endpoints.ws_url = "wss://…"`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ChatConfig::default()))
        .merge(Toml::file(config_dir.join("chat.toml")))
        .merge(Env::prefixed("ACADEMY_").split("__"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ChatConfig::default();
        assert!(cfg.reconnect.max_attempts > 0);
        assert!(cfg.typing.remote_expiry_ms > cfg.typing.quiet_interval_ms);
        assert!(cfg.delivery.ack_timeout_ms > cfg.delivery.read_flush_ms);
    }

    #[test]
    fn toml_overrides_defaults() {
        let toml = r#"
            [reconnect]
            max_attempts = 3
            base_delay_ms = 100

            [typing]
            quiet_interval_ms = 1500
        "#;
        let cfg: ChatConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.base_delay_ms, 100);
        // Untouched sections keep their defaults
        assert_eq!(cfg.reconnect.max_delay_ms, default_max_delay_ms());
        assert_eq!(cfg.typing.quiet_interval_ms, 1500);
        assert_eq!(cfg.delivery.ack_timeout_ms, default_ack_timeout_ms());
    }

    #[test]
    fn duration_accessors_convert_millis() {
        let cfg = ChatConfig::default();
        assert_eq!(
            cfg.typing.quiet_interval(),
            Duration::from_millis(cfg.typing.quiet_interval_ms)
        );
        assert_eq!(
            cfg.reconnect.base_delay(),
            Duration::from_millis(cfg.reconnect.base_delay_ms)
        );
    }
}
