use magnetite::key::Key;
use serde_derive::{Deserialize, Serialize};

/// Client side configuration. All fields have working defaults.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// A session times out when no valid inbound packet arrives within
    /// this window.
    pub session_timeout_secs: f64,
    /// Opaque stats selector forwarded to the controller.
    pub stats_mode: i32,
    /// Never contact the controller; sessions are direct only.
    pub direct_only: bool,
    /// Refuse direct sessions and direct fallback entirely.
    pub relay_only: bool,
    /// Keep the relay path even when it cannot beat the direct path.
    pub disable_cant_beat_direct: bool,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            session_timeout_secs: 5.0,
            stats_mode: 0,
            direct_only: false,
            relay_only: false,
            disable_cant_beat_direct: false,
        }
    }
}

/// Server side configuration. The keypair is the server's box keypair; the
/// controller seals per hop tokens to its public half.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_server_session_timeout")]
    pub session_timeout_secs: f64,
    pub public_key: Key,
    pub private_key: Key,
}

impl ServerConfig {
    pub fn new(public_key: [u8; Key::SIZE], private_key: [u8; Key::SIZE]) -> ServerConfig {
        ServerConfig {
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_server_session_timeout(),
            public_key: Key::new(public_key),
            private_key: Key::new(private_key),
        }
    }

    /// An all zero keypair is the unconfigured marker and must be rejected
    /// before the server goes live.
    pub fn has_keypair(&self) -> bool {
        !self.public_key.is_zero() || !self.private_key.is_zero()
    }
}

fn default_max_sessions() -> usize {
    256
}

fn default_server_session_timeout() -> f64 {
    10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();

        assert_eq!(config.session_timeout_secs, 5.0);
        assert!(!config.direct_only);
        assert!(!config.relay_only);
        assert!(!config.disable_cant_beat_direct);
    }

    #[test]
    fn test_client_config_from_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"direct_only": true}"#).unwrap();

        assert!(config.direct_only);
        assert_eq!(config.session_timeout_secs, 5.0);
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new([1u8; 32], [2u8; 32]);

        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.session_timeout_secs, 10.0);
        assert!(config.has_keypair());
    }

    #[test]
    fn test_server_config_zeroed_keypair() {
        let config = ServerConfig::new([0u8; 32], [0u8; 32]);
        assert!(!config.has_keypair());
    }

    #[test]
    fn test_server_config_json_roundtrip() {
        let config = ServerConfig::new([1u8; 32], [2u8; 32]);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.public_key, config.public_key);
        assert_eq!(parsed.private_key, config.private_key);
        assert_eq!(parsed.max_sessions, config.max_sessions);
    }
}
