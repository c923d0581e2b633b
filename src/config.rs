use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::IceServer;
use crate::error::{SoftphoneError, SoftphoneResult};

/// Default secure websocket port used by WebRTC-capable registrars
pub const DEFAULT_WS_PORT: u16 = 8089;

/// Default websocket path appended to the server host
pub const DEFAULT_WS_PATH: &str = "/ws";

/// TURN relay credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub uri: String,
    pub username: String,
    pub credential: String,
}

/// SIP account the softphone registers with.
///
/// Loaded from the config store and never mutated in place: a reload replaces
/// the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipEndpointConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// SIP domain; falls back to `server` when absent
    #[serde(default)]
    pub domain: Option<String>,
    /// Full websocket URI, overrides `server`/`port`/`ws_path`
    #[serde(default)]
    pub ws_uri: Option<String>,
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub turn: Option<TurnCredentials>,
    #[serde(default)]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_WS_PORT
}

fn default_enabled() -> bool {
    true
}

impl SipEndpointConfig {
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            port: DEFAULT_WS_PORT,
            username: username.into(),
            password: password.into(),
            domain: None,
            ws_uri: None,
            ws_path: None,
            turn: None,
            stun_servers: Vec::new(),
            enabled: true,
            display_name: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_ws_uri(mut self, uri: impl Into<String>) -> Self {
        self.ws_uri = Some(uri.into());
        self
    }

    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = Some(path.into());
        self
    }

    pub fn with_turn(mut self, turn: TurnCredentials) -> Self {
        self.turn = Some(turn);
        self
    }

    pub fn with_stun_server(mut self, uri: impl Into<String>) -> Self {
        self.stun_servers.push(uri.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Check the fields a stack cannot start without
    pub fn validate(&self) -> SoftphoneResult<()> {
        let missing: Vec<&str> = [
            ("server", self.server.trim().is_empty()),
            ("username", self.username.trim().is_empty()),
            ("password", self.password.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();

        if !missing.is_empty() {
            return Err(SoftphoneError::config(format!(
                "missing {}",
                missing.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(SoftphoneError::config("port must be non-zero"));
        }
        if !self.enabled {
            return Err(SoftphoneError::config("SIP account is disabled"));
        }
        Ok(())
    }

    pub fn sip_domain(&self) -> &str {
        match self.domain.as_deref() {
            Some(domain) if !domain.trim().is_empty() => domain.trim(),
            _ => strip_scheme(self.server.trim()),
        }
    }

    /// Public identity, e.g. `sip:1001@sip.example.com`
    pub fn sip_identity(&self) -> String {
        format!("sip:{}@{}", self.username.trim(), self.sip_domain())
    }

    pub fn websocket_uri(&self) -> String {
        if let Some(uri) = self.ws_uri.as_deref().filter(|u| !u.trim().is_empty()) {
            return uri.trim().to_string();
        }
        let path = match self.ws_path.as_deref().map(str::trim) {
            Some(p) if p.is_empty() => DEFAULT_WS_PATH.to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{}", p),
            None => DEFAULT_WS_PATH.to_string(),
        };
        format!(
            "wss://{}:{}{}",
            strip_scheme(self.server.trim()),
            self.port,
            path
        )
    }

    /// STUN servers followed by the TURN relay, if any
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .filter(|uri| !uri.trim().is_empty())
            .map(|uri| IceServer::stun(uri.trim()))
            .collect();
        if let Some(turn) = &self.turn {
            servers.push(IceServer::turn(&turn.uri, &turn.username, &turn.credential));
        }
        servers
    }

    /// Turn a dialled string into a SIP URI.
    ///
    /// `sip:` URIs pass through, `user@host` gains the scheme, and bare
    /// extensions or phone numbers are placed in the account's domain.
    pub fn normalize_target(&self, target: &str) -> SoftphoneResult<String> {
        let trimmed = target.trim();
        let invalid = || SoftphoneError::InvalidTarget {
            target: target.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid());
        }
        if trimmed.starts_with("sip:") || trimmed.starts_with("sips:") {
            return Ok(trimmed.to_string());
        }
        if trimmed.contains('@') {
            return Ok(format!("sip:{}", trimmed));
        }

        let user: String = if is_dialable_number(trimmed) {
            trimmed
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
                .collect()
        } else {
            trimmed.to_string()
        };
        if user.is_empty() || user.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(format!("sip:{}@{}", user, self.sip_domain()))
    }
}

fn strip_scheme(server: &str) -> &str {
    server
        .strip_prefix("sips:")
        .or_else(|| server.strip_prefix("sip:"))
        .or_else(|| server.strip_prefix("wss://"))
        .or_else(|| server.strip_prefix("ws://"))
        .unwrap_or(server)
}

fn is_dialable_number(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '*' | '#' | ' ' | '-' | '.' | '(' | ')'))
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct SoftphoneSettings {
    /// Identity used to look up stored credentials and presence
    pub user_id: String,
    /// How long destructive stack actions are held off around call start/end
    pub guard_window: Duration,
    /// Call duration counter period
    pub tick_interval: Duration,
}

impl Default for SoftphoneSettings {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            guard_window: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl SoftphoneSettings {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_guard_window(mut self, window: Duration) -> Self {
        self.guard_window = window;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> SipEndpointConfig {
        SipEndpointConfig::new("sip.x.com", "1001", "p")
    }

    #[test]
    fn test_validate_reports_every_missing_field() {
        let err = SipEndpointConfig::new("", " ", "").validate().unwrap_err();
        assert_eq!(
            err,
            SoftphoneError::config("missing server, username, password")
        );
        assert!(account().validate().is_ok());
        assert!(account().with_enabled(false).validate().is_err());
        assert!(account().with_port(0).validate().is_err());
    }

    #[test]
    fn test_websocket_uri() {
        assert_eq!(account().websocket_uri(), "wss://sip.x.com:8089/ws");
        assert_eq!(
            account().with_port(443).with_ws_path("sip").websocket_uri(),
            "wss://sip.x.com:443/sip"
        );
        assert_eq!(
            account().with_ws_uri("wss://edge.x.com/ws").websocket_uri(),
            "wss://edge.x.com/ws"
        );
    }

    #[test]
    fn test_identity_uses_domain_when_present() {
        assert_eq!(account().sip_identity(), "sip:1001@sip.x.com");
        assert_eq!(
            account().with_domain("x.com").sip_identity(),
            "sip:1001@x.com"
        );
        let prefixed = SipEndpointConfig::new("sip:pbx.local", "7", "s");
        assert_eq!(prefixed.sip_identity(), "sip:7@pbx.local");
    }

    #[test]
    fn test_normalize_target() {
        let cfg = account();
        assert_eq!(cfg.normalize_target("5551234").unwrap(), "sip:5551234@sip.x.com");
        assert_eq!(
            cfg.normalize_target(" (555) 123-4567 ").unwrap(),
            "sip:5551234567@sip.x.com"
        );
        assert_eq!(cfg.normalize_target("bob@other.com").unwrap(), "sip:bob@other.com");
        assert_eq!(cfg.normalize_target("sip:alice@x.com").unwrap(), "sip:alice@x.com");
        assert!(cfg.normalize_target("   ").is_err());
        assert!(cfg.normalize_target("bob smith").is_err());
    }

    #[test]
    fn test_ice_servers_order() {
        let cfg = account()
            .with_stun_server("stun:stun.l.google.com:19302")
            .with_turn(TurnCredentials {
                uri: "turn:turn.x.com:3478".to_string(),
                username: "u".to_string(),
                credential: "c".to_string(),
            });
        let servers = cfg.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, "stun:stun.l.google.com:19302");
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SoftphoneSettings::new("u-1");
        assert_eq!(settings.user_id, "u-1");
        assert_eq!(settings.guard_window, Duration::from_secs(5));
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
    }
}
