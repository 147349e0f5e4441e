use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ShcError, ShcResult};

/// Top-level client configuration (loaded from shadowchat.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShcConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    pub crypto: CryptoConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl ShcConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> ShcResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| ShcError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> ShcResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::debug!(path = %p.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP(S) origin of the chat server
    pub base_url: String,
    /// Path of the realtime socket endpoint
    pub socket_path: String,
    /// Refuse plaintext http:// and ws:// origins
    pub enforce_tls: bool,
}

impl ServerConfig {
    /// Realtime endpoint derived from `base_url`: http becomes ws, https becomes wss.
    pub fn socket_url(&self) -> ShcResult<String> {
        let base = self.base_url.trim_end_matches('/');
        let rest = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            if self.enforce_tls {
                return Err(ShcError::Config(format!(
                    "enforce_tls is set but base_url is plaintext: {base}"
                )));
            }
            format!("ws://{rest}")
        } else {
            return Err(ShcError::Config(format!(
                "base_url must start with http:// or https://: {base}"
            )));
        };
        Ok(format!("{rest}{}", self.socket_path))
    }

    /// Join an API path onto `base_url`.
    pub fn http_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            socket_path: "/api/socket".into(),
            enforce_tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Reconnect behaviour: "retry" (bounded backoff, then stop) or "reload"
    pub reconnect: String,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect: "retry".into(),
            max_reconnect_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory holding the resumable upload store
    pub state_path: PathBuf,
    /// Maximum chunks in flight per upload
    pub concurrency: usize,
    /// Chunk size proposed to the server; the server may override it
    pub proposed_chunk_size: u64,
    /// Per-request timeout for chunk uploads
    pub request_timeout_secs: u64,
    /// Attempts per chunk before the upload is paused
    pub chunk_retries: u32,
    /// Completed and failed tasks older than this are swept
    pub retention_hours: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("~/.local/share/shadowchat/uploads"),
            concurrency: 3,
            proposed_chunk_size: 1024 * 1024,
            request_timeout_secs: 60,
            chunk_retries: 3,
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 rounds for the password wrapping key
    pub pbkdf2_iterations: u32,
    /// RSA modulus size for newly generated identities
    pub rsa_bits: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            rsa_bits: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where the saved login (username, auth token, wrapping key) lives
    pub credentials_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("~/.config/shadowchat/session.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
base_url = "https://chat.example.com"
socket_path = "/ws"
enforce_tls = true

[transport]
reconnect = "reload"
max_reconnect_attempts = 8

[transfer]
state_path = "/var/lib/shadowchat/uploads"
concurrency = 6
proposed_chunk_size = 524288
chunk_retries = 5

[crypto]
pbkdf2_iterations = 200000
rsa_bits = 3072

[logging]
level = "debug"
format = "json"
"#;
        let config: ShcConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.server.base_url, "https://chat.example.com");
        assert!(config.server.enforce_tls);
        assert_eq!(config.transport.reconnect, "reload");
        assert_eq!(config.transport.max_reconnect_attempts, 8);
        assert_eq!(
            config.transfer.state_path,
            PathBuf::from("/var/lib/shadowchat/uploads")
        );
        assert_eq!(config.transfer.concurrency, 6);
        assert_eq!(config.transfer.proposed_chunk_size, 524288);
        assert_eq!(config.crypto.pbkdf2_iterations, 200_000);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: ShcConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.base_url, "http://localhost:8080");
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.transfer.concurrency, 3);
        assert_eq!(config.transfer.proposed_chunk_size, 1024 * 1024);
        assert_eq!(config.transfer.retention_hours, 24);
        assert_eq!(config.crypto.pbkdf2_iterations, 100_000);
        assert_eq!(config.crypto.rsa_bits, 2048);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
concurrency = 1
"#;
        let config: ShcConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.concurrency, 1);
        // Defaults
        assert_eq!(config.transfer.chunk_retries, 3);
        assert_eq!(config.server.socket_path, "/api/socket");
    }

    #[test]
    fn test_socket_url_scheme_mapping() {
        let mut server = ServerConfig::default();
        assert_eq!(server.socket_url().unwrap(), "ws://localhost:8080/api/socket");

        server.base_url = "https://chat.example.com/".into();
        assert_eq!(
            server.socket_url().unwrap(),
            "wss://chat.example.com/api/socket"
        );

        server.base_url = "http://chat.example.com".into();
        server.enforce_tls = true;
        assert!(server.socket_url().is_err());

        server.base_url = "ftp://nope".into();
        assert!(server.socket_url().is_err());
    }

    #[test]
    fn test_http_url_join() {
        let server = ServerConfig {
            base_url: "http://localhost:8080/".into(),
            ..Default::default()
        };
        assert_eq!(
            server.http_url("/api/upload/init"),
            "http://localhost:8080/api/upload/init"
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadowchat.toml");
        std::fs::write(&path, "[crypto]\nrsa_bits = 4096\n").unwrap();

        let config = ShcConfig::load(&path).unwrap();
        assert_eq!(config.crypto.rsa_bits, 4096);

        let missing = dir.path().join("absent.toml");
        let config = ShcConfig::load_or_default(Some(&missing)).unwrap();
        assert_eq!(config.crypto.rsa_bits, 2048);

        std::fs::write(&path, "[crypto\n").unwrap();
        assert!(matches!(ShcConfig::load(&path), Err(ShcError::Config(_))));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ShcConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ShcConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.base_url, parsed.server.base_url);
        assert_eq!(config.transfer.state_path, parsed.transfer.state_path);
    }
}
