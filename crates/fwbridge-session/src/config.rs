use std::io::Read;
use std::path::Path;
use std::time::Duration;

use fwbridge_transport::{Endpoint, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Largest configuration file [`BridgeConfig::load`] reads.
pub const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

/// Which backend drives the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Binary RPC to the on-device stub.
    AvatarStub,
    /// GDB remote serial protocol to a gdbserver.
    GdbRemote,
    /// A GDB instance speaking the machine interface.
    GdbMi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub kind: TargetKind,
    /// Where the backend connects, e.g. `tcp:127.0.0.1:3333`.
    pub address: String,
    /// For `gdb-mi`: the gdbserver GDB should attach to once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            delay_ms: policy.delay.as_millis() as u64,
            connect_timeout_ms: policy
                .connect_timeout
                .map_or(0, |timeout| timeout.as_millis() as u64),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    /// A zero connect timeout means the OS default.
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts,
            delay: Duration::from_millis(config.delay_ms),
            connect_timeout: (config.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(config.connect_timeout_ms)),
        }
    }
}

/// Bridge settings, read from a JSON document:
///
/// ```json
/// {
///   "target": { "kind": "gdb-remote", "address": "tcp:127.0.0.1:3333" },
///   "gdb_server": "tcp:127.0.0.1:5555",
///   "remote_memory": "tcp:127.0.0.1:3334",
///   "response_timeout_ms": 10000,
///   "retry": { "attempts": 10, "delay_ms": 3000, "connect_timeout_ms": 10000 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub target: TargetConfig,
    /// Serve the target to GDB at this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdb_server: Option<String>,
    /// Emulator plugin to connect the JSON side-channel to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_memory: Option<String>,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn endpoint(field: &str, address: &str) -> Result<Endpoint> {
    address
        .parse()
        .map_err(|err| SessionError::Config(format!("{field}: {err}")))
}

impl BridgeConfig {
    pub fn new(kind: TargetKind, address: impl Into<String>) -> Self {
        Self {
            target: TargetConfig {
                kind,
                address: address.into(),
                attach: None,
            },
            gdb_server: None,
            remote_memory: None,
            response_timeout_ms: default_response_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|err| {
            SessionError::Config(format!("failed opening {}: {err}", path.display()))
        })?;
        let size = file.metadata()?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(SessionError::Config(format!(
                "{} is too large ({size} bytes)",
                path.display()
            )));
        }
        let mut text = String::new();
        file.take(MAX_CONFIG_FILE_SIZE + 1).read_to_string(&mut text)?;
        if text.len() as u64 > MAX_CONFIG_FILE_SIZE {
            return Err(SessionError::Config(format!(
                "{} grew while reading",
                path.display()
            )));
        }
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.target_endpoint()?;
        self.attach_endpoint()?;
        self.gdb_server_endpoint()?;
        self.remote_memory_endpoint()?;
        if self.target.attach.is_some() && self.target.kind != TargetKind::GdbMi {
            return Err(SessionError::Config(
                "target.attach only applies to gdb-mi".into(),
            ));
        }
        if self.response_timeout_ms == 0 {
            return Err(SessionError::Config(
                "response_timeout_ms must be positive".into(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(SessionError::Config("retry.attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn target_endpoint(&self) -> Result<Endpoint> {
        endpoint("target.address", &self.target.address)
    }

    pub fn attach_endpoint(&self) -> Result<Option<Endpoint>> {
        self.target
            .attach
            .as_deref()
            .map(|address| endpoint("target.attach", address))
            .transpose()
    }

    pub fn gdb_server_endpoint(&self) -> Result<Option<Endpoint>> {
        self.gdb_server
            .as_deref()
            .map(|address| endpoint("gdb_server", address))
            .transpose()
    }

    pub fn remote_memory_endpoint(&self) -> Result<Option<Endpoint>> {
        self.remote_memory
            .as_deref()
            .map(|address| endpoint("remote_memory", address))
            .transpose()
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "fwbridge-config-{}-{}-{name}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn minimal_document_takes_defaults() {
        let config = BridgeConfig::from_json(
            r#"{"target": {"kind": "avatar-stub", "address": "tcp:127.0.0.1:4000"}}"#,
        )
        .expect("should parse");
        assert_eq!(config.target.kind, TargetKind::AvatarStub);
        assert_eq!(config.response_timeout(), Duration::from_secs(10));
        let retry = config.retry_policy();
        assert_eq!(retry.attempts, 10);
        assert_eq!(retry.delay, Duration::from_secs(3));
        assert_eq!(retry.connect_timeout, Some(Duration::from_secs(10)));
        assert!(config.gdb_server_endpoint().expect("should parse").is_none());
    }

    #[test]
    fn full_document() {
        let config = BridgeConfig::from_json(
            r#"{
                "target": {"kind": "gdb-mi", "address": "tcp:127.0.0.1:4000", "attach": "tcp:127.0.0.1:3333"},
                "gdb_server": "tcp:127.0.0.1:5555",
                "remote_memory": "unix:/tmp/fwbridge-memory.sock",
                "response_timeout_ms": 500,
                "retry": {"attempts": 2, "delay_ms": 10, "connect_timeout_ms": 0}
            }"#,
        )
        .expect("should parse");
        assert_eq!(
            config.attach_endpoint().expect("should parse"),
            Some(Endpoint::tcp("127.0.0.1", 3333))
        );
        assert_eq!(
            config.remote_memory_endpoint().expect("should parse"),
            Some(Endpoint::unix("/tmp/fwbridge-memory.sock"))
        );
        let retry = config.retry_policy();
        assert_eq!(retry.attempts, 2);
        assert_eq!(retry.connect_timeout, None);
    }

    #[test]
    fn rejects_bad_documents() {
        for text in [
            r#"{"target": {"kind": "jtag", "address": "tcp:127.0.0.1:1"}}"#,
            r#"{"target": {"kind": "gdb-remote", "address": "tcp:127.0.0.1:1"}, "extra": 1}"#,
        ] {
            let err = BridgeConfig::from_json(text).expect_err("should reject");
            assert!(matches!(err, SessionError::Json(_)), "{text}: {err}");
        }
        for text in [
            r#"{"target": {"kind": "gdb-remote", "address": "unix:"}}"#,
            r#"{"target": {"kind": "gdb-remote", "address": "tcp:127.0.0.1:1", "attach": "tcp:127.0.0.1:2"}}"#,
            r#"{"target": {"kind": "gdb-remote", "address": "tcp:127.0.0.1:1"}, "response_timeout_ms": 0}"#,
        ] {
            let err = BridgeConfig::from_json(text).expect_err("should reject");
            assert!(matches!(err, SessionError::Config(_)), "{text}: {err}");
        }
    }

    #[test]
    fn load_reads_file_and_enforces_limit() {
        let path = temp_path("ok.json");
        let config = BridgeConfig::new(TargetKind::GdbRemote, "tcp:127.0.0.1:3333");
        std::fs::write(&path, serde_json::to_string(&config).expect("should serialize"))
            .expect("should write");
        assert_eq!(BridgeConfig::load(&path).expect("should load"), config);
        std::fs::remove_file(&path).expect("should clean up");

        let path = temp_path("big.json");
        std::fs::write(&path, vec![b' '; MAX_CONFIG_FILE_SIZE as usize + 1]).expect("should write");
        let err = BridgeConfig::load(&path).expect_err("should reject");
        assert!(matches!(err, SessionError::Config(_)));
        std::fs::remove_file(&path).expect("should clean up");

        let err = BridgeConfig::load(&temp_path("missing.json")).expect_err("should fail");
        assert!(matches!(err, SessionError::Config(_)));
    }
}
