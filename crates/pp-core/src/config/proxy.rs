//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use pp_protocol::{FrameCodec, PayloadEncoding, TerminalSize, DEFAULT_MAX_PAYLOAD_SIZE};

use super::serde_utils::{duration_millis, duration_secs, option_duration_secs};
use crate::error::ConfigError;
use crate::types::CommandSpec;

/// Heartbeat pings carry a u64 timestamp
const PING_PAYLOAD_LEN: usize = 8;

/// Top-level configuration shared by master and slave
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Wire protocol settings (must match on both ends)
    pub protocol: ProtocolConfig,
    /// Session timing
    pub session: SessionConfig,
    /// Slave-side settings
    pub slave: SlaveConfig,
}

/// Wire protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How `Data`/`Ping`/`Pong` payloads travel
    pub payload_encoding: PayloadEncoding,
    /// Ceiling on a single frame's on-wire payload
    pub max_payload_size: usize,
    /// Bytes read from a local source per `Data` frame
    pub read_chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            payload_encoding: PayloadEncoding::Raw,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_chunk_size: 4096,
        }
    }
}

impl ProtocolConfig {
    /// Build the frame codec these settings describe
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new()
            .with_encoding(self.payload_encoding)
            .with_max_payload_size(self.max_payload_size)
    }

    /// Read size for local sources, capped so one read always fits one frame
    pub fn chunk_size(&self) -> usize {
        self.read_chunk_size.min(self.codec().max_data_chunk()).max(1)
    }
}

/// Session timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for the peer's handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval between keepalive pings (master only; None = never)
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<Duration>,

    /// Give up when no frame arrives for this long (None = wait forever)
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<Duration>,

    /// How long to keep draining PTY output after the child exits
    #[serde(with = "duration_millis")]
    pub exit_drain_timeout: Duration,

    /// How often the slave checks whether the child has exited
    #[serde(with = "duration_millis")]
    pub child_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            heartbeat_timeout: None,
            exit_drain_timeout: Duration::from_millis(200),
            child_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Slave-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Command to run under the PTY
    pub command: CommandSpec,
    /// Environment variables added to every command
    pub env: Vec<(String, String)>,
    /// Initial PTY size
    pub initial_size: TerminalSize,
    /// Put the PTY line discipline in raw mode
    pub raw_mode: bool,
    /// Print the readiness marker before the handshake
    pub greeting: bool,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::default(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            initial_size: TerminalSize::default(),
            raw_mode: false,
            greeting: false,
        }
    }
}

impl SlaveConfig {
    /// The command with the default environment applied underneath its own
    pub fn resolved_command(&self, command: Option<CommandSpec>) -> CommandSpec {
        let mut command = command.unwrap_or_else(|| self.command.clone());
        let mut env = self.env.clone();
        env.append(&mut command.env);
        command.env = env;
        command
    }
}

impl ProxyConfig {
    /// Check values that would make a session unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.max_payload_size < 4 {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_payload_size must be at least 4, got {}",
                self.protocol.max_payload_size
            )));
        }
        if self.protocol.read_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "protocol.read_chunk_size must be positive".to_string(),
            ));
        }
        if self.session.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "session.handshake_timeout must be positive".to_string(),
            ));
        }
        if self.session.child_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "session.child_poll_interval must be positive".to_string(),
            ));
        }
        if self.session.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid(
                "session.heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.session.heartbeat_interval.is_some() {
            let ping_len = self.protocol.payload_encoding.wire_len(PING_PAYLOAD_LEN);
            if ping_len > self.protocol.max_payload_size {
                return Err(ConfigError::Invalid(format!(
                    "protocol.max_payload_size must be at least {} for heartbeats, got {}",
                    ping_len, self.protocol.max_payload_size
                )));
            }
        }
        if self.slave.command.program.is_empty() {
            return Err(ConfigError::Invalid("slave.command.program is empty".to_string()));
        }
        Ok(())
    }
}
