use crate::dispatch::{Inbox, Mailbox};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// What to do when a payload buffer cannot be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Stop serving so the process can be restarted.
    RestartOnExhaustion,
    /// Drop the frame and keep the connection. After `max_consecutive`
    /// failures in a row the exhaustion is treated as systemic and handled
    /// like `RestartOnExhaustion`.
    DropFrameOnExhaustion { max_consecutive: u32 },
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::DropFrameOnExhaustion { max_consecutive: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionMode {
    Restart,
    DropFrame,
}

/// Server configuration, usually read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// Bound on every receive, during the handshake and while open.
    pub receive_timeout_ms: u64,
    /// Bound on every frame write and on closing the transport.
    pub send_timeout_ms: u64,
    /// Optional bound on waiting for the next connection.
    pub accept_timeout_ms: Option<u64>,
    pub mailbox_capacity: usize,
    pub queue_full_wait_ms: u64,
    /// Bytes of payload that may be held at once across the decoder, the
    /// mailbox and consumers.
    pub payload_budget: usize,
    pub exhaustion: ExhaustionMode,
    pub max_consecutive_exhaustion: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9998,
            receive_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
            accept_timeout_ms: None,
            mailbox_capacity: 10,
            queue_full_wait_ms: 100,
            payload_budget: 16 * 1024,
            exhaustion: ExhaustionMode::DropFrame,
            max_consecutive_exhaustion: 8,
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(Error::Config("mailbox_capacity must be at least 1".into()));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive_timeout_ms must be positive".into()));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::Config("send_timeout_ms must be positive".into()));
        }
        if self.exhaustion == ExhaustionMode::DropFrame && self.max_consecutive_exhaustion == 0 {
            return Err(Error::Config(
                "max_consecutive_exhaustion must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }

    pub fn queue_full_wait(&self) -> Duration {
        Duration::from_millis(self.queue_full_wait_ms)
    }

    pub fn exhaustion_policy(&self) -> ExhaustionPolicy {
        match self.exhaustion {
            ExhaustionMode::Restart => ExhaustionPolicy::RestartOnExhaustion,
            ExhaustionMode::DropFrame => ExhaustionPolicy::DropFrameOnExhaustion {
                max_consecutive: self.max_consecutive_exhaustion,
            },
        }
    }

    /// Creates the dispatch queue described by this configuration.
    pub fn mailbox(&self) -> (Mailbox, Inbox) {
        Mailbox::new(self.mailbox_capacity, self.queue_full_wait())
    }
}
