//! Configuration of a peer.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::{DEFAULT_COMM_SIZE, DEFAULT_SLOTS, Geometry};
use crate::pipeline::PipelineConfig;

/// Environment variable naming the shared segment.
pub const ENV_SHM_NAME: &str = "URPC_SHM_NAME";
/// Environment variable with the core to pin the accelerator thread to.
pub const ENV_CORE: &str = "URPC_CORE";
/// Environment variable overriding the pipeline in-flight depth.
pub const ENV_MAX_INFLIGHT: &str = "URPC_MAX_INFLIGHT";
/// Environment variable overriding the reply timeout, in milliseconds.
pub const ENV_REPLY_TIMEOUT_MS: &str = "URPC_REPLY_TIMEOUT_MS";

/// Peer configuration.
///
/// Both sides of a link must agree on `slots` and `comm_size`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the shared segment.
    /// Default: None
    pub shm_name: Option<String>,
    /// Core to pin the accelerator side to.
    /// Default: None
    pub core: Option<usize>,
    /// Mailbox slots per communicator, a power of two.
    /// Default: 256
    pub slots: u32,
    /// Bytes per communicator block.
    /// Default: 64 MiB
    pub comm_size: usize,
    /// Entries the receive pipeline takes in per progress pass.
    /// Default: 8
    pub max_inflight: usize,
    /// Timeout for ordinary replies.
    /// Default: 2 s
    pub reply_timeout: Duration,
    /// Multiplier of `reply_timeout` for replies to remote calls.
    /// Default: 150
    pub call_timeout_factor: u32,
    /// How long an allocation keeps collecting before giving up.
    /// Default: 60 s
    pub alloc_timeout: Duration,
    /// How long a publish waits for its slot to be freed.
    /// Default: 10 s
    pub publish_timeout: Duration,
    /// How long attaching waits for the other side.
    /// Default: 50 s
    pub attach_timeout: Duration,
    /// Payloads up to this many bytes bypass the DMA engine.
    /// Default: 16
    pub inline_threshold: usize,
    /// Byte cap of a coalesced transfer.
    /// Default: 1 MiB
    pub max_coalesced_size: usize,
    /// Entry cap of a coalesced transfer.
    /// Default: 32
    pub max_coalesced_reqs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_name: None,
            core: None,
            slots: DEFAULT_SLOTS,
            comm_size: DEFAULT_COMM_SIZE,
            max_inflight: 8,
            reply_timeout: Duration::from_secs(2),
            call_timeout_factor: 150,
            alloc_timeout: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(10),
            attach_timeout: Duration::from_secs(50),
            inline_threshold: 16,
            max_coalesced_size: 1 << 20,
            max_coalesced_reqs: 32,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `URPC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(name) = lookup(ENV_SHM_NAME) {
            self.shm_name = Some(name);
        }
        if let Some(v) = lookup(ENV_CORE) {
            self.core = Some(parse(ENV_CORE, &v)?);
        }
        if let Some(v) = lookup(ENV_MAX_INFLIGHT) {
            self.max_inflight = parse(ENV_MAX_INFLIGHT, &v)?;
        }
        if let Some(v) = lookup(ENV_REPLY_TIMEOUT_MS) {
            self.reply_timeout = Duration::from_millis(parse(ENV_REPLY_TIMEOUT_MS, &v)?);
        }
        Ok(self)
    }

    /// Set the segment name.
    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = Some(name.into());
        self
    }

    /// Set the core to pin to.
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    /// Set the mailbox slot count.
    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    /// Set the communicator block size.
    pub fn with_comm_size(mut self, comm_size: usize) -> Self {
        self.comm_size = comm_size;
        self
    }

    /// Set the in-flight depth.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    /// Set the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the allocation timeout.
    pub fn with_alloc_timeout(mut self, timeout: Duration) -> Self {
        self.alloc_timeout = timeout;
        self
    }

    /// Set the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set the attach timeout.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Set the coalescing caps.
    pub fn with_coalescing(mut self, max_size: usize, max_reqs: usize) -> Self {
        self.max_coalesced_size = max_size;
        self.max_coalesced_reqs = max_reqs;
        self
    }

    /// Timeout for replies to remote calls.
    pub fn call_timeout(&self) -> Duration {
        self.reply_timeout.saturating_mul(self.call_timeout_factor)
    }

    /// Checks the settings and returns the segment geometry.
    pub fn validate(&self) -> Result<Geometry> {
        let geo = Geometry::new(self.slots, self.comm_size)?;
        if self.max_inflight == 0 || self.max_inflight > self.slots as usize {
            return Err(Error::Config(format!(
                "max_inflight {} must be within 1..={}",
                self.max_inflight, self.slots
            )));
        }
        if self.max_coalesced_reqs == 0 {
            return Err(Error::Config("max_coalesced_reqs must be positive".into()));
        }
        Ok(geo)
    }

    pub(crate) fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            inline_threshold: self.inline_threshold,
            max_coalesced_size: self.max_coalesced_size,
            max_coalesced_reqs: self.max_coalesced_reqs,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={value:?} is not a valid value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::new();
        assert_eq!(c.slots, 256);
        assert_eq!(c.comm_size, 64 << 20);
        assert_eq!(c.max_inflight, 8);
        assert_eq!(c.call_timeout(), Duration::from_secs(300));
        assert!(c.validate().is_ok());
        let c = c.with_reply_timeout(Duration::from_millis(10));
        assert_eq!(c.call_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SHM_NAME, "/urpc_seg"),
            (ENV_CORE, "3"),
            (ENV_MAX_INFLIGHT, " 16 "),
            (ENV_REPLY_TIMEOUT_MS, "250"),
        ]
        .into();
        let c = Config::new()
            .with_lookup(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.shm_name.as_deref(), Some("/urpc_seg"));
        assert_eq!(c.core, Some(3));
        assert_eq!(c.max_inflight, 16);
        assert_eq!(c.reply_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_malformed_value() {
        let err = Config::new()
            .with_lookup(|k| (k == ENV_MAX_INFLIGHT).then(|| "eight".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains(ENV_MAX_INFLIGHT)));
    }

    #[test]
    fn test_validate() {
        assert!(Config::new().with_slots(100).validate().is_err());
        assert!(Config::new().with_max_inflight(0).validate().is_err());
        assert!(Config::new().with_max_inflight(512).validate().is_err());
        assert!(Config::new().with_coalescing(1 << 20, 0).validate().is_err());
        let geo = Config::new()
            .with_slots(16)
            .with_comm_size(1 << 16)
            .validate()
            .unwrap();
        assert_eq!(geo.data_len(), (1 << 16) - 24 - 128);
    }
}
