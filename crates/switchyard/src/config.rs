//! Runtime configuration.
//!
//! Defaults are usable as-is; a JSON document can override any subset of
//! fields (durations are given in milliseconds), and a handful of operational
//! knobs can be overridden from the environment:
//!
//! - `SWITCHYARD_INLINE_THRESHOLD`: bytes at which payloads move to shared memory
//! - `SWITCHYARD_CALL_TIMEOUT_MS`: default `call()` timeout
//! - `SWITCHYARD_HEARTBEAT_MS`: heartbeat interval
//! - `SWITCHYARD_MAX_RESTARTS`: restart budget per process
//! - `SWITCHYARD_RUNTIME_DIR`: directory holding the socket files

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { var, value })
        }

        if let Some(v) = lookup("SWITCHYARD_INLINE_THRESHOLD") {
            self.router.inline_threshold = parse("SWITCHYARD_INLINE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_CALL_TIMEOUT_MS") {
            self.router.call_timeout =
                Duration::from_millis(parse("SWITCHYARD_CALL_TIMEOUT_MS", v)?);
        }
        if let Some(v) = lookup("SWITCHYARD_HEARTBEAT_MS") {
            let interval = Duration::from_millis(parse("SWITCHYARD_HEARTBEAT_MS", v)?);
            self.supervisor.heartbeat_interval = interval;
            self.router.heartbeat_interval = Some(interval);
        }
        if let Some(v) = lookup("SWITCHYARD_MAX_RESTARTS") {
            self.supervisor.restart.max_restarts = parse("SWITCHYARD_MAX_RESTARTS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_RUNTIME_DIR") {
            self.supervisor.runtime_dir = PathBuf::from(v);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        let sup = &self.supervisor;
        if sup.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be > 0".into()));
        }
        if sup.degraded_after > sup.terminate_after {
            return Err(ConfigError::Invalid(
                "degraded_after must not exceed terminate_after".into(),
            ));
        }
        if sup.restart.multiplier < 1.0 {
            return Err(ConfigError::Invalid("restart multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Timeout used by `Router::call` when none is given.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Payloads of this many bytes or more travel through shared memory.
    pub inline_threshold: usize,
    /// Largest accepted frame; larger frames reset the connection.
    pub max_frame_length: usize,
    /// Outbound queue depth per channel.
    pub outbound_queue: usize,
    /// Requests and events buffered per peer ahead of its dispatcher. Beyond
    /// this, requests are refused with `reason: "overloaded"`.
    pub inbound_queue: usize,
    /// Per-peer budget for requests and events. `None` disables it.
    pub rate_limit: Option<RateLimit>,
    /// Interval at which this router heartbeats to its peers. Child processes set it.
    #[serde(rename = "heartbeat_interval_ms", with = "opt_millis")]
    pub heartbeat_interval: Option<Duration>,
    pub limits: InputLimits,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            inline_threshold: 64 * 1024,
            max_frame_length: 16 * 1024 * 1024,
            outbound_queue: 256,
            inbound_queue: 1024,
            rate_limit: None,
            heartbeat_interval: None,
            limits: InputLimits::default(),
        }
    }
}

impl RouterConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_limits(mut self, limits: InputLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_inbound_queue(mut self, depth: usize) -> Self {
        self.inbound_queue = depth;
        self
    }

    pub fn with_rate_limit(mut self, limit: Option<RateLimit>) -> Self {
        self.rate_limit = limit;
        self
    }

    /// Inline payloads travel base64-encoded inside a JSON envelope, so the
    /// largest one must still fit in a frame with room for the envelope.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inline_threshold == 0 {
            return Err(ConfigError::Invalid("inline_threshold must be > 0".into()));
        }
        if self.max_frame_length < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_length must be at least 1024 bytes".into(),
            ));
        }
        let inline_frame = self
            .inline_threshold
            .saturating_mul(4)
            .div_ceil(3)
            .saturating_add(ENVELOPE_OVERHEAD);
        if inline_frame >= self.max_frame_length {
            return Err(ConfigError::Invalid(format!(
                "inline_threshold {} does not fit in max_frame_length {} once encoded",
                self.inline_threshold, self.max_frame_length
            )));
        }
        if self.inbound_queue == 0 {
            return Err(ConfigError::Invalid("inbound_queue must be > 0".into()));
        }
        if let Some(limit) = &self.rate_limit
            && (limit.max_requests == 0 || limit.per.is_zero())
        {
            return Err(ConfigError::Invalid(
                "rate_limit needs max_requests > 0 and per_ms > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Room reserved for the envelope around an inline payload.
const ENVELOPE_OVERHEAD: usize = 4096;

/// At most `max_requests` requests and events per `per` from one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    #[serde(rename = "per_ms", with = "millis")]
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, per: Duration) -> Self {
        Self { max_requests, per }
    }
}

/// Structural limits applied to inbound parameters before authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    pub max_depth: usize,
    pub max_string_length: usize,
    pub max_array_length: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_string_length: 64 * 1024,
            max_array_length: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory for per-process socket files.
    pub runtime_dir: PathBuf,
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// Silence after which a process is marked degraded.
    #[serde(rename = "degraded_after_ms", with = "millis")]
    pub degraded_after: Duration,
    /// Silence after which a process is terminated.
    #[serde(rename = "terminate_after_ms", with = "millis")]
    pub terminate_after: Duration,
    /// Time a freshly spawned process has to connect back.
    #[serde(rename = "spawn_timeout_ms", with = "millis")]
    pub spawn_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir().join(format!("switchyard-{}", std::process::id())),
            heartbeat_interval: Duration::from_secs(1),
            degraded_after: Duration::from_secs(3),
            terminate_after: Duration::from_secs(10),
            spawn_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_heartbeat(
        mut self,
        interval: Duration,
        degraded_after: Duration,
        terminate_after: Duration,
    ) -> Self {
        self.heartbeat_interval = interval;
        self.degraded_after = degraded_after;
        self.terminate_after = terminate_after;
        self
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// Restart budget and exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restarts allowed over the lifetime of a process entry; 0 disables restarts.
    pub max_restarts: u32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
