use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / proctor.toml / env vars)
// =============================================================================
//
//   proctor.toml:    [breaker]
//                    failure_threshold = 3
//
//   env var:         PROCTOR_BREAKER__FAILURE_THRESHOLD=3   (double underscore = nesting)

/// Name of the config file looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "proctor.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub multiplexer: MultiplexerFileConfig,
    #[serde(default)]
    pub breaker: BreakerFileConfig,
    #[serde(default)]
    pub progress: ProgressFileConfig,
    #[serde(default)]
    pub recovery: RecoveryFileConfig,
}

/// Lives under `[multiplexer]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiplexerFileConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for MultiplexerFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

/// Lives under `[breaker]`. Applies to every breaker created without an
/// explicit config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerFileConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,
}

impl Default for BreakerFileConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            monitoring_window_ms: default_monitoring_window_ms(),
        }
    }
}

/// Lives under `[progress]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressFileConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,
}

impl Default for ProgressFileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            autosave_interval_secs: default_autosave_interval_secs(),
        }
    }
}

/// Lives under `[recovery]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryFileConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ticket_ttl_secs")]
    pub ticket_ttl_secs: u64,
}

impl Default for RecoveryFileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            ticket_ttl_secs: default_ticket_ttl_secs(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_cleanup_interval_secs() -> u64 {
    30
}
fn default_inactivity_timeout_secs() -> u64 {
    30
}
fn default_event_queue_capacity() -> usize {
    256
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    60_000
}
fn default_monitoring_window_ms() -> u64 {
    120_000
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_autosave_interval_secs() -> u64 {
    30
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_ticket_ttl_secs() -> u64 {
    3600
}

/// Build a figment that layers: defaults → proctor.toml → PROCTOR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PROCTOR_PROGRESS__DEBOUNCE_MS=500`  →  `progress.debounce_ms = 500`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed("PROCTOR_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Connection sharing and reconnection behavior.
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Fixed wait before rebuilding a transport that closed unexpectedly
    pub reconnect_delay: Duration,
    /// Period of the idle-connection sweep
    pub cleanup_interval: Duration,
    /// Zero-subscriber connections idle longer than this are torn down
    pub inactivity_timeout: Duration,
    /// Per-connection event queue capacity
    pub event_queue_capacity: usize,
}

impl MultiplexerConfig {
    pub fn from_file(fc: &MultiplexerFileConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            cleanup_interval: Duration::from_secs(fc.cleanup_interval_secs),
            inactivity_timeout: Duration::from_secs(fc.inactivity_timeout_secs),
            event_queue_capacity: fc.event_queue_capacity.max(1),
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::from_file(&MultiplexerFileConfig::default())
    }
}

/// Circuit breaker thresholds.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Failures (since the last success) that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed
    pub recovery_timeout: Duration,
    /// Sliding window used for the reported failure rate
    pub monitoring_window: Duration,
}

impl BreakerConfig {
    pub fn from_file(fc: &BreakerFileConfig) -> Self {
        Self {
            failure_threshold: fc.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(fc.recovery_timeout_ms),
            monitoring_window: Duration::from_millis(fc.monitoring_window_ms),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from_file(&BreakerFileConfig::default())
    }
}

/// Debounce and fallback flush timing for the progress store.
#[derive(Clone, Debug)]
pub struct ProgressConfig {
    /// Quiet period after the last update before a save
    pub debounce: Duration,
    /// Upper bound between saves under continuous activity
    pub autosave_interval: Duration,
}

impl ProgressConfig {
    pub fn from_file(fc: &ProgressFileConfig) -> Self {
        Self {
            debounce: Duration::from_millis(fc.debounce_ms),
            autosave_interval: Duration::from_secs(fc.autosave_interval_secs.max(1)),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self::from_file(&ProgressFileConfig::default())
    }
}

/// Backoff and ticket lifetime for finalize recovery.
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub ticket_ttl: Duration,
}

impl RecoveryConfig {
    pub fn from_file(fc: &RecoveryFileConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(fc.base_delay_ms),
            max_delay: Duration::from_millis(fc.max_delay_ms),
            max_attempts: fc.max_attempts.max(1),
            ticket_ttl: Duration::from_secs(fc.ticket_ttl_secs),
        }
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::from_file(&RecoveryFileConfig::default())
    }
}

/// All runtime configs, resolved from one `FileConfig`.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    pub multiplexer: MultiplexerConfig,
    pub breaker: BreakerConfig,
    pub progress: ProgressConfig,
    pub recovery: RecoveryConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            multiplexer: MultiplexerConfig::from_file(&fc.multiplexer),
            breaker: BreakerConfig::from_file(&fc.breaker),
            progress: ProgressConfig::from_file(&fc.progress),
            recovery: RecoveryConfig::from_file(&fc.recovery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::from_file(&FileConfig::default());
        assert_eq!(config.multiplexer.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.progress.debounce, Duration::from_secs(2));
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.recovery.ticket_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = RecoveryConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| config.backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let config = RecoveryConfig::default();
        assert_eq!(config.backoff_delay(u32::MAX), config.max_delay);
        assert_eq!(config.backoff_delay(0), config.base_delay);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[breaker]\nfailure_threshold = 3\n\n[progress]\ndebounce_ms = 500\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(dir.path()).extract().unwrap();
        assert_eq!(fc.breaker.failure_threshold, 3);
        assert_eq!(fc.progress.debounce_ms, 500);
        // Untouched sections keep their defaults
        assert_eq!(fc.recovery.max_attempts, 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(dir.path()).extract().unwrap();
        assert_eq!(fc.multiplexer.event_queue_capacity, 256);
    }
}
