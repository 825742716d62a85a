//! Orchestrator configuration.
//!
//! Read from the `[plugins]` table of a TOML document:
//!
//! ```toml
//! [plugins]
//! start_parallelism = 8
//! unload_parallelism = 4
//! init_timeout = "5s"
//! start_timeout = "5s"
//! stop_timeout = "10s"
//! unload_total_timeout = "1m"
//! worker_grace = "200ms"
//! ```
//!
//! Durations accept `ns`, `us`, `ms`, `s`, `m` and `h` suffixes, or a bare
//! integer number of seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of plugins started concurrently within a level.
pub const DEFAULT_START_PARALLELISM: usize = 8;
/// Default number of plugins stopped concurrently within a level.
pub const DEFAULT_UNLOAD_PARALLELISM: usize = 4;
/// Upper bound for [`OrchestratorConfig::unload_parallelism`].
pub const MAX_UNLOAD_PARALLELISM: usize = 16;
/// Upper bound for [`OrchestratorConfig::start_parallelism`].
pub const MAX_START_PARALLELISM: usize = 1024;

/// Default deadline for a single init, start or stop call.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for a whole unload pass.
pub const DEFAULT_UNLOAD_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default wait for a timed-out worker to report that it finished.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_millis(200);

const PHASE_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(60));
const STOP_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(120));
const UNLOAD_TOTAL_RANGE: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(300));
const MAX_WORKER_GRACE: Duration = Duration::from_secs(5);

/// Errors loading an [`OrchestratorConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid TOML or has mistyped values.
    #[error("invalid orchestrator configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// OrchestratorConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Parallelism limits and deadlines for startup and shutdown.
///
/// Values are used as given by the orchestrators. [`PluginManager`] applies
/// [`clamped`](Self::clamped) once on construction so deployments cannot
/// configure a zero or runaway deadline.
///
/// [`PluginManager`]: crate::PluginManager
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trellis_lifecycle::OrchestratorConfig;
///
/// let config = OrchestratorConfig::default()
///     .with_start_parallelism(4)
///     .with_stop_timeout(Duration::from_secs(10));
///
/// assert_eq!(config.start_parallelism, 4);
/// assert_eq!(config.init_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Plugins started concurrently within one level.
    pub start_parallelism: usize,
    /// Plugins stopped concurrently within one level.
    pub unload_parallelism: usize,
    /// Deadline for `initialize`.
    #[serde(with = "duration_str")]
    pub init_timeout: Duration,
    /// Deadline for `start`.
    #[serde(with = "duration_str")]
    pub start_timeout: Duration,
    /// Deadline for `stop`, and for resource cleanup during rollback.
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    /// Deadline for an entire unload pass.
    #[serde(with = "duration_str")]
    pub unload_total_timeout: Duration,
    /// How long to wait for a timed-out worker before reporting it leaked.
    #[serde(with = "duration_str")]
    pub worker_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_parallelism: DEFAULT_START_PARALLELISM,
            unload_parallelism: DEFAULT_UNLOAD_PARALLELISM,
            init_timeout: DEFAULT_PHASE_TIMEOUT,
            start_timeout: DEFAULT_PHASE_TIMEOUT,
            stop_timeout: DEFAULT_PHASE_TIMEOUT,
            unload_total_timeout: DEFAULT_UNLOAD_TOTAL_TIMEOUT,
            worker_grace: DEFAULT_WORKER_GRACE,
        }
    }
}

impl OrchestratorConfig {
    /// Parses the `[plugins]` table of a TOML document. A missing table
    /// yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] for malformed documents or values.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Document {
            #[serde(default)]
            plugins: OrchestratorConfig,
        }

        let parsed: Document = toml::from_str(document)?;
        Ok(parsed.plugins)
    }

    /// Pulls every value into its supported range.
    ///
    /// Zero values fall back to their defaults. Out-of-range values are
    /// clamped with a warning.
    #[must_use]
    pub fn clamped(self) -> Self {
        let unload_parallelism = if self.unload_parallelism == 0 {
            DEFAULT_UNLOAD_PARALLELISM
        } else if self.unload_parallelism > MAX_UNLOAD_PARALLELISM {
            tracing::warn!(
                configured = self.unload_parallelism,
                max = MAX_UNLOAD_PARALLELISM,
                "unload_parallelism too high, clamping"
            );
            MAX_UNLOAD_PARALLELISM
        } else {
            self.unload_parallelism
        };

        let start_parallelism = if self.start_parallelism == 0 {
            DEFAULT_START_PARALLELISM
        } else if self.start_parallelism > MAX_START_PARALLELISM {
            tracing::warn!(
                configured = self.start_parallelism,
                max = MAX_START_PARALLELISM,
                "start_parallelism too high, clamping"
            );
            MAX_START_PARALLELISM
        } else {
            self.start_parallelism
        };

        let worker_grace = if self.worker_grace.is_zero() {
            DEFAULT_WORKER_GRACE
        } else if self.worker_grace > MAX_WORKER_GRACE {
            tracing::warn!(
                configured = ?self.worker_grace,
                max = ?MAX_WORKER_GRACE,
                "worker_grace too long, clamping"
            );
            MAX_WORKER_GRACE
        } else {
            self.worker_grace
        };

        Self {
            start_parallelism,
            unload_parallelism,
            init_timeout: clamp_duration(
                "init_timeout",
                self.init_timeout,
                DEFAULT_PHASE_TIMEOUT,
                PHASE_TIMEOUT_RANGE,
            ),
            start_timeout: clamp_duration(
                "start_timeout",
                self.start_timeout,
                DEFAULT_PHASE_TIMEOUT,
                PHASE_TIMEOUT_RANGE,
            ),
            stop_timeout: clamp_duration(
                "stop_timeout",
                self.stop_timeout,
                DEFAULT_PHASE_TIMEOUT,
                STOP_TIMEOUT_RANGE,
            ),
            unload_total_timeout: clamp_duration(
                "unload_total_timeout",
                self.unload_total_timeout,
                DEFAULT_UNLOAD_TOTAL_TIMEOUT,
                UNLOAD_TOTAL_RANGE,
            ),
            worker_grace,
        }
    }

    /// Sets [`start_parallelism`](Self::start_parallelism).
    #[must_use]
    pub fn with_start_parallelism(mut self, parallelism: usize) -> Self {
        self.start_parallelism = parallelism;
        self
    }

    /// Sets [`unload_parallelism`](Self::unload_parallelism).
    #[must_use]
    pub fn with_unload_parallelism(mut self, parallelism: usize) -> Self {
        self.unload_parallelism = parallelism;
        self
    }

    /// Sets [`init_timeout`](Self::init_timeout).
    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Sets [`start_timeout`](Self::start_timeout).
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Sets [`stop_timeout`](Self::stop_timeout).
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets [`unload_total_timeout`](Self::unload_total_timeout).
    #[must_use]
    pub fn with_unload_total_timeout(mut self, timeout: Duration) -> Self {
        self.unload_total_timeout = timeout;
        self
    }

    /// Sets [`worker_grace`](Self::worker_grace).
    #[must_use]
    pub fn with_worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }
}

fn clamp_duration(
    field: &'static str,
    value: Duration,
    default: Duration,
    (min, max): (Duration, Duration),
) -> Duration {
    if value.is_zero() {
        return default;
    }
    if value < min {
        tracing::warn!(field, configured = ?value, min = ?min, "timeout too short, clamping");
        return min;
    }
    if value > max {
        tracing::warn!(field, configured = ?value, max = ?max, "timeout too long, clamping");
        return max;
    }
    value
}

// ─────────────────────────────────────────────────────────────────────────────
// Duration (de)serialization
// ─────────────────────────────────────────────────────────────────────────────

/// Human-readable durations: `"250ms"`, `"5s"`, `"2m"`, `"1h"` or bare seconds.
///
/// Rendering picks the largest unit that represents the value exactly, so a
/// rendered duration always parses back to the same value.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&render(*value))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{text}': expected a number"))?;
        let scaled = |factor: u64| {
            amount
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("invalid duration '{text}': value too large"))
        };
        match unit.trim() {
            "ns" => Ok(Duration::from_nanos(amount)),
            "us" => Ok(Duration::from_micros(amount)),
            "ms" => Ok(Duration::from_millis(amount)),
            "" | "s" => Ok(Duration::from_secs(amount)),
            "m" => scaled(60),
            "h" => scaled(3600),
            other => Err(format!(
                "invalid duration '{text}': unknown unit '{other}' (use ns, us, ms, s, m or h)"
            )),
        }
    }

    pub(crate) fn render(value: Duration) -> String {
        let nanos = value.subsec_nanos();
        if nanos % 1_000 != 0 {
            return format!("{}ns", value.as_nanos());
        }
        if nanos % 1_000_000 != 0 {
            return format!("{}us", value.as_micros());
        }
        if nanos != 0 {
            return format!("{}ms", value.as_millis());
        }
        let secs = value.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.start_parallelism, 8);
        assert_eq!(config.unload_parallelism, 4);
        assert_eq!(config.init_timeout, Duration::from_secs(5));
        assert_eq!(config.start_timeout, Duration::from_secs(5));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.unload_total_timeout, Duration::from_secs(60));
        assert_eq!(config.worker_grace, Duration::from_millis(200));
        assert_eq!(config.clone().clamped(), config);
    }

    #[test]
    fn toml_plugins_table() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [server]
            port = 80

            [plugins]
            start_parallelism = 2
            init_timeout = "1500ms"
            stop_timeout = 30
            unload_total_timeout = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(config.start_parallelism, 2);
        assert_eq!(config.unload_parallelism, 4);
        assert_eq!(config.init_timeout, Duration::from_millis(1500));
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.unload_total_timeout, Duration::from_secs(120));
    }

    #[test]
    fn missing_table_means_defaults() {
        let config = OrchestratorConfig::from_toml_str("[server]\nport = 80\n").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn bad_unit_is_rejected() {
        let err = OrchestratorConfig::from_toml_str("[plugins]\ninit_timeout = \"5 fortnights\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown unit"), "{err}");
    }

    #[test]
    fn clamping() {
        let config = OrchestratorConfig::default()
            .with_start_parallelism(0)
            .with_unload_parallelism(64)
            .with_init_timeout(Duration::from_millis(10))
            .with_start_timeout(Duration::ZERO)
            .with_stop_timeout(Duration::from_secs(600))
            .with_unload_total_timeout(Duration::from_secs(1))
            .with_worker_grace(Duration::from_secs(60))
            .clamped();
        assert_eq!(config.start_parallelism, DEFAULT_START_PARALLELISM);
        assert_eq!(config.unload_parallelism, MAX_UNLOAD_PARALLELISM);
        assert_eq!(config.init_timeout, Duration::from_secs(1));
        assert_eq!(config.start_timeout, DEFAULT_PHASE_TIMEOUT);
        assert_eq!(config.stop_timeout, Duration::from_secs(120));
        assert_eq!(config.unload_total_timeout, Duration::from_secs(10));
        assert_eq!(config.worker_grace, Duration::from_secs(5));
    }

    #[test]
    fn duration_text_parse_and_render() {
        for (text, expected) in [
            ("250ms", Duration::from_millis(250)),
            ("5s", Duration::from_secs(5)),
            ("2m", Duration::from_secs(120)),
            ("1h", Duration::from_secs(3600)),
        ] {
            assert_eq!(duration_str::parse(text).unwrap(), expected);
            assert_eq!(duration_str::render(expected), text);
        }
        assert_eq!(duration_str::parse("7").unwrap(), Duration::from_secs(7));
        assert!(duration_str::parse("s").is_err());
    }

    #[test]
    fn sub_millisecond_durations_survive_a_round_trip() {
        for value in [
            Duration::from_micros(1500),
            Duration::from_nanos(2_000_000_750),
            Duration::from_micros(7),
        ] {
            let text = duration_str::render(value);
            assert_eq!(duration_str::parse(&text).unwrap(), value, "{text}");
        }
        assert_eq!(duration_str::render(Duration::from_micros(1500)), "1500us");
    }

    #[test]
    fn overflowing_duration_is_an_error() {
        let err = OrchestratorConfig::from_toml_str(
            "[plugins]\nstop_timeout = \"9999999999999999999h\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("value too large"), "{err}");
        assert!(duration_str::parse("9999999999999999999m").is_err());
        assert_eq!(
            duration_str::parse("9999999999999999999s").unwrap(),
            Duration::from_secs(9_999_999_999_999_999_999)
        );
    }

    #[test]
    fn runaway_start_parallelism_is_capped() {
        let config = OrchestratorConfig::from_toml_str(
            "[plugins]\nstart_parallelism = 4000000000000000000\n",
        )
        .unwrap()
        .clamped();
        assert_eq!(config.start_parallelism, MAX_START_PARALLELISM);
    }
}
