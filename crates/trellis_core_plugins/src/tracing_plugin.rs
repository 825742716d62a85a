//! Tracing and observability plugin.
//!
//! Provides [`TracingPlugin`] which installs the `tracing` subscriber and
//! publishes the effective configuration as a shared resource.
//!
//! # Lifecycle
//!
//! - **`initialize`** merges the host configuration's `tracing` section over
//!   the builder settings, installs the subscriber and registers
//!   [`TracingConfig`] under [`TRACING_CONFIG_RESOURCE`].
//! - **`stop`** logs shutdown. The global subscriber stays installed.
//!
//! Plugins that want their startup logs formatted should declare a required
//! dependency on [`TracingPlugin::ID`].
//!
//! # Host configuration
//!
//! ```json
//! { "tracing": { "level": "debug", "format": "json", "filter": "trellis=debug" } }
//! ```

use core::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use trellis_plugin::{Plugin, PluginError, Runtime, RuntimeExt};

/// Shared resource name [`TracingConfig`] is registered under.
pub const TRACING_CONFIG_RESOURCE: &str = "trellis.tracing.config";

// ─────────────────────────────────────────────────────────────────────────────
// TracingFormat
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracingFormat {
    /// Human-readable colored output (default).
    #[default]
    Pretty,
    /// Compact single-line output.
    Compact,
    /// JSON structured output for log aggregation.
    Json,
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingConfig Resource
// ─────────────────────────────────────────────────────────────────────────────

/// Effective tracing configuration.
///
/// Other plugins can read it to adapt how much they log:
///
/// ```
/// use trellis_core_plugins::{TRACING_CONFIG_RESOURCE, TracingConfig};
/// use trellis_plugin::{Runtime, RuntimeExt};
/// use tracing::Level;
///
/// fn verbose(runtime: &dyn Runtime) -> bool {
///     runtime
///         .shared::<TracingConfig>(TRACING_CONFIG_RESOURCE)
///         .is_some_and(|config| config.level >= Level::DEBUG)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// The configured log level.
    pub level: Level,
    /// The configured output format.
    pub format: TracingFormat,
    /// The filter directive in effect, if any.
    pub env_filter: Option<String>,
}

/// The `tracing` section of the host configuration. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Overrides {
    level: Option<String>,
    format: Option<TracingFormat>,
    filter: Option<String>,
    span_events: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingPlugin
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing and logging plugin.
///
/// Configures the `tracing` subscriber. Uses the [`tracing`] and
/// [`tracing_subscriber`] crates under the hood. Installing a subscriber
/// twice is harmless: the second attempt is ignored.
///
/// # Resources Provided
///
/// | Resource | Scope | Description |
/// |----------|-------|-------------|
/// | [`TracingConfig`] | Shared | Effective tracing configuration |
///
/// # Configuration Options
///
/// ```
/// use trellis_core_plugins::{TracingPlugin, TracingFormat};
/// use tracing::Level;
///
/// // Development: Pretty colored output with debug level
/// let dev_plugin = TracingPlugin::default()
///     .with_level(Level::DEBUG)
///     .with_format(TracingFormat::Pretty)
///     .with_span_events(true);
///
/// // Production: JSON output for log aggregation
/// let prod_plugin = TracingPlugin::default()
///     .with_level(Level::INFO)
///     .with_format(TracingFormat::Json)
///     .with_env_filter("trellis_lifecycle=info,trellis_graph=warn");
/// ```
#[derive(Debug, Clone)]
pub struct TracingPlugin {
    /// Maximum log level.
    level: Level,
    /// Output format.
    format: TracingFormat,
    /// Environment filter (e.g., "trellis_lifecycle=debug").
    env_filter: Option<String>,
    /// Whether to include span events (enter/exit).
    span_events: bool,
}

impl Default for TracingPlugin {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: TracingFormat::Pretty,
            env_filter: None,
            span_events: false,
        }
    }
}

impl TracingPlugin {
    /// Plugin ID.
    pub const ID: &'static str = "tracing";

    /// Creates a new `TracingPlugin` with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum log level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets a custom environment filter string.
    ///
    /// Format: `target=level,target=level,...`
    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Enables span enter/exit events in output.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Applies the host configuration's `tracing` section on top of the
    /// builder settings.
    fn effective(&self, host: &serde_json::Value) -> Result<Self, PluginError> {
        let Some(section) = host.get("tracing") else {
            return Ok(self.clone());
        };
        let overrides = Overrides::deserialize(section)
            .map_err(|err| PluginError::msg(format!("invalid tracing configuration: {err}")))?;

        let mut effective = self.clone();
        if let Some(level) = overrides.level {
            effective.level = Level::from_str(&level)
                .map_err(|_| PluginError::msg(format!("invalid tracing level '{level}'")))?;
        }
        if let Some(format) = overrides.format {
            effective.format = format;
        }
        if let Some(filter) = overrides.filter {
            effective.env_filter = Some(filter);
        }
        if let Some(span_events) = overrides.span_events {
            effective.span_events = span_events;
        }
        Ok(effective)
    }

    fn install(&self) {
        let env_filter = match &self.env_filter {
            Some(filter) => {
                EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
            }
            None => EnvFilter::new(self.level.as_str()),
        };

        let span_events = if self.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };

        // try_init fails only when a global subscriber already exists.
        match self.format {
            TracingFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_span_events(span_events),
                    )
                    .try_init()
                    .ok();
            }
            TracingFormat::Compact => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_span_events(span_events),
                    )
                    .try_init()
                    .ok();
            }
            TracingFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_span_events(span_events),
                    )
                    .try_init()
                    .ok();
            }
        }
    }
}

impl Plugin for TracingPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Tracing"
    }

    fn initialize(&self, runtime: Arc<dyn Runtime>) -> Result<(), PluginError> {
        let effective = self.effective(&runtime.config())?;
        effective.install();
        runtime.register_shared(
            TRACING_CONFIG_RESOURCE,
            TracingConfig {
                level: effective.level,
                format: effective.format,
                env_filter: effective.env_filter.clone(),
            },
        )?;

        tracing::info!(
            level = %effective.level,
            format = ?effective.format,
            "TracingPlugin initialized"
        );
        Ok(())
    }

    fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), PluginError> {
        tracing::info!("TracingPlugin shutting down");
        Ok(())
    }
}
