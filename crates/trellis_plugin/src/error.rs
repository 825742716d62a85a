//! Error types returned by plugins and runtimes.

/// Error returned by a plugin's own lifecycle method.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin refused with a message.
    #[error("{0}")]
    Message(String),

    /// The plugin observed its cancellation token and gave up.
    #[error("operation cancelled")]
    Cancelled,

    /// The plugin's runtime interaction failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Any other error raised by plugin code.
    #[error(transparent)]
    Other(Box<dyn core::error::Error + Send + Sync>),
}

impl PluginError {
    /// Creates a [`PluginError::Message`].
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        PluginError::Message(message.into())
    }

    /// Wraps an arbitrary error.
    #[must_use]
    pub fn other(err: impl core::error::Error + Send + Sync + 'static) -> Self {
        PluginError::Other(Box::new(err))
    }
}

/// Error raised by the resource runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A resource with this name is already registered in the scope.
    #[error("resource '{name}' already registered by plugin '{owner}'")]
    AlreadyRegistered {
        /// Resource name.
        name: String,
        /// Plugin that owns the existing entry.
        owner: String,
    },

    /// The runtime has no plugin context to attribute a private resource to.
    #[error("no plugin context for private resource '{0}'")]
    NoPluginContext(String),

    /// Releasing a plugin's resources failed.
    #[error("cleanup failed for plugin '{plugin_id}': {reason}")]
    CleanupFailed {
        /// Plugin whose resources were being released.
        plugin_id: String,
        /// Why it failed.
        reason: String,
    },
}
