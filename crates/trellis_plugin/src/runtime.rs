//! The resource runtime collaborator.
//!
//! Plugins register the objects they acquire with a [`Runtime`] so the
//! orchestrator can release them by plugin ID without knowing what they are.
//! Two scopes exist:
//!
//! | Scope | Keyed by | Visible to |
//! |-------|----------|------------|
//! | [`ResourceScope::Private`] | owner ID + name | the owner only |
//! | [`ResourceScope::Shared`] | name | every plugin |
//!
//! Both scopes are released by [`Runtime::cleanup_resources`] for the owner.
//!
//! The same runtime also fans lifecycle [`PluginEvent`]s out to subscribers
//! and carries the host's configuration document.

use core::any::Any;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RuntimeError;
use crate::event::PluginEvent;

/// A type-erased resource handle.
pub type AnyResource = Arc<dyn Any + Send + Sync>;

const DEFAULT_EVENT_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Visibility of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScope {
    /// Only the owning plugin can look it up.
    Private,
    /// Any plugin can look it up by name.
    Shared,
}

/// Description of one registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Registration name.
    pub name: String,
    /// Owning plugin ID, `None` for host-registered shared resources.
    pub owner: Option<String>,
    /// Visibility.
    pub scope: ResourceScope,
    /// Rust type name of the stored value.
    pub type_name: String,
}

/// Aggregate counts over the registered resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    /// All resources.
    pub total: usize,
    /// Private resources.
    pub private: usize,
    /// Shared resources.
    pub shared: usize,
    /// Distinct owning plugins.
    pub owners: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Resource storage, event emission and configuration, scoped per plugin.
///
/// The orchestrator only relies on [`with_plugin_context`](Runtime::with_plugin_context),
/// [`cleanup_resources`](Runtime::cleanup_resources) and
/// [`emit_event`](Runtime::emit_event). The rest is surface for plugins and hosts.
pub trait Runtime: Send + Sync + 'static {
    /// Returns a view of this runtime attributed to `plugin_id`.
    fn with_plugin_context(&self, plugin_id: &str) -> Arc<dyn Runtime>;

    /// The plugin this view is attributed to, if any.
    fn current_plugin(&self) -> Option<&str>;

    /// Releases every resource owned by `plugin_id`.
    ///
    /// Must be idempotent: releasing an already-clean plugin succeeds.
    fn cleanup_resources(&self, plugin_id: &str) -> Result<(), RuntimeError>;

    /// Stores `value` under `name` in `scope`, owned by the current plugin.
    fn register_resource(
        &self,
        name: &str,
        scope: ResourceScope,
        type_name: &'static str,
        value: AnyResource,
    ) -> Result<(), RuntimeError>;

    /// Looks up a resource visible from this view.
    fn resource(&self, name: &str, scope: ResourceScope) -> Option<AnyResource>;

    /// Describes every registered resource.
    fn list_resources(&self) -> Vec<ResourceInfo>;

    /// Counts registered resources.
    fn resource_stats(&self) -> ResourceStats;

    /// The host configuration document.
    fn config(&self) -> Value;

    /// Replaces the host configuration document.
    fn set_config(&self, config: Value);

    /// Publishes a lifecycle event. Never blocks.
    fn emit_event(&self, event: PluginEvent);
}

/// Typed helpers over [`Runtime`].
///
/// # Example
///
/// ```
/// use trellis_plugin::{LocalRuntime, Runtime, RuntimeExt};
///
/// let runtime = LocalRuntime::new();
/// let scoped = runtime.with_plugin_context("cache");
/// scoped.register_shared("cache.capacity", 512_u32).unwrap();
///
/// let other = runtime.with_plugin_context("api");
/// assert_eq!(*other.shared::<u32>("cache.capacity").unwrap(), 512);
/// ```
pub trait RuntimeExt: Runtime {
    /// Registers a private resource for the current plugin.
    fn register_private<T: Send + Sync + 'static>(
        &self,
        name: &str,
        value: T,
    ) -> Result<(), RuntimeError> {
        self.register_resource(
            name,
            ResourceScope::Private,
            core::any::type_name::<T>(),
            Arc::new(value),
        )
    }

    /// Looks up one of the current plugin's private resources.
    fn private<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.resource(name, ResourceScope::Private)?
            .downcast::<T>()
            .ok()
    }

    /// Registers a shared resource owned by the current plugin.
    fn register_shared<T: Send + Sync + 'static>(
        &self,
        name: &str,
        value: T,
    ) -> Result<(), RuntimeError> {
        self.register_resource(
            name,
            ResourceScope::Shared,
            core::any::type_name::<T>(),
            Arc::new(value),
        )
    }

    /// Looks up a shared resource.
    fn shared<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.resource(name, ResourceScope::Shared)?
            .downcast::<T>()
            .ok()
    }
}

impl<R: Runtime + ?Sized> RuntimeExt for R {}

// ─────────────────────────────────────────────────────────────────────────────
// LocalRuntime
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    owner: Option<String>,
    type_name: &'static str,
    value: AnyResource,
}

#[derive(Default)]
struct Store {
    private: HashMap<(String, String), Entry>,
    shared: HashMap<String, Entry>,
}

struct State {
    store: RwLock<Store>,
    config: RwLock<Value>,
    events: broadcast::Sender<PluginEvent>,
}

/// In-process [`Runtime`] backed by hash maps and a broadcast channel.
///
/// Cloning is cheap; clones and plugin-scoped views share the same storage.
#[derive(Clone)]
pub struct LocalRuntime {
    state: Arc<State>,
    scope: Option<String>,
}

impl LocalRuntime {
    /// Creates an empty runtime with a null configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an empty runtime whose event channel buffers `capacity` events
    /// per subscriber.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(State {
                store: RwLock::new(Store::default()),
                config: RwLock::new(Value::Null),
                events,
            }),
            scope: None,
        }
    }

    /// Sets the initial configuration document.
    #[must_use]
    pub fn with_config(self, config: Value) -> Self {
        *self.state.config.write() = config;
        self
    }

    /// Subscribes to lifecycle events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.state.events.subscribe()
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("scope", &self.scope)
            .field("resources", &self.resource_stats())
            .finish_non_exhaustive()
    }
}

impl Runtime for LocalRuntime {
    fn with_plugin_context(&self, plugin_id: &str) -> Arc<dyn Runtime> {
        Arc::new(Self {
            state: Arc::clone(&self.state),
            scope: Some(plugin_id.to_owned()),
        })
    }

    fn current_plugin(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn cleanup_resources(&self, plugin_id: &str) -> Result<(), RuntimeError> {
        let mut store = self.state.store.write();
        let before = store.private.len() + store.shared.len();
        store.private.retain(|(owner, _), _| owner != plugin_id);
        store
            .shared
            .retain(|_, entry| entry.owner.as_deref() != Some(plugin_id));
        let released = before - (store.private.len() + store.shared.len());
        tracing::debug!(plugin = plugin_id, released, "released plugin resources");
        Ok(())
    }

    fn register_resource(
        &self,
        name: &str,
        scope: ResourceScope,
        type_name: &'static str,
        value: AnyResource,
    ) -> Result<(), RuntimeError> {
        let mut store = self.state.store.write();
        match scope {
            ResourceScope::Private => {
                let owner = self
                    .scope
                    .clone()
                    .ok_or_else(|| RuntimeError::NoPluginContext(name.to_owned()))?;
                let key = (owner.clone(), name.to_owned());
                if store.private.contains_key(&key) {
                    return Err(RuntimeError::AlreadyRegistered {
                        name: name.to_owned(),
                        owner,
                    });
                }
                store.private.insert(
                    key,
                    Entry {
                        owner: Some(owner),
                        type_name,
                        value,
                    },
                );
            }
            ResourceScope::Shared => {
                if let Some(existing) = store.shared.get(name) {
                    return Err(RuntimeError::AlreadyRegistered {
                        name: name.to_owned(),
                        owner: existing.owner.clone().unwrap_or_default(),
                    });
                }
                store.shared.insert(
                    name.to_owned(),
                    Entry {
                        owner: self.scope.clone(),
                        type_name,
                        value,
                    },
                );
            }
        }
        Ok(())
    }

    fn resource(&self, name: &str, scope: ResourceScope) -> Option<AnyResource> {
        let store = self.state.store.read();
        match scope {
            ResourceScope::Private => {
                let owner = self.scope.as_ref()?;
                store
                    .private
                    .get(&(owner.clone(), name.to_owned()))
                    .map(|entry| Arc::clone(&entry.value))
            }
            ResourceScope::Shared => store.shared.get(name).map(|entry| Arc::clone(&entry.value)),
        }
    }

    fn list_resources(&self) -> Vec<ResourceInfo> {
        let store = self.state.store.read();
        let private = store.private.iter().map(|((_, name), entry)| ResourceInfo {
            name: name.clone(),
            owner: entry.owner.clone(),
            scope: ResourceScope::Private,
            type_name: entry.type_name.to_owned(),
        });
        let shared = store.shared.iter().map(|(name, entry)| ResourceInfo {
            name: name.clone(),
            owner: entry.owner.clone(),
            scope: ResourceScope::Shared,
            type_name: entry.type_name.to_owned(),
        });
        let mut all: Vec<_> = private.chain(shared).collect();
        all.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        all
    }

    fn resource_stats(&self) -> ResourceStats {
        let store = self.state.store.read();
        let owners: hashbrown::HashSet<&str> = store
            .private
            .values()
            .chain(store.shared.values())
            .filter_map(|entry| entry.owner.as_deref())
            .collect();
        ResourceStats {
            total: store.private.len() + store.shared.len(),
            private: store.private.len(),
            shared: store.shared.len(),
            owners: owners.len(),
        }
    }

    fn config(&self) -> Value {
        self.state.config.read().clone()
    }

    fn set_config(&self, config: Value) {
        *self.state.config.write() = config;
    }

    fn emit_event(&self, event: PluginEvent) {
        // A send error only means nobody is listening.
        if self.state.events.send(event).is_err() {
            tracing::trace!("lifecycle event dropped, no subscribers");
        }
    }
}
