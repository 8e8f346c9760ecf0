//! Relay Registry - Endpoint Pairing Management
//!
//! Tracks the pairings established in this process, keyed by remote
//! endpoint name.
//!
//! # Architecture
//!
//! ```text
//!                       RelayRegistry
//!              ┌──────────────────────────────────┐
//!              │ HashMap<String, Slot>            │
//!              │   - wrapped in Arc<RwLock<>>     │
//!              └───────────────┬──────────────────┘
//!                              │
//!           ┌──────────────────┼───────────────────┐
//!           │                  │                   │
//!    ┌──────▼──────┐   ┌───────▼──────┐   ┌────────▼───────┐
//!    │   Pending   │   │    Active    │   │    Retired     │
//!    │ establishing│   │ RelayHandle  │   │ last buffer    │
//!    └─────────────┘   └──────────────┘   └────────────────┘
//! ```
//!
//! With `single_instance` only one pairing may be pending or active at a
//! time. A retired slot keeps the torn down pairing's last-message buffer
//! so readers can still drain it until the endpoint is established again.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::LastMessageBuffer;
use crate::channel::{LocalChannelProvider, RemoteChannel};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::reader::PassiveReader;
use crate::relay::{self, RelayHandle};

enum Slot {
    /// Reserved while `establish` runs
    Pending,
    Active(RelayHandle),
    Retired(Arc<LastMessageBuffer>),
}

impl Slot {
    /// Whether the slot holds or is about to hold a live pairing
    fn is_live(&self) -> bool {
        match self {
            Self::Pending => true,
            Self::Active(handle) => !handle.is_torn_down(),
            Self::Retired(_) => false,
        }
    }

    fn buffer(&self) -> Option<Arc<LastMessageBuffer>> {
        match self {
            Self::Pending => None,
            Self::Active(handle) => Some(handle.last_message()),
            Self::Retired(buffer) => Some(Arc::clone(buffer)),
        }
    }
}

/// Registry of established pairings
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct RelayRegistry {
    inner: Arc<RwLock<HashMap<String, Slot>>>,
    single_instance: bool,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RelayRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(single_instance: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            single_instance,
        }
    }

    /// Create a registry honouring `config.single_instance`
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.single_instance)
    }

    /// Establish a pairing for `config.endpoint_name`
    ///
    /// # Errors
    ///
    /// - `RelayError::AlreadyEstablished` if the endpoint has a live pairing
    /// - `RelayError::RegistryFull` if single-instance and another endpoint
    ///   is live
    /// - any error from [`relay::establish`]; the registry is left as it
    ///   was
    pub async fn establish(
        &self,
        config: &RelayConfig,
        remote: Arc<dyn RemoteChannel>,
        provider: &dyn LocalChannelProvider,
    ) -> Result<RelayHandle, RelayError> {
        let name = config.endpoint_name.clone();

        let previous = {
            let mut inner = self.inner.write();
            if inner.get(&name).is_some_and(Slot::is_live) {
                tracing::warn!(endpoint = %name, "Endpoint already established");
                return Err(RelayError::AlreadyEstablished { endpoint: name });
            }
            if self.single_instance && inner.values().any(Slot::is_live) {
                tracing::warn!(endpoint = %name, "Registry full, refusing endpoint");
                return Err(RelayError::RegistryFull { limit: 1 });
            }
            inner.insert(name.clone(), Slot::Pending)
        };

        match relay::establish(config, remote, provider).await {
            Ok(handle) => {
                self.inner
                    .write()
                    .insert(name.clone(), Slot::Active(handle.clone()));
                tracing::info!(endpoint = %name, epoch = handle.epoch(), "Endpoint registered");
                Ok(handle)
            }
            Err(e) => {
                let mut inner = self.inner.write();
                match previous.and_then(|slot| slot.buffer()) {
                    Some(buffer) => {
                        inner.insert(name, Slot::Retired(buffer));
                    }
                    None => {
                        inner.remove(&name);
                    }
                }
                Err(e)
            }
        }
    }

    /// Tear down the pairing for `name`
    ///
    /// Returns false if there was no live pairing. The last-message buffer
    /// stays readable through [`reader`](Self::reader).
    pub async fn teardown(&self, name: &str) -> bool {
        let handle = {
            let mut inner = self.inner.write();
            let Some(Slot::Active(handle)) = inner.get(name) else {
                return false;
            };
            let handle = handle.clone();
            inner.insert(name.to_string(), Slot::Retired(handle.last_message()));
            handle
        };

        let was_live = !handle.is_torn_down();
        handle.teardown().await;
        tracing::info!(endpoint = %name, "Endpoint unregistered");
        was_live
    }

    /// Tear down every live pairing
    pub async fn teardown_all(&self) {
        for name in self.endpoints() {
            self.teardown(&name).await;
        }
    }

    /// Handle of the live pairing for `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RelayHandle> {
        match self.inner.read().get(name) {
            Some(Slot::Active(handle)) if !handle.is_torn_down() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Passive read surface for `name`, live or retired
    #[must_use]
    pub fn reader(&self, name: &str) -> Option<PassiveReader> {
        self.inner
            .read()
            .get(name)
            .and_then(Slot::buffer)
            .map(PassiveReader::new)
    }

    /// Names of endpoints with a live pairing
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(h) if !h.is_torn_down()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of live pairings
    #[must_use]
    pub fn count(&self) -> usize {
        self.endpoints().len()
    }

    /// Whether this registry allows only one pairing
    #[must_use]
    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }
}
