use crate::domain::{BRIDGE_DRIVER, ContainerRuntime, NetworkHandle};
use crate::error::{Error, NetworkConflict, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Reference-counted bridge networks shared by the containers of one process.
///
/// The registry lock is held across the runtime calls so concurrent
/// acquire/release of the same name cannot create or remove it twice.
#[derive(Debug)]
pub struct NetworkManager {
    runtime: Arc<dyn ContainerRuntime>,
    teardown: bool,
    networks: Mutex<HashMap<String, TrackedNetwork>>,
}

#[derive(Debug)]
struct TrackedNetwork {
    id: String,
    ref_count: usize,
    created: bool,
}

impl NetworkManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, teardown: bool) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            teardown,
            networks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a lease on `name`, creating the network if neither this
    /// manager nor the engine knows it.
    pub fn acquire(self: &Arc<Self>, name: &str) -> Result<NetworkLease> {
        let mut networks = self.lock();

        if let Some(tracked) = networks.get_mut(name) {
            tracked.ref_count += 1;
            debug!(network = name, holders = tracked.ref_count, "network reused");
            return Ok(self.lease(name, &tracked.id));
        }

        let existing = self
            .runtime
            .find_network(name)
            .map_err(|source| Error::Network {
                name: name.to_string(),
                source,
            })?;

        let (id, created) = match existing {
            Some(info) if info.driver != BRIDGE_DRIVER => {
                return Err(NetworkConflict {
                    name: name.to_string(),
                    driver: info.driver,
                }
                .into());
            }
            Some(info) => {
                info!(network = name, "using existing network");
                (info.id, false)
            }
            None => {
                let info = self
                    .runtime
                    .create_network(name, BRIDGE_DRIVER)
                    .map_err(|source| Error::Network {
                        name: name.to_string(),
                        source,
                    })?;
                info!(network = name, id = %info.id, "created network");
                (info.id, true)
            }
        };

        let lease = self.lease(name, &id);
        networks.insert(
            name.to_string(),
            TrackedNetwork {
                id,
                ref_count: 1,
                created,
            },
        );
        Ok(lease)
    }

    /// Current holders of `name`; 0 when untracked.
    pub fn ref_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |t| t.ref_count)
    }

    pub fn handle(&self, name: &str) -> Option<NetworkHandle> {
        self.lock().get(name).map(|t| NetworkHandle {
            id: t.id.clone(),
            name: name.to_string(),
            ref_count: t.ref_count,
            created: t.created,
        })
    }

    fn lease(self: &Arc<Self>, name: &str, id: &str) -> NetworkLease {
        NetworkLease {
            manager: Arc::clone(self),
            name: name.to_string(),
            id: id.to_string(),
        }
    }

    fn retain(&self, name: &str) {
        if let Some(tracked) = self.lock().get_mut(name) {
            tracked.ref_count += 1;
        }
    }

    fn release(&self, name: &str) {
        let mut networks = self.lock();
        let Some(tracked) = networks.get_mut(name) else {
            warn!(network = name, "released a network that is not tracked");
            return;
        };

        tracked.ref_count -= 1;
        if tracked.ref_count > 0 {
            debug!(network = name, holders = tracked.ref_count, "network released");
            return;
        }

        let created = tracked.created;
        networks.remove(name);

        if !created {
            debug!(network = name, "leaving pre-existing network in place");
            return;
        }
        if !self.teardown {
            info!(network = name, "teardown disabled, leaving network in place");
            return;
        }

        match self.runtime.remove_network(name) {
            Ok(()) => info!(network = name, "removed network"),
            Err(e) => warn!(network = name, "could not remove network: {e:#}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedNetwork>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One holder's reference on a shared network. Dropping it releases the
/// reference; cloning takes another.
#[derive(Debug)]
pub struct NetworkLease {
    manager: Arc<NetworkManager>,
    name: String,
    id: String,
}

impl NetworkLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> NetworkHandle {
        self.manager.handle(&self.name).unwrap_or_else(|| NetworkHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            ref_count: 0,
            created: false,
        })
    }
}

impl Clone for NetworkLease {
    fn clone(&self) -> Self {
        self.manager.retain(&self.name);
        Self {
            manager: Arc::clone(&self.manager),
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }
}

impl Drop for NetworkLease {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}
