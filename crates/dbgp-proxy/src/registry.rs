//! The registration registry: the `key -> IDE endpoint` map shared by the
//! IDE-side command handlers and the engine-side splice engine.
//!
//! The lock is a plain `std::sync::Mutex`, never held across an `.await` —
//! every critical section here is a handful of map operations, so a std
//! mutex is correct and cheaper than an async one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Registered via `proxyinit`; reachable directly at `host:port`.
    ProxyRegistered,
    /// Registered via `cloudinit`; traffic is multiplexed over the single
    /// upstream connection the cloud client already holds open.
    CloudMultiplexed,
}

#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub kind: EndpointKind,
    pub session_id: Uuid,
}

struct Slot {
    info: EndpointInfo,
    claimed: bool,
    evict: Arc<Notify>,
}

/// A claimed endpoint: a read-only snapshot plus the eviction signal the
/// splice engine must race against its own read loop.
pub struct Claim {
    pub info: EndpointInfo,
    pub evict: Arc<Notify>,
}

/// Shared, concurrency-safe `key -> Endpoint` map.
///
/// In `force_replace` mode, `add` displaces an existing entry for the same
/// key instead of failing. This is only used for the cloud registry, where
/// the single upstream connection is the sole source of truth and no splice
/// can yet be in progress for a key that hasn't been claimed.
pub struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
    force_replace: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            force_replace: false,
        }
    }

    pub fn new_force_replace() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            force_replace: true,
        }
    }

    pub fn add(
        &self,
        key: &str,
        host: String,
        port: u16,
        ssl: bool,
        kind: EndpointKind,
    ) -> Result<EndpointInfo, RegistryError> {
        let mut slots = self.slots.lock().unwrap();
        if !self.force_replace && slots.contains_key(key) {
            return Err(RegistryError::Duplicate(key.to_string()));
        }
        let info = EndpointInfo {
            key: key.to_string(),
            host,
            port,
            ssl,
            kind,
            session_id: Uuid::new_v4(),
        };
        slots.insert(
            key.to_string(),
            Slot {
                info: info.clone(),
                claimed: false,
                evict: Arc::new(Notify::new()),
            },
        );
        Ok(info)
    }

    pub fn remove(&self, key: &str) -> Result<(), RegistryError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.remove(key) {
            Some(slot) => {
                if slot.claimed {
                    slot.evict.notify_one();
                }
                Ok(())
            }
            None => Err(RegistryError::Absent(key.to_string())),
        }
    }

    pub fn find(&self, key: &str) -> Result<EndpointInfo, RegistryError> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(key)
            .map(|slot| slot.info.clone())
            .ok_or_else(|| RegistryError::Absent(key.to_string()))
    }

    pub fn claim(&self, key: &str) -> Result<Claim, RegistryError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| RegistryError::Absent(key.to_string()))?;
        if slot.claimed {
            return Err(RegistryError::AlreadyClaimed(key.to_string()));
        }
        slot.claimed = true;
        Ok(Claim {
            info: slot.info.clone(),
            evict: slot.evict.clone(),
        })
    }

    pub fn unclaim(&self, key: &str) -> Result<(), RegistryError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| RegistryError::Absent(key.to_string()))?;
        if !slot.claimed {
            return Err(RegistryError::NotClaimed(key.to_string()));
        }
        slot.claimed = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_plain(registry: &Registry, key: &str) -> EndpointInfo {
        registry
            .add(key, "10.0.0.5".into(), 9000, false, EndpointKind::ProxyRegistered)
            .unwrap()
    }

    #[test]
    fn duplicate_add_fails_without_force_replace() {
        let registry = Registry::new();
        add_plain(&registry, "KEY1");
        let err = registry
            .add("KEY1", "10.0.0.6".into(), 9100, false, EndpointKind::ProxyRegistered)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(k) if k == "KEY1"));
        assert_eq!(registry.find("KEY1").unwrap().host, "10.0.0.5");
    }

    #[test]
    fn force_replace_registry_displaces_existing_entry() {
        let registry = Registry::new_force_replace();
        registry
            .add("USER", "".into(), 0, true, EndpointKind::CloudMultiplexed)
            .unwrap();
        registry
            .add("USER", "".into(), 0, true, EndpointKind::CloudMultiplexed)
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn claim_is_exclusive() {
        let registry = Registry::new();
        add_plain(&registry, "KEY1");
        let _claim = registry.claim("KEY1").unwrap();
        let err = registry.claim("KEY1").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyClaimed(_)));
        registry.unclaim("KEY1").unwrap();
        assert!(registry.claim("KEY1").is_ok());
    }

    #[tokio::test]
    async fn removing_a_claimed_endpoint_signals_eviction() {
        let registry = Registry::new();
        add_plain(&registry, "KEY1");
        let claim = registry.claim("KEY1").unwrap();
        registry.remove("KEY1").unwrap();
        claim.evict.notified().await;
    }

    #[test]
    fn remove_of_absent_key_is_an_error() {
        let registry = Registry::new();
        let err = registry.remove("GHOST").unwrap_err();
        assert!(matches!(err, RegistryError::Absent(_)));
    }
}
