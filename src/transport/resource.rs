//! Exclusive ownership of physical resources.
//!
//! A physical port or VISA resource may be held by at most one session at a
//! time. Sessions claim the resource before opening their transport and hold
//! a [`ResourceClaim`] for as long as the transport is open; dropping the
//! claim releases the resource.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::TransportError;

static GLOBAL: Lazy<ResourceRegistry> = Lazy::new(ResourceRegistry::new);

/// Tracks which session owns which resource.
///
/// Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    owners: Arc<Mutex<HashMap<String, String>>>,
}

impl ResourceRegistry {
    /// A registry independent of the global one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by sessions unless told otherwise.
    pub fn global() -> ResourceRegistry {
        GLOBAL.clone()
    }

    /// Claim `resource` for `owner`.
    ///
    /// Fails with [`TransportError::ResourceBusy`] if another owner holds it.
    /// A second claim by the same owner is also refused, so one session can
    /// never open the same port twice.
    pub fn claim(&self, resource: &str, owner: &str) -> Result<ResourceClaim, TransportError> {
        let resource = resource.trim();
        let mut owners = self.owners.lock();
        if let Some(current) = owners.get(resource) {
            return Err(TransportError::ResourceBusy {
                resource: resource.to_string(),
                owner: current.clone(),
            });
        }
        owners.insert(resource.to_string(), owner.to_string());
        tracing::debug!(resource, owner, "Claimed resource");

        Ok(ResourceClaim {
            owners: self.owners.clone(),
            resource: resource.to_string(),
            owner: owner.to_string(),
        })
    }

    /// Whether any session holds `resource`.
    pub fn is_claimed(&self, resource: &str) -> bool {
        self.owners.lock().contains_key(resource.trim())
    }

    /// Current owner of `resource`, if any.
    pub fn owner(&self, resource: &str) -> Option<String> {
        self.owners.lock().get(resource.trim()).cloned()
    }
}

/// RAII guard for exclusive resource ownership.
#[derive(Debug)]
pub struct ResourceClaim {
    owners: Arc<Mutex<HashMap<String, String>>>,
    resource: String,
    owner: String,
}

impl ResourceClaim {
    /// Claimed address.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Session holding the claim.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for ResourceClaim {
    fn drop(&mut self) {
        let mut owners = self.owners.lock();
        if owners.get(&self.resource) == Some(&self.owner) {
            owners.remove(&self.resource);
            tracing::debug!(resource = %self.resource, owner = %self.owner, "Released resource");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let registry = ResourceRegistry::new();
        let claim = registry.claim("/dev/ttyUSB0", "stage").unwrap();
        assert_eq!(claim.owner(), "stage");
        assert_eq!(registry.owner("/dev/ttyUSB0").as_deref(), Some("stage"));

        let err = registry.claim("/dev/ttyUSB0", "laser").unwrap_err();
        assert_eq!(
            err,
            TransportError::ResourceBusy {
                resource: "/dev/ttyUSB0".into(),
                owner: "stage".into(),
            }
        );
    }

    #[test]
    fn test_drop_releases() {
        let registry = ResourceRegistry::new();
        {
            let _claim = registry.claim("COM3", "a").unwrap();
            assert!(registry.is_claimed("COM3"));
        }
        assert!(!registry.is_claimed("COM3"));
        assert!(registry.claim("COM3", "b").is_ok());
    }

    #[test]
    fn test_identifiers_are_trimmed() {
        let registry = ResourceRegistry::new();
        let _claim = registry.claim(" /dev/ttyS1 ", "a").unwrap();
        assert!(registry.claim("/dev/ttyS1", "b").is_err());
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ResourceRegistry::new();
        let b = ResourceRegistry::new();
        let _claim = a.claim("GPIB0::5::INSTR", "x").unwrap();
        assert!(!b.is_claimed("GPIB0::5::INSTR"));
        assert!(a.clone().is_claimed("GPIB0::5::INSTR"));
    }
}
