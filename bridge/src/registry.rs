//! Bookkeeping of live bus names.
//!
//! Services are tracked under two keys: the opaque owner handle the bus
//! daemon assigned to the current owner (`:1.42`), and the external identity
//! `service_type/device_instance`. Both resolve to the full service name.

use std::collections::HashMap;

/// Only services below this prefix are mirrored.
pub(crate) const SERVICE_PREFIX: &str = "com.victronenergy.";

/// Third dot-separated segment of a vendor service name, e.g. `system` for
/// `com.victronenergy.system`. `None` for foreign names.
pub(crate) fn service_type(name: &str) -> Option<&str> {
    if !name.starts_with(SERVICE_PREFIX) {
        return None;
    }
    name.split('.').nth(2)
}

#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    /// Owner handle (e.g. `:1.31`) to full service name.
    owners: HashMap<String, String>,
    /// `service_type/device_instance` to full service name.
    services: HashMap<String, String>,
}

impl ServiceRegistry {
    /// Records a live service under both keys. Names outside the vendor
    /// prefix are silently ignored; an existing `type/instance` record is
    /// superseded.
    pub(crate) fn record(&mut self, owner: &str, name: &str, instance: u32) {
        let Some(service_type) = service_type(name) else {
            return;
        };
        self.services
            .insert(format!("{service_type}/{instance}"), name.to_string());
        self.owners.insert(owner.to_string(), name.to_string());
    }

    pub(crate) fn resolve_by_owner(&self, owner: &str) -> Option<&String> {
        self.owners.get(owner)
    }

    pub(crate) fn resolve_by_type_instance(
        &self,
        service_type: &str,
        instance: u32,
    ) -> Option<&String> {
        self.services.get(&format!("{service_type}/{instance}"))
    }

    pub(crate) fn forget_by_owner(&mut self, owner: &str) {
        self.owners.remove(owner);
    }

    pub(crate) fn forget_by_name(&mut self, name: &str) {
        self.services.retain(|_, service| service != name);
    }

    /// Reverse lookup of the device instance a service was recorded with.
    /// Needed when a change signal arrives for a path the mirror has never
    /// seen: the new entry must be minted under the right instance.
    pub(crate) fn instance_of(&self, name: &str) -> Option<u32> {
        self.services
            .iter()
            .find(|(_, service)| service.as_str() == name)
            .and_then(|(key, _)| key.rsplit('/').next())
            .and_then(|instance| instance.parse().ok())
    }

    pub(crate) fn service_count(&self) -> usize {
        self.services.len()
    }
}
