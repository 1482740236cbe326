//! Access to value items on the message bus.
//!
//! Services expose their tree through the nonstandard
//! `com.victronenergy.BusItem` interface, so calls go through
//! [`zbus::Connection::call_method`] rather than generated proxies. The
//! [`ValueBus`] trait is the seam the bridge and scanner are generic over;
//! tests plug in [`test::FakeBus`].

use dbus_mqtt_values::{json_from_variant, variant_from_json};
use thiserror::Error;
use zbus::{fdo, fdo::DBusProxy, names::BusName, zvariant::OwnedValue, Connection};

use crate::error::BridgeResult;

pub(crate) const BUS_ITEM_INTERFACE: &str = "com.victronenergy.BusItem";

const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// A failed bus call, classified by how the caller must react.
#[derive(Debug, Error)]
pub(crate) enum BusCallError {
    /// `UnknownObject`/`UnknownMethod`: the service is alive but does not
    /// implement the method at this path.
    #[error("method not provided at this path")]
    MethodMissing,

    /// `ServiceUnknown`/`Disconnected`/`NoReply`: the service went away (or
    /// never answered); whatever operation was in flight is abandoned.
    #[error("service disappeared or did not reply")]
    ServiceGone,

    #[error(transparent)]
    Other(#[from] zbus::Error),
}

fn classify(error: zbus::Error) -> BusCallError {
    if let zbus::Error::MethodError(name, _, _) = &error {
        match name.as_str() {
            "org.freedesktop.DBus.Error.UnknownObject"
            | "org.freedesktop.DBus.Error.UnknownMethod" => return BusCallError::MethodMissing,
            "org.freedesktop.DBus.Error.ServiceUnknown"
            | "org.freedesktop.DBus.Error.Disconnected"
            | "org.freedesktop.DBus.Error.NoReply" => return BusCallError::ServiceGone,
            _ => {}
        }
    }
    BusCallError::Other(error)
}

fn classify_fdo(error: fdo::Error) -> BusCallError {
    match error {
        fdo::Error::UnknownObject(_) | fdo::Error::UnknownMethod(_) => BusCallError::MethodMissing,
        fdo::Error::ServiceUnknown(_)
        | fdo::Error::NameHasNoOwner(_)
        | fdo::Error::Disconnected(_)
        | fdo::Error::NoReply(_) => BusCallError::ServiceGone,
        other => BusCallError::Other(zbus::Error::FDO(Box::new(other))),
    }
}

/// The bus operations the mirroring engine needs.
pub(crate) trait ValueBus {
    /// Single-path `GetValue`, unwrapped to JSON. `GetValue` on `/` is the
    /// bulk listing: a dict of relative paths to values.
    async fn get_value(&self, service: &str, path: &str)
        -> Result<serde_json::Value, BusCallError>;

    /// Single-path `SetValue` with a variant-wrapped value.
    async fn set_value(
        &self,
        service: &str,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<(), BusCallError>;

    /// Standard XML introspection of one node.
    async fn introspect(&self, service: &str, path: &str) -> Result<String, BusCallError>;

    async fn list_names(&self) -> Result<Vec<String>, BusCallError>;

    async fn name_owner(&self, name: &str) -> Result<String, BusCallError>;
}

/// [`ValueBus`] over a live zbus connection.
pub(crate) struct BusConnection {
    connection: Connection,
    dbus: DBusProxy<'static>,
}

impl BusConnection {
    pub(crate) async fn new(connection: Connection) -> BridgeResult<Self> {
        let dbus = DBusProxy::new(&connection).await?;
        Ok(Self { connection, dbus })
    }

    pub(crate) fn daemon(&self) -> &DBusProxy<'static> {
        &self.dbus
    }
}

impl ValueBus for BusConnection {
    async fn get_value(
        &self,
        service: &str,
        path: &str,
    ) -> Result<serde_json::Value, BusCallError> {
        let reply = self
            .connection
            .call_method(Some(service), path, Some(BUS_ITEM_INTERFACE), "GetValue", &())
            .await
            .map_err(classify)?;
        let value: OwnedValue = reply.body().deserialize().map_err(BusCallError::Other)?;
        Ok(json_from_variant(&value))
    }

    async fn set_value(
        &self,
        service: &str,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<(), BusCallError> {
        let variant = variant_from_json(value);
        self.connection
            .call_method(
                Some(service),
                path,
                Some(BUS_ITEM_INTERFACE),
                "SetValue",
                &variant,
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn introspect(&self, service: &str, path: &str) -> Result<String, BusCallError> {
        let reply = self
            .connection
            .call_method(
                Some(service),
                path,
                Some(INTROSPECTABLE_INTERFACE),
                "Introspect",
                &(),
            )
            .await
            .map_err(classify)?;
        reply.body().deserialize().map_err(BusCallError::Other)
    }

    async fn list_names(&self) -> Result<Vec<String>, BusCallError> {
        let names = self.dbus.list_names().await.map_err(classify_fdo)?;
        Ok(names.into_iter().map(|name| name.to_string()).collect())
    }

    async fn name_owner(&self, name: &str) -> Result<String, BusCallError> {
        let name = BusName::try_from(name).map_err(|error| zbus::Error::from(error))?;
        let owner = self.dbus.get_name_owner(name).await.map_err(classify_fdo)?;
        Ok(owner.to_string())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        cell::RefCell,
        collections::{BTreeMap, HashSet},
        rc::Rc,
    };

    use super::*;

    #[derive(Debug, Default)]
    struct FakeBusInner {
        /// `(service, path)` to current value; paths carry a leading slash.
        items: BTreeMap<(String, String), serde_json::Value>,
        /// Services answering the bulk `GetValue` on `/`.
        bulk_listing: HashSet<String>,
        /// `(service, path)` to introspection XML.
        xml: BTreeMap<(String, String), String>,
        /// Services answering every call with `ServiceGone`.
        gone: HashSet<String>,
        names: Vec<String>,
        owners: BTreeMap<String, String>,
        reads: Vec<(String, String)>,
        writes: Vec<(String, String, serde_json::Value)>,
    }

    /// In-memory [`ValueBus`] for tests; clones share state.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeBus {
        inner: Rc<RefCell<FakeBusInner>>,
    }

    impl FakeBus {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn add_item(&self, service: &str, path: &str, value: serde_json::Value) {
            self.inner
                .borrow_mut()
                .items
                .insert((service.to_string(), path.to_string()), value);
        }

        pub(crate) fn enable_bulk_listing(&self, service: &str) {
            self.inner
                .borrow_mut()
                .bulk_listing
                .insert(service.to_string());
        }

        pub(crate) fn add_xml(&self, service: &str, path: &str, xml: &str) {
            self.inner
                .borrow_mut()
                .xml
                .insert((service.to_string(), path.to_string()), xml.to_string());
        }

        pub(crate) fn mark_gone(&self, service: &str) {
            self.inner.borrow_mut().gone.insert(service.to_string());
        }

        pub(crate) fn add_name(&self, name: &str, owner: &str) {
            let mut inner = self.inner.borrow_mut();
            inner.names.push(name.to_string());
            inner.owners.insert(name.to_string(), owner.to_string());
        }

        pub(crate) fn reads_of(&self, path: &str) -> usize {
            self.inner
                .borrow()
                .reads
                .iter()
                .filter(|(_, p)| p == path)
                .count()
        }

        pub(crate) fn read_count(&self) -> usize {
            self.inner.borrow().reads.len()
        }

        pub(crate) fn writes(&self) -> Vec<(String, String, serde_json::Value)> {
            self.inner.borrow().writes.clone()
        }
    }

    impl ValueBus for FakeBus {
        async fn get_value(
            &self,
            service: &str,
            path: &str,
        ) -> Result<serde_json::Value, BusCallError> {
            let mut inner = self.inner.borrow_mut();
            if inner.gone.contains(service) {
                return Err(BusCallError::ServiceGone);
            }
            inner.reads.push((service.to_string(), path.to_string()));

            if path == "/" {
                if !inner.bulk_listing.contains(service) {
                    return Err(BusCallError::MethodMissing);
                }
                let listing: serde_json::Map<String, serde_json::Value> = inner
                    .items
                    .iter()
                    .filter(|((s, _), _)| s == service)
                    .map(|((_, p), value)| {
                        (p.trim_start_matches('/').to_string(), value.clone())
                    })
                    .collect();
                return Ok(serde_json::Value::Object(listing));
            }

            inner
                .items
                .get(&(service.to_string(), path.to_string()))
                .cloned()
                .ok_or(BusCallError::MethodMissing)
        }

        async fn set_value(
            &self,
            service: &str,
            path: &str,
            value: &serde_json::Value,
        ) -> Result<(), BusCallError> {
            let mut inner = self.inner.borrow_mut();
            if inner.gone.contains(service) {
                return Err(BusCallError::ServiceGone);
            }
            inner
                .items
                .insert((service.to_string(), path.to_string()), value.clone());
            inner
                .writes
                .push((service.to_string(), path.to_string(), value.clone()));
            Ok(())
        }

        async fn introspect(&self, service: &str, path: &str) -> Result<String, BusCallError> {
            let inner = self.inner.borrow();
            if inner.gone.contains(service) {
                return Err(BusCallError::ServiceGone);
            }
            inner
                .xml
                .get(&(service.to_string(), path.to_string()))
                .cloned()
                .ok_or(BusCallError::MethodMissing)
        }

        async fn list_names(&self) -> Result<Vec<String>, BusCallError> {
            Ok(self.inner.borrow().names.clone())
        }

        async fn name_owner(&self, name: &str) -> Result<String, BusCallError> {
            self.inner
                .borrow()
                .owners
                .get(name)
                .cloned()
                .ok_or(BusCallError::ServiceGone)
        }
    }
}
