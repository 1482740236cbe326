//! Enumeration of a service's value tree.
//!
//! Two strategies behind one interface, both producing `(path, value)`
//! pairs: the bulk `GetValue` on `/` (one round trip, preferred), and a
//! recursive XML-introspection walk for services that do not implement the
//! bulk listing. Enumeration is collect-then-commit: the caller installs
//! records only for a completed scan, so a service that vanishes mid-scan
//! leaves nothing behind.

use serde::Deserialize;

use crate::{
    bus::{BusCallError, ValueBus, BUS_ITEM_INTERFACE},
    error::BridgeResult,
};

/// A completed scan: the device instance and every published path with its
/// current value.
#[derive(Debug)]
pub(crate) struct ScannedService {
    pub(crate) instance: u32,
    pub(crate) items: Vec<(String, serde_json::Value)>,
}

/// One node of the standard introspection document.
#[derive(Debug, Deserialize)]
struct Node {
    #[serde(rename = "interface", default)]
    interfaces: Vec<Interface>,
    #[serde(rename = "node", default)]
    children: Vec<ChildNode>,
}

#[derive(Debug, Deserialize)]
struct Interface {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChildNode {
    #[serde(rename = "@name")]
    name: Option<String>,
}

/// Scans `service`. `Ok(None)` means the scan was abandoned because the
/// service disappeared or stopped replying; any other bus error propagates
/// and aborts the scan of this service only.
pub(crate) async fn scan<B: ValueBus>(
    bus: &B,
    service: &str,
) -> BridgeResult<Option<ScannedService>> {
    tracing::info!(service, "scanning service");

    let instance = match bus.get_value(service, "/DeviceInstance").await {
        Ok(value) => device_instance(&value),
        Err(BusCallError::MethodMissing) => 0,
        Err(BusCallError::ServiceGone) => {
            tracing::info!(service, "service disappeared while being scanned");
            return Ok(None);
        }
        Err(BusCallError::Other(error)) => return Err(error.into()),
    };

    let items = match bus.get_value(service, "/").await {
        Ok(serde_json::Value::Object(listing)) => listing.into_iter().collect(),
        Ok(_) => Vec::new(),
        Err(BusCallError::MethodMissing) => {
            tracing::warn!(service, "service does not provide an item listing");
            match introspect_tree(bus, service).await? {
                Some(items) => items,
                None => return Ok(None),
            }
        }
        Err(BusCallError::ServiceGone) => {
            tracing::info!(service, "service disappeared while being scanned");
            return Ok(None);
        }
        Err(BusCallError::Other(error)) => return Err(error.into()),
    };

    Ok(Some(ScannedService { instance, items }))
}

/// `/DeviceInstance` values in the wild are integers, but occasionally
/// strings; anything else falls back to instance 0.
fn device_instance(value: &serde_json::Value) -> u32 {
    value
        .as_u64()
        .and_then(|instance| u32::try_from(instance).ok())
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
        .unwrap_or(0)
}

/// Walks the object tree via XML introspection, reading every leaf that
/// implements the value-item interface. `Ok(None)` = abandoned.
async fn introspect_tree<B: ValueBus>(
    bus: &B,
    service: &str,
) -> BridgeResult<Option<Vec<(String, serde_json::Value)>>> {
    let mut items = Vec::new();
    let mut pending = vec!["/".to_string()];

    while let Some(path) = pending.pop() {
        let xml = match bus.introspect(service, &path).await {
            Ok(xml) => xml,
            Err(BusCallError::ServiceGone) => {
                tracing::info!(service, "service disappeared while being scanned");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        let node: Node = quick_xml::de::from_str(&xml)?;

        if node.children.is_empty() {
            if node
                .interfaces
                .iter()
                .any(|interface| interface.name == BUS_ITEM_INTERFACE)
            {
                match bus.get_value(service, &path).await {
                    Ok(value) => items.push((path, value)),
                    Err(BusCallError::ServiceGone) => {
                        tracing::info!(service, "service disappeared while being scanned");
                        return Ok(None);
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        } else {
            for child in node.children.iter().filter_map(|child| child.name.as_deref()) {
                if path.ends_with('/') {
                    pending.push(format!("{path}{child}"));
                } else {
                    pending.push(format!("{path}/{child}"));
                }
            }
        }
    }

    Ok(Some(items))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bus::test::FakeBus;

    const SERVICE: &str = "com.victronenergy.system";

    #[tokio::test]
    async fn bulk_listing_enumerates_every_path() {
        let bus = FakeBus::new();
        bus.enable_bulk_listing(SERVICE);
        bus.add_item(SERVICE, "/DeviceInstance", json!(0));
        bus.add_item(SERVICE, "/Ac/Grid/L1/Power", json!(123.4));
        bus.add_item(SERVICE, "/Serial", json!("hq1"));

        let scanned = scan(&bus, SERVICE).await.unwrap().unwrap();

        assert_eq!(scanned.instance, 0);
        let mut paths: Vec<&str> = scanned.items.iter().map(|(p, _)| p.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["Ac/Grid/L1/Power", "DeviceInstance", "Serial"]);
    }

    #[tokio::test]
    async fn falls_back_to_introspection_without_bulk_listing() {
        let service = "com.victronenergy.vebus.ttyO1";
        let bus = FakeBus::new();
        bus.add_item(service, "/DeviceInstance", json!(257));
        bus.add_item(service, "/Mode", json!(3));
        bus.add_xml(
            service,
            "/",
            r#"<node><node name="Mode"/><node name="DeviceInstance"/></node>"#,
        );
        bus.add_xml(
            service,
            "/Mode",
            r#"<node><interface name="com.victronenergy.BusItem"/></node>"#,
        );
        bus.add_xml(
            service,
            "/DeviceInstance",
            r#"<node><interface name="org.freedesktop.DBus.Introspectable"/></node>"#,
        );

        let scanned = scan(&bus, service).await.unwrap().unwrap();

        assert_eq!(scanned.instance, 257);
        assert_eq!(scanned.items, vec![("/Mode".to_string(), json!(3))]);
    }

    #[tokio::test]
    async fn missing_device_instance_defaults_to_zero() {
        let bus = FakeBus::new();
        bus.enable_bulk_listing(SERVICE);
        bus.add_item(SERVICE, "/Serial", json!("hq1"));

        let scanned = scan(&bus, SERVICE).await.unwrap().unwrap();
        assert_eq!(scanned.instance, 0);
    }

    #[tokio::test]
    async fn string_device_instances_are_accepted() {
        let bus = FakeBus::new();
        bus.enable_bulk_listing(SERVICE);
        bus.add_item(SERVICE, "/DeviceInstance", json!("42"));

        let scanned = scan(&bus, SERVICE).await.unwrap().unwrap();
        assert_eq!(scanned.instance, 42);
    }

    #[tokio::test]
    async fn a_vanished_service_abandons_the_scan() {
        let bus = FakeBus::new();
        bus.mark_gone(SERVICE);

        assert!(scan(&bus, SERVICE).await.unwrap().is_none());
        assert_eq!(bus.read_count(), 0);
    }

    #[tokio::test]
    async fn a_service_without_items_scans_empty() {
        let bus = FakeBus::new();
        bus.enable_bulk_listing(SERVICE);

        let scanned = scan(&bus, SERVICE).await.unwrap().unwrap();
        assert_eq!(scanned.instance, 0);
        assert!(scanned.items.is_empty());
    }
}
