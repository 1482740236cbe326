//! Marshalling between D-Bus typed values and JSON.
//!
//! Services on the bus expose their values through variants; the broker side
//! of the bridge speaks JSON. This crate translates between the two and also
//! derives the portal id that identifies this physical system on the broker.
//!
//! The bus has a dedicated "invalid" sentinel: an empty typed array inside a
//! variant. It maps to JSON `null` in both directions.

use std::{
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use zvariant::{Array, Dict, Signature, Value};

static INT_SIGNATURE: LazyLock<Signature> =
    LazyLock::new(|| Signature::try_from("i").expect("valid signature"));
static STRING_SIGNATURE: LazyLock<Signature> =
    LazyLock::new(|| Signature::try_from("s").expect("valid signature"));
static VARIANT_SIGNATURE: LazyLock<Signature> =
    LazyLock::new(|| Signature::try_from("v").expect("valid signature"));

/// The sentinel a service reports for a path that currently has no value.
pub fn invalid_value() -> Value<'static> {
    Value::Array(Array::new(&INT_SIGNATURE))
}

/// Unwraps a bus value into JSON. Nested variants are flattened; empty
/// arrays (the invalid sentinel included) and non-finite doubles become
/// `null`.
pub fn json_from_variant(value: &Value<'_>) -> serde_json::Value {
    match value {
        Value::U8(n) => (*n).into(),
        Value::Bool(b) => (*b).into(),
        Value::I16(n) => (*n).into(),
        Value::U16(n) => (*n).into(),
        Value::I32(n) => (*n).into(),
        Value::U32(n) => (*n).into(),
        Value::I64(n) => (*n).into(),
        Value::U64(n) => (*n).into(),
        Value::F64(n) => (*n).into(),
        Value::Str(s) => s.as_str().into(),
        Value::Signature(s) => s.to_string().into(),
        Value::ObjectPath(p) => p.as_str().into(),
        Value::Value(inner) => json_from_variant(inner),
        Value::Array(array) => {
            if array.is_empty() {
                serde_json::Value::Null
            } else {
                array.iter().map(json_from_variant).collect()
            }
        }
        Value::Dict(dict) => {
            match dict.try_clone().ok().and_then(|owned| {
                <std::collections::HashMap<String, zvariant::OwnedValue>>::try_from(owned).ok()
            })
            {
                Some(entries) => serde_json::Value::Object(
                    entries
                        .iter()
                        .map(|(key, value)| (key.clone(), json_from_variant(value)))
                        .collect(),
                ),
                None => serde_json::Value::Null,
            }
        }
        Value::Structure(fields) => fields.fields().iter().map(json_from_variant).collect(),
        _ => serde_json::Value::Null,
    }
}

/// Wraps a JSON value for a bus write.
///
/// `null` wraps to the invalid sentinel. Integers become `i32` when they fit
/// and `i64` (or `u64`) otherwise; heterogeneous lists and objects are carried
/// as containers of variants.
pub fn variant_from_json(value: &serde_json::Value) -> Value<'static> {
    match value {
        serde_json::Value::Null => invalid_value(),
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                match i32::try_from(i) {
                    Ok(i) => Value::I32(i),
                    Err(_) => Value::I64(i),
                }
            } else if let Some(u) = n.as_u64() {
                Value::U64(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone().into()),
        serde_json::Value::Array(items) => {
            let mut array = Array::new(&VARIANT_SIGNATURE);
            for item in items {
                array
                    .append(Value::Value(Box::new(variant_from_json(item))))
                    .expect("variant elements always match the array signature");
            }
            Value::Array(array)
        }
        serde_json::Value::Object(entries) => {
            let mut dict = Dict::new(&STRING_SIGNATURE, &VARIANT_SIGNATURE);
            for (key, item) in entries {
                dict.append(
                    Value::Str(key.clone().into()),
                    Value::Value(Box::new(variant_from_json(item))),
                )
                .expect("variant entries always match the dict signature");
            }
            Value::Dict(dict)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortalIdError {
    #[error("no network interface with a usable MAC address")]
    NoInterface,
    #[error("failed to enumerate network interfaces: {0}")]
    Io(#[from] io::Error),
}

/// Derives the portal id from the primary MAC address: lowercased, colons
/// stripped. `eth0` wins when present, otherwise the first interface (in name
/// order) with a non-zero address.
pub fn portal_id() -> Result<String, PortalIdError> {
    portal_id_from(Path::new("/sys/class/net"))
}

fn portal_id_from(root: &Path) -> Result<String, PortalIdError> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    names.sort();
    names.sort_by_key(|path| path.file_name().map(|n| n != "eth0").unwrap_or(true));

    for path in names {
        if path.file_name().map(|n| n == "lo").unwrap_or(true) {
            continue;
        }
        let Ok(address) = std::fs::read_to_string(path.join("address")) else {
            continue;
        };
        let id: String = address
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != ':')
            .collect();
        if !id.is_empty() && !id.chars().all(|c| c == '0') {
            return Ok(id);
        }
    }

    Err(PortalIdError::NoInterface)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(Value::I32(257), json!(257))]
    #[case(Value::U8(3), json!(3))]
    #[case(Value::F64(123.4), json!(123.4))]
    #[case(Value::Bool(true), json!(true))]
    #[case(Value::Str("Europe/Amsterdam".into()), json!("Europe/Amsterdam"))]
    fn scalars_unwrap(#[case] value: Value<'static>, #[case] expected: serde_json::Value) {
        assert_eq!(json_from_variant(&value), expected);
    }

    #[test]
    fn invalid_sentinel_unwraps_to_null() {
        assert_eq!(json_from_variant(&invalid_value()), serde_json::Value::Null);
    }

    #[test]
    fn nested_variant_is_flattened() {
        let value = Value::Value(Box::new(Value::I32(7)));
        assert_eq!(json_from_variant(&value), json!(7));
    }

    #[test]
    fn non_finite_double_unwraps_to_null() {
        assert_eq!(
            json_from_variant(&Value::F64(f64::NAN)),
            serde_json::Value::Null
        );
    }

    #[test]
    fn null_wraps_to_invalid_sentinel() {
        assert_eq!(variant_from_json(&serde_json::Value::Null), invalid_value());
    }

    #[rstest]
    #[case(json!(42), Value::I32(42))]
    #[case(json!(i64::MAX), Value::I64(i64::MAX))]
    #[case(json!(1.5), Value::F64(1.5))]
    #[case(json!("tz"), Value::Str("tz".into()))]
    #[case(json!(false), Value::Bool(false))]
    fn scalars_wrap(#[case] value: serde_json::Value, #[case] expected: Value<'static>) {
        assert_eq!(variant_from_json(&value), expected);
    }

    #[test]
    fn wrapped_list_round_trips() {
        let value = json!([1, "two", 3.0]);
        assert_eq!(json_from_variant(&variant_from_json(&value)), value);
    }

    #[test]
    fn wrapped_object_round_trips() {
        let value = json!({"a": 1, "b": "x"});
        assert_eq!(json_from_variant(&variant_from_json(&value)), value);
    }

    #[test]
    fn portal_id_prefers_eth0_and_strips_colons() {
        let root = tempfile::tempdir().unwrap();
        for (name, address) in [
            ("enp0s1", "02:42:ac:11:00:02\n"),
            ("eth0", "C0:EE:40:10:20:30\n"),
            ("lo", "00:00:00:00:00:00\n"),
        ] {
            std::fs::create_dir(root.path().join(name)).unwrap();
            std::fs::write(root.path().join(name).join("address"), address).unwrap();
        }

        assert_eq!(portal_id_from(root.path()).unwrap(), "c0ee40102030");
    }

    #[test]
    fn portal_id_skips_interfaces_without_mac() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("lo")).unwrap();
        std::fs::write(root.path().join("lo").join("address"), "00:00:00:00:00:00").unwrap();

        assert!(matches!(
            portal_id_from(root.path()),
            Err(PortalIdError::NoInterface)
        ));
    }
}
