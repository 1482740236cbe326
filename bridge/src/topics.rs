//! The topic grammar spoken on the broker.
//!
//! Outbound notifications live under `N/{portal_id}/{service_type}/{device_instance}{path}`
//! with `path` always starting in `/`. Inbound requests replace the leading
//! `N` with `R` (read) or `W` (write) and separate the path with a `/`.

/// Prefix of the reserved topics that carry the cloud-connection state of the
/// local broker's bridge.
pub(crate) const CONNECTION_STATE_PREFIX: &str = "$SYS/broker/connection/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestAction {
    Read,
    Write,
}

/// A parsed inbound request topic. `path` carries no leading slash.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Request<'a> {
    pub(crate) action: RequestAction,
    pub(crate) portal_id: &'a str,
    pub(crate) service_type: &'a str,
    pub(crate) device_instance: u32,
    pub(crate) path: &'a str,
}

pub(crate) fn parse_request(topic: &str) -> Option<Request<'_>> {
    let mut segments = topic.splitn(5, '/');
    let action = match segments.next()? {
        "R" => RequestAction::Read,
        "W" => RequestAction::Write,
        _ => return None,
    };
    let portal_id = segments.next()?;
    let service_type = segments.next()?;
    let device_instance = segments.next()?.parse().ok()?;
    let path = segments.next()?;
    if portal_id.is_empty() || service_type.is_empty() || path.is_empty() {
        return None;
    }

    Some(Request {
        action,
        portal_id,
        service_type,
        device_instance,
        path,
    })
}

/// Mints the notification topic for a mirrored path. `path` must carry its
/// leading slash.
pub(crate) fn notification_topic(
    portal_id: &str,
    service_type: &str,
    device_instance: u32,
    path: &str,
) -> String {
    format!("N/{portal_id}/{service_type}/{device_instance}{path}")
}

pub(crate) fn connection_state_topic(client_id: &str) -> String {
    format!("{CONNECTION_STATE_PREFIX}{client_id}/state")
}

pub(crate) fn is_connection_state(topic: &str) -> bool {
    topic.starts_with(CONNECTION_STATE_PREFIX)
}

/// The retained payload published for a mirrored value.
pub(crate) fn value_payload(value: &serde_json::Value) -> String {
    serde_json::json!({ "value": value }).to_string()
}
