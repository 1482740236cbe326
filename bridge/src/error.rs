use thiserror::Error;

use crate::bus::BusCallError;

pub(crate) type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("bus call failed: {0}")]
    BusCall(#[from] BusCallError),

    #[error("broker client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("failed to parse introspection data: {0}")]
    Introspection(#[from] quick_xml::DeError),

    #[error("failed to derive portal id: {0}")]
    PortalId(#[from] dbus_mqtt_values::PortalIdError),

    #[error("broker registration failed: {0}")]
    Registration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
