//! The broker client seam.
//!
//! The bridge publishes and subscribes through the [`Broker`] trait so tests
//! can record traffic; production uses a [`rumqttc::AsyncClient`] whose
//! [`rumqttc::EventLoop`] is polled inside the bridge loop. Everything is
//! QoS 0: retained last-value semantics make redelivery pointless.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};

use crate::{entrypoint::Args, error::BridgeResult};

const CLIENT_ID: &str = "ve-dbus-mqtt";

/// Outstanding requests towards the client's event loop.
const REQUEST_CAPACITY: usize = 64;

pub(crate) trait Broker {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> BridgeResult<()>;

    async fn subscribe(&self, filter: &str) -> BridgeResult<()>;
}

impl Broker for AsyncClient {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> BridgeResult<()> {
        AsyncClient::publish(self, topic, QoS::AtMostOnce, true, payload)
            .await
            .map_err(Into::into)
    }

    async fn subscribe(&self, filter: &str) -> BridgeResult<()> {
        AsyncClient::subscribe(self, filter, QoS::AtMostOnce)
            .await
            .map_err(Into::into)
    }
}

/// Builds the broker client from the command line. TLS (and port 8883) is
/// used exactly when a CA certificate is configured.
pub(crate) fn broker_client(args: &Args) -> BridgeResult<(AsyncClient, EventLoop)> {
    let host = args.mqtt_server.as_deref().unwrap_or("127.0.0.1");
    let (port, tls) = match &args.mqtt_certificate {
        Some(certificate) => {
            let ca = std::fs::read(certificate)?;
            let tls = TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            };
            (8883, Some(tls))
        }
        None => (1883, None),
    };

    let mut options = MqttOptions::new(CLIENT_ID, host, port);
    options.set_keep_alive(Duration::from_secs(args.keep_alive.into()));
    if let (Some(user), Some(password)) = (&args.mqtt_user, &args.mqtt_password) {
        options.set_credentials(user.as_str(), password.as_str());
    }
    if let Some(tls) = tls {
        options.set_transport(Transport::Tls(tls));
    }

    Ok(AsyncClient::new(options, REQUEST_CAPACITY))
}
