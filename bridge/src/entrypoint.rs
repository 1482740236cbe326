//! Process entry: command line, logging, dependency-order boot, signals.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zbus::{Connection, MatchRule, MessageStream};

use crate::{
    bridge::Bridge,
    bus::{BusConnection, BUS_ITEM_INTERFACE},
    error::BridgeResult,
    mqtt,
    registrator::{HelperRegistrator, Registrator},
};

/// Publishes values from the D-Bus to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "dbus-mqtt-bridge", version)]
pub(crate) struct Args {
    /// Name of the MQTT broker.
    #[arg(short = 'q', long)]
    pub(crate) mqtt_server: Option<String>,

    /// MQTT user name.
    #[arg(short = 'u', long)]
    pub(crate) mqtt_user: Option<String>,

    /// MQTT password.
    #[arg(short = 'P', long)]
    pub(crate) mqtt_password: Option<String>,

    /// Path to the CA certificate used for TLS towards the broker.
    #[arg(short = 'c', long)]
    pub(crate) mqtt_certificate: Option<PathBuf>,

    /// D-Bus address to connect to instead of the default bus.
    #[arg(short = 'b', long)]
    pub(crate) dbus: Option<String>,

    /// Keep-alive interval in seconds.
    #[arg(short = 'k', long, default_value_t = 60)]
    pub(crate) keep_alive: u16,

    /// Set up communication with the remote broker at startup.
    #[arg(short = 'i', long, requires = "registrator")]
    pub(crate) init_broker: bool,

    /// Helper executable that provisions remote-broker credentials.
    #[arg(long)]
    pub(crate) registrator: Option<PathBuf>,

    /// Set the logging level to debug.
    #[arg(short = 'd', long)]
    pub(crate) debug: bool,
}

pub(crate) async fn run(args: Args) -> BridgeResult<()> {
    init_tracing(args.debug);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "dbus-mqtt-bridge starting up"
    );

    let portal_id = dbus_mqtt_values::portal_id()?;
    tracing::info!(%portal_id, "derived portal id");

    let connection = connect_bus(args.dbus.as_deref()).await?;
    let bus = BusConnection::new(connection.clone()).await?;
    let owner_changes = bus.daemon().receive_name_owner_changed().await?;
    let change_signals = MessageStream::for_match_rule(
        MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(BUS_ITEM_INTERFACE)?
            .member("PropertiesChanged")?
            .build(),
        &connection,
        Some(256),
    )
    .await?;

    let registrator = match args.registrator.as_ref().filter(|_| args.init_broker) {
        Some(helper) => {
            let mut registrator = HelperRegistrator::new(helper.clone(), portal_id.clone());
            registrator.register().await?;
            Some(registrator)
        }
        None => None,
    };

    let (client, broker_events) = mqtt::broker_client(&args)?;
    let mut bridge = Bridge::new(portal_id, bus, client, registrator);
    bridge.bootstrap().await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    let usr1 = signal(SignalKind::user_defined1())?;

    bridge
        .run(change_signals, owner_changes, broker_events, usr1, cancel)
        .await
}

async fn connect_bus(address: Option<&str>) -> BridgeResult<Connection> {
    let connection = match address {
        Some(address) => zbus::connection::Builder::address(address)?.build().await?,
        None if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_some() => {
            Connection::session().await?
        }
        None => Connection::system().await?,
    };
    Ok(connection)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}
