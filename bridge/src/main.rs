//! Bridges the local D-Bus to an MQTT broker: every value published by a
//! `com.victronenergy.*` service is mirrored as a retained topic, and
//! topic-encoded read/write requests flow back in as bus calls.

use clap::Parser;

use crate::{entrypoint::Args, error::BridgeResult};

mod bridge;
mod bus;
mod entrypoint;
mod error;
mod liveness;
mod mirror;
mod mqtt;
mod queue;
mod registrator;
mod registry;
mod scan;
mod topics;

// Everything runs on one cooperative loop; the tables never leave it.
#[tokio::main(flavor = "current_thread")]
async fn main() -> BridgeResult<()> {
    entrypoint::run(Args::parse()).await
}
