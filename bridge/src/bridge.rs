//! The mirroring engine.
//!
//! One task owns every table and multiplexes all event sources: value-change
//! signals and name-owner changes from the bus, events from the broker
//! client, the 1 Hz queue timer, and an "idle drain" that runs as soon as
//! the loop has nothing better to do. Serializing everything on a single
//! loop is what makes the tables safe to own without locks.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use futures::{Stream, StreamExt};
use rumqttc::{ConnectionError, Event, EventLoop, Packet};
use tokio::signal::unix::Signal;
use tokio_util::sync::CancellationToken;
use zbus::{fdo, zvariant::OwnedValue};

use crate::{
    bus::ValueBus,
    error::BridgeResult,
    liveness::{BrokerLink, LinkAction},
    mirror::MirrorTable,
    mqtt::Broker,
    queue::{PublishQueue, DRAIN_BATCH},
    registrator::Registrator,
    registry::{self, ServiceRegistry},
    scan,
    topics::{self, RequestAction},
};

/// Pause after a failed broker poll before letting the client reconnect.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct Bridge<B, K, R> {
    portal_id: String,
    bus: B,
    broker: K,
    registrator: Option<R>,
    registry: ServiceRegistry,
    mirror: MirrorTable,
    queue: PublishQueue,
    link: BrokerLink,
    /// Set when request handling wants the queue drained as soon as the
    /// loop is free, without waiting for the timer.
    drain_scheduled: bool,
}

impl<B, K, R> Bridge<B, K, R>
where
    B: ValueBus,
    K: Broker,
    R: Registrator,
{
    pub(crate) fn new(portal_id: String, bus: B, broker: K, registrator: Option<R>) -> Self {
        let mirror = MirrorTable::new(portal_id.clone());
        Self {
            portal_id,
            bus,
            broker,
            registrator,
            registry: ServiceRegistry::default(),
            mirror,
            queue: PublishQueue::new(),
            link: BrokerLink::new(),
            drain_scheduled: false,
        }
    }

    /// Enumerates the bus and scans every vendor service. Initial values are
    /// recorded without publishing; the first broker connect publishes the
    /// whole table.
    pub(crate) async fn bootstrap(&mut self) -> BridgeResult<()> {
        let names = self.bus.list_names().await?;
        for name in names {
            if !name.starts_with(registry::SERVICE_PREFIX) {
                continue;
            }
            let owner = match self.bus.name_owner(&name).await {
                Ok(owner) => owner,
                Err(error) => {
                    tracing::debug!(%error, service = %name, "no owner for service");
                    continue;
                }
            };
            self.onboard_service(&name, &owner, false).await;
        }
        Ok(())
    }

    /// Runs the event loop until cancelled.
    pub(crate) async fn run<S, O>(
        mut self,
        mut bus_signals: S,
        mut owner_changes: O,
        mut broker_events: EventLoop,
        mut usr1: Signal,
        cancel: CancellationToken,
    ) -> BridgeResult<()>
    where
        S: Stream<Item = Result<zbus::Message, zbus::Error>> + Unpin,
        O: Stream<Item = fdo::NameOwnerChanged> + Unpin,
    {
        let mut flush_timer = tokio::time::interval(Duration::from_secs(1));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested, exiting");
                    break;
                }

                Some(message) = bus_signals.next() => match message {
                    Ok(message) => self.handle_bus_signal(&message),
                    Err(error) => tracing::debug!(%error, "bad message on signal stream"),
                },

                Some(change) = owner_changes.next() => {
                    self.handle_owner_changed(change).await;
                }

                event = broker_events.poll() => {
                    self.handle_broker_event(event).await;
                }

                _ = flush_timer.tick() => {
                    self.handle_flush_timer().await;
                }

                _ = usr1.recv() => {
                    self.dump_state();
                }

                _ = std::future::ready(()), if self.drain_scheduled => {
                    self.idle_drain().await;
                }
            }
        }

        Ok(())
    }

    fn handle_bus_signal(&mut self, message: &zbus::Message) {
        let header = message.header();
        let (Some(path), Some(sender)) = (header.path(), header.sender()) else {
            return;
        };
        let changes: HashMap<String, OwnedValue> = match message.body().deserialize() {
            Ok(changes) => changes,
            Err(error) => {
                tracing::debug!(%error, "undecodable change signal");
                return;
            }
        };
        let path = path.to_string();
        let sender = sender.to_string();
        self.apply_value_change(&sender, &path, &changes);
    }

    /// A `PropertiesChanged` from some value item. Unknown senders are
    /// stale (their service already departed) and dropped.
    fn apply_value_change(
        &mut self,
        sender: &str,
        path: &str,
        changes: &HashMap<String, OwnedValue>,
    ) {
        let Some(service) = self.registry.resolve_by_owner(sender) else {
            return;
        };
        let service = service.clone();

        let uid = format!("{service}{path}");
        let topic = match self.mirror.topic_for_uid(&uid) {
            Some(topic) => topic.clone(),
            None => {
                // First sight of this path; mint an entry under the
                // instance the service was recorded with.
                let Some(instance) = self.registry.instance_of(&service) else {
                    return;
                };
                tracing::info!(%uid, "new item found");
                match self.mirror.add(&service, instance, path, serde_json::Value::Null) {
                    Some(topic) => topic,
                    None => return,
                }
            }
        };

        let Some(raw) = changes.get("Value") else {
            return;
        };
        let value = dbus_mqtt_values::json_from_variant(raw);
        self.mirror.update(&topic, value.clone());
        self.queue.publish(&topic, topics::value_payload(&value));
    }

    async fn handle_owner_changed(&mut self, change: fdo::NameOwnerChanged) {
        let args = match change.args() {
            Ok(args) => args,
            Err(error) => {
                tracing::debug!(%error, "undecodable name owner change");
                return;
            }
        };
        let name = args.name().to_string();
        let old_owner = args.old_owner().as_ref().map(ToString::to_string);
        let new_owner = args.new_owner().as_ref().map(ToString::to_string);
        self.apply_owner_change(&name, old_owner.as_deref(), new_owner.as_deref())
            .await;
    }

    /// An owner swap (both sides present) is a departure of the old owner
    /// followed by an appearance of the new one.
    async fn apply_owner_change(
        &mut self,
        name: &str,
        old_owner: Option<&str>,
        new_owner: Option<&str>,
    ) {
        if !name.starts_with(registry::SERVICE_PREFIX) {
            return;
        }
        if let Some(old_owner) = old_owner {
            self.depart_service(name, old_owner);
        }
        if let Some(new_owner) = new_owner {
            self.onboard_service(name, new_owner, true).await;
        }
    }

    fn depart_service(&mut self, name: &str, owner: &str) {
        tracing::info!(service = name, "service disappeared");
        self.mirror.remove_service(name, &mut self.queue);
        self.registry.forget_by_name(name);
        self.registry.forget_by_owner(owner);
    }

    /// Scans a service and commits the result. An abandoned scan commits
    /// nothing; a failed one only aborts this service.
    async fn onboard_service(&mut self, service: &str, owner: &str, publish: bool) {
        match scan::scan(&self.bus, service).await {
            Ok(Some(scanned)) => {
                self.registry.record(owner, service, scanned.instance);
                for (path, value) in scanned.items {
                    let Some(topic) =
                        self.mirror.add(service, scanned.instance, &path, value.clone())
                    else {
                        continue;
                    };
                    if publish {
                        self.queue.publish(&topic, topics::value_payload(&value));
                    }
                }
            }
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, service, "failed to scan service"),
        }
    }

    async fn handle_broker_event(&mut self, event: Result<Event, ConnectionError>) {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(code = ?ack.code, "connected to broker");
                self.handle_session_established().await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.handle_broker_message(&publish.topic, &publish.payload)
                    .await;
            }
            Ok(_) => {}
            Err(error) => {
                self.link.session_lost();
                tracing::warn!(%error, "broker connection error");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }

    /// A fresh broker session: subscribe the request filters (and the
    /// reserved connection-state topic when we have a registered client id)
    /// and republish the whole table, since values may have changed while
    /// we were disconnected.
    async fn handle_session_established(&mut self) {
        self.link.session_established();

        let mut filters = vec![
            format!("R/{}/#", self.portal_id),
            format!("W/{}/#", self.portal_id),
        ];
        if let Some(client_id) = self.registrator.as_ref().and_then(Registrator::client_id) {
            filters.push(topics::connection_state_topic(client_id));
        }
        for filter in filters {
            if let Err(error) = self.broker.subscribe(&filter).await {
                tracing::error!(%error, %filter, "failed to subscribe");
            }
        }

        self.publish_all();
    }

    fn publish_all(&mut self) {
        for (topic, value) in self.mirror.snapshot_sorted() {
            self.queue.publish(&topic, topics::value_payload(&value));
        }
    }

    async fn handle_broker_message(&mut self, topic: &str, payload: &[u8]) {
        if topics::is_connection_state(topic) {
            if self.link.connection_state_message(payload) == LinkAction::Reregister {
                if let Some(registrator) = self.registrator.as_mut() {
                    if let Err(error) = registrator.register().await {
                        tracing::error!(%error, "re-registration with the remote broker failed");
                    }
                }
            }
            return;
        }

        tracing::debug!(topic, "handling request");
        self.handle_request(topic, payload).await;
    }

    /// An inbound read or write. Bad requests are logged and dropped, since
    /// no error channel exists on the broker.
    async fn handle_request(&mut self, topic: &str, payload: &[u8]) {
        let Some(request) = topics::parse_request(topic) else {
            tracing::warn!(topic, "malformed request topic");
            return;
        };
        if request.portal_id != self.portal_id {
            tracing::warn!(topic, "request for foreign portal id");
            return;
        }
        let Some(service) = self
            .registry
            .resolve_by_type_instance(request.service_type, request.device_instance)
        else {
            tracing::warn!(topic, "request for unknown service");
            return;
        };
        let service = service.clone();
        let path = format!("/{}", request.path);

        match request.action {
            RequestAction::Write => {
                let value = match serde_json::from_slice::<serde_json::Value>(payload) {
                    Ok(serde_json::Value::Object(mut envelope)) => match envelope.remove("value") {
                        Some(value) => value,
                        None => {
                            tracing::warn!(topic, "write payload has no value field");
                            return;
                        }
                    },
                    Ok(_) => {
                        tracing::warn!(topic, "write payload is not an object");
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(%error, topic, "unparseable write payload");
                        return;
                    }
                };
                tracing::debug!(%service, %path, "writing value");
                if let Err(error) = self.bus.set_value(&service, &path, &value).await {
                    tracing::warn!(%error, %service, %path, "write failed");
                    return;
                }
                self.drain_scheduled = true;
            }
            RequestAction::Read => {
                // Some paths never signal PropertiesChanged yet remain
                // readable; a read request learns them on demand.
                let value = match self.bus.get_value(&service, &path).await {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(%error, %service, %path, "read failed");
                        return;
                    }
                };
                let Some(topic) =
                    self.mirror
                        .add(&service, request.device_instance, &path, value.clone())
                else {
                    return;
                };
                self.mirror.update(&topic, value.clone());
                self.queue.publish(&topic, topics::value_payload(&value));
                self.drain_scheduled = true;
            }
        }
    }

    async fn handle_flush_timer(&mut self) {
        if self.queue.should_timer_drain(Instant::now())
            && self.queue.drain(&self.broker, DRAIN_BATCH).await
        {
            self.drain_scheduled = true;
        }
    }

    async fn idle_drain(&mut self) {
        self.drain_scheduled = self.queue.drain(&self.broker, DRAIN_BATCH).await;
    }

    fn dump_state(&self) {
        tracing::info!(
            services = self.registry.service_count(),
            mirrored = self.mirror.entry_count(),
            queued = self.queue.depth(),
            link = ?self.link.state(),
            "state dump"
        );
    }
}
