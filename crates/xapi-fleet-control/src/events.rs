//! Remote event sources.
//!
//! An event source keeps the current set of raw objects of one connection
//! and emits ordered batches of changes, each followed by
//! [`SourceEvent::Finish`]. Subscribers get a channel; dropping the
//! receiver unsubscribes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use xapi_fleet_core::RawId;
use xapi_fleet_session::{RemoteSession, SessionError};

use crate::error::Result;
use crate::types::RawObject;

/// One change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Objects seen for the first time.
    Add(Vec<RawObject>),
    /// Objects that changed.
    Update(Vec<RawObject>),
    /// Objects that went away.
    Remove(Vec<RawId>),
    /// End of a batch.
    Finish,
}

/// A new subscription: the objects known at subscription time and the
/// changes after it.
#[derive(Debug)]
pub struct Subscription {
    /// Objects known when the subscription was taken.
    pub snapshot: Vec<RawObject>,
    /// Subsequent events.
    pub events: mpsc::UnboundedReceiver<SourceEvent>,
}

/// A stream of raw object changes for one connection.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Subscribe to changes.
    fn subscribe(&self) -> Subscription;

    /// The currently known objects.
    fn snapshot(&self) -> Vec<RawObject>;

    /// A currently known object.
    fn get(&self, raw_id: &RawId) -> Option<RawObject>;

    /// Begin producing events.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load fails.
    async fn start(&self) -> Result<()>;

    /// Stop producing events.
    async fn stop(&self);

    /// Replace a known object with a freshly fetched record, as if it had
    /// arrived in its own batch.
    fn refresh(&self, raw: RawObject);
}

/// Object cache plus subscriber fan-out, shared by the sources.
#[derive(Default)]
pub struct EventHub {
    objects: RwLock<HashMap<RawId, RawObject>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SourceEvent>>>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe, atomically with respect to [`publish`](Self::publish).
    pub fn subscribe(&self) -> Subscription {
        let mut subscribers = self.subscribers.lock();
        let (sender, events) = mpsc::unbounded_channel();
        subscribers.push(sender);
        Subscription {
            snapshot: self.snapshot(),
            events,
        }
    }

    /// The currently known objects.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RawObject> {
        self.objects.read().values().cloned().collect()
    }

    /// A currently known object.
    #[must_use]
    pub fn get(&self, raw_id: &RawId) -> Option<RawObject> {
        self.objects.read().get(raw_id).cloned()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| !sender.is_closed());
        subscribers.len()
    }

    /// Apply an event to the cache and send it to every subscriber.
    ///
    /// Closed subscriptions are dropped.
    pub fn publish(&self, event: SourceEvent) {
        let mut subscribers = self.subscribers.lock();
        {
            let mut objects = self.objects.write();
            match &event {
                SourceEvent::Add(added) | SourceEvent::Update(added) => {
                    for raw in added {
                        objects.insert(raw.raw_id.clone(), raw.clone());
                    }
                }
                SourceEvent::Remove(removed) => {
                    for raw_id in removed {
                        objects.remove(raw_id);
                    }
                }
                SourceEvent::Finish => {}
            }
        }
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Publish `raw` as a one-object batch: an update if it is known, an
    /// add otherwise.
    pub fn refresh(&self, raw: RawObject) {
        let event = if self.get(&raw.raw_id).is_some() {
            SourceEvent::Update(vec![raw])
        } else {
            SourceEvent::Add(vec![raw])
        };
        self.publish(event);
        self.publish(SourceEvent::Finish);
    }
}

/// Event source polling `event.from` on a session.
pub struct XapiEventSource {
    session: RemoteSession,
    classes: Vec<String>,
    hub: Arc<EventHub>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl XapiEventSource {
    /// Create a source watching `classes` (`"*"` for all).
    #[must_use]
    pub fn new(session: RemoteSession, classes: Vec<String>) -> Self {
        Self {
            session,
            classes,
            hub: Arc::new(EventHub::new()),
            task: Mutex::new(None),
        }
    }

    /// One `event.from` round. Returns the next token.
    async fn poll(
        session: &RemoteSession,
        hub: &EventHub,
        classes: &[String],
        token: &str,
        pool_uuid: &mut Option<String>,
    ) -> std::result::Result<String, SessionError> {
        let timeout = session.config().event_timeout().as_secs_f64();
        let response = session
            .call("event.from", vec![json!(classes), json!(token), json!(timeout)])
            .await?;

        let next = response
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("event.from returned no token".to_string()))?
            .to_string();

        let records = match response.get("events") {
            Some(Value::Array(records)) => records.as_slice(),
            _ => &[],
        };
        for event in batch_events(hub, records, pool_uuid) {
            hub.publish(event);
        }
        hub.publish(SourceEvent::Finish);

        Ok(next)
    }
}

/// Group one `event.from` result into add, update, and remove events.
///
/// Pool records are handled first so the objects of the batch can be
/// attributed to the pool.
fn batch_events(
    hub: &EventHub,
    records: &[Value],
    pool_uuid: &mut Option<String>,
) -> Vec<SourceEvent> {
    let mut ordered: Vec<&Value> = records
        .iter()
        .filter(|r| r.get("class").and_then(Value::as_str) == Some("pool"))
        .collect();
    ordered.extend(
        records
            .iter()
            .filter(|r| r.get("class").and_then(Value::as_str) != Some("pool")),
    );

    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut removed = Vec::new();

    for record in ordered {
        let (Some(class), Some(operation), Some(raw_ref)) = (
            record.get("class").and_then(Value::as_str),
            record.get("operation").and_then(Value::as_str),
            record.get("ref").and_then(Value::as_str),
        ) else {
            tracing::debug!(record = %record, "Skipping malformed event record");
            continue;
        };
        let raw_id = RawId::new(raw_ref);

        if operation == "del" {
            removed.push(raw_id);
            continue;
        }

        let Some(Value::Object(fields)) = record.get("snapshot") else {
            continue;
        };
        let mut raw = RawObject::new(raw_id, class, fields.clone());
        if class == "pool" {
            if let Some(uuid) = raw.uuid() {
                *pool_uuid = Some(uuid.to_string());
            }
        }
        raw.pool_uuid.clone_from(pool_uuid);

        if hub.get(&raw.raw_id).is_some() {
            updated.push(raw);
        } else {
            added.push(raw);
        }
    }

    let mut events = Vec::new();
    if !added.is_empty() {
        events.push(SourceEvent::Add(added));
    }
    if !updated.is_empty() {
        events.push(SourceEvent::Update(updated));
    }
    if !removed.is_empty() {
        events.push(SourceEvent::Remove(removed));
    }
    events
}

#[async_trait]
impl EventSource for XapiEventSource {
    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn snapshot(&self) -> Vec<RawObject> {
        self.hub.snapshot()
    }

    fn get(&self, raw_id: &RawId) -> Option<RawObject> {
        self.hub.get(raw_id)
    }

    async fn start(&self) -> Result<()> {
        let mut pool_uuid = self.session.pool().map(|pool| pool.pool_uuid);

        // The first round with an empty token returns every current object.
        let token = Self::poll(&self.session, &self.hub, &self.classes, "", &mut pool_uuid).await?;

        let session = self.session.clone();
        let hub = Arc::clone(&self.hub);
        let classes = self.classes.clone();
        let retry_delay = session.config().retry_delay();

        let handle = tokio::spawn(async move {
            let mut token = token;
            loop {
                match Self::poll(&session, &hub, &classes, &token, &mut pool_uuid).await {
                    Ok(next) => token = next,
                    Err(SessionError::Disconnected) => break,
                    Err(error) => {
                        tracing::warn!(host = %session.host(), error = %error, "Event poll failed");
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
            tracing::debug!(host = %session.host(), "Event polling stopped");
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn refresh(&self, raw: RawObject) {
        self.hub.refresh(raw);
    }
}

/// Event source fed by hand.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct ManualEventSource {
    hub: EventHub,
    started: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualEventSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an event.
    pub fn emit(&self, event: SourceEvent) {
        self.hub.publish(event);
    }

    /// Emit `events` followed by a finish marker.
    pub fn emit_batch(&self, events: impl IntoIterator<Item = SourceEvent>) {
        for event in events {
            self.emit(event);
        }
        self.emit(SourceEvent::Finish);
    }

    /// Whether the source is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl EventSource for ManualEventSource {
    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn snapshot(&self) -> Vec<RawObject> {
        self.hub.snapshot()
    }

    fn get(&self, raw_id: &RawId) -> Option<RawObject> {
        self.hub.get(raw_id)
    }

    async fn start(&self) -> Result<()> {
        self.started
            .store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.started
            .store(false, std::sync::atomic::Ordering::Release);
    }

    fn refresh(&self, raw: RawObject) {
        self.hub.refresh(raw);
    }
}

/// Build a raw object from a JSON record, for tests and fixtures.
#[cfg(any(test, feature = "test-utils"))]
#[must_use]
pub fn raw_object(raw_id: &str, class: &str, record: Value) -> RawObject {
    let fields = match record {
        Value::Object(fields) => fields,
        _ => serde_json::Map::new(),
    };
    RawObject::new(raw_id, class, fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use xapi_fleet_session::{Credentials, MockTransportFactory, SessionConfig, TransportFactory};

    #[test]
    fn hub_tracks_objects() {
        let hub = EventHub::new();
        let vm = raw_object("OpaqueRef:vm", "VM", json!({"uuid": "vm-1"}));

        hub.publish(SourceEvent::Add(vec![vm.clone()]));
        assert_eq!(hub.get(&vm.raw_id), Some(vm.clone()));

        hub.publish(SourceEvent::Remove(vec![vm.raw_id.clone()]));
        assert!(hub.get(&vm.raw_id).is_none());
        assert!(hub.snapshot().is_empty());
    }

    #[test]
    fn subscription_sees_snapshot_then_events() {
        let hub = EventHub::new();
        let vm = raw_object("OpaqueRef:vm", "VM", json!({"uuid": "vm-1"}));
        hub.publish(SourceEvent::Add(vec![vm.clone()]));

        let mut subscription = hub.subscribe();
        assert_eq!(subscription.snapshot, vec![vm.clone()]);

        hub.publish(SourceEvent::Finish);
        assert_eq!(subscription.events.try_recv().unwrap(), SourceEvent::Finish);
    }

    #[test]
    fn refresh_publishes_a_one_object_batch() {
        let hub = EventHub::new();
        let mut subscription = hub.subscribe();
        let vm = raw_object("OpaqueRef:vm", "VM", json!({"uuid": "vm-1", "name_label": "a"}));
        let renamed = raw_object("OpaqueRef:vm", "VM", json!({"uuid": "vm-1", "name_label": "b"}));

        hub.refresh(vm.clone());
        assert_eq!(
            subscription.events.try_recv().unwrap(),
            SourceEvent::Add(vec![vm])
        );
        assert_eq!(subscription.events.try_recv().unwrap(), SourceEvent::Finish);

        hub.refresh(renamed.clone());
        assert_eq!(
            subscription.events.try_recv().unwrap(),
            SourceEvent::Update(vec![renamed.clone()])
        );
        assert_eq!(subscription.events.try_recv().unwrap(), SourceEvent::Finish);
        assert_eq!(hub.get(&renamed.raw_id), Some(renamed));
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let hub = EventHub::new();
        let first = hub.subscribe();
        let _second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        hub.publish(SourceEvent::Finish);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn batches_group_operations_and_attribute_pool() {
        let hub = EventHub::new();
        hub.publish(SourceEvent::Add(vec![raw_object(
            "OpaqueRef:vm",
            "VM",
            json!({"uuid": "vm-1"}),
        )]));

        let records = vec![
            json!({"class": "VM", "operation": "mod", "ref": "OpaqueRef:vm", "snapshot": {"uuid": "vm-1"}}),
            json!({"class": "VIF", "operation": "add", "ref": "OpaqueRef:vif", "snapshot": {"uuid": "vif-1"}}),
            json!({"class": "VBD", "operation": "del", "ref": "OpaqueRef:vbd"}),
            json!({"class": "pool", "operation": "add", "ref": "OpaqueRef:pool", "snapshot": {"uuid": "pool-1"}}),
            json!({"operation": "add"}),
        ];

        let mut pool_uuid = None;
        let events = batch_events(&hub, &records, &mut pool_uuid);

        assert_eq!(pool_uuid.as_deref(), Some("pool-1"));
        assert_eq!(events.len(), 3);

        let SourceEvent::Add(added) = &events[0] else {
            panic!("expected add first");
        };
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].class, "pool");
        assert!(added.iter().all(|raw| raw.pool_uuid.as_deref() == Some("pool-1")));

        let SourceEvent::Update(updated) = &events[1] else {
            panic!("expected update second");
        };
        assert_eq!(updated[0].raw_id.as_str(), "OpaqueRef:vm");

        assert_eq!(
            events[2],
            SourceEvent::Remove(vec![RawId::from("OpaqueRef:vbd")])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn xapi_source_loads_then_polls() {
        let factory = Arc::new(MockTransportFactory::new());
        let h1 = factory.transport("h1");
        h1.enqueue(
            "event.from",
            Ok(json!({
                "token": "t1",
                "events": [
                    {"class": "pool", "operation": "add", "ref": "OpaqueRef:pool", "snapshot": {"uuid": "pool-1"}},
                    {"class": "VM", "operation": "add", "ref": "OpaqueRef:vm", "snapshot": {"uuid": "vm-1"}}
                ]
            })),
        );
        h1.enqueue(
            "event.from",
            Ok(json!({
                "token": "t2",
                "events": [{"class": "VM", "operation": "del", "ref": "OpaqueRef:vm"}]
            })),
        );
        // A dropped session ends the loop.
        h1.fail_next("event.from", SessionError::Disconnected);

        let session = RemoteSession::new(
            "h1",
            Credentials::new("u", "p"),
            true,
            SessionConfig::default(),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
        )
        .unwrap();
        let source = XapiEventSource::new(session, vec!["*".to_string()]);
        let mut subscription = source.subscribe();

        source.start().await.unwrap();
        assert_eq!(source.snapshot().len(), 2);

        let mut received = Vec::new();
        while received.len() < 4 {
            received.push(subscription.events.recv().await.unwrap());
        }
        assert!(matches!(&received[0], SourceEvent::Add(objects) if objects.len() == 2));
        assert_eq!(received[1], SourceEvent::Finish);
        assert_eq!(
            received[2],
            SourceEvent::Remove(vec![RawId::from("OpaqueRef:vm")])
        );
        assert_eq!(received[3], SourceEvent::Finish);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h1.call_count("event.from"), 3);
        assert!(source.get(&RawId::from("OpaqueRef:vm")).is_none());
        source.stop().await;

        let polls = h1.calls_to("event.from");
        assert_eq!(polls[0].params[2], json!(""));
        assert_eq!(polls[1].params[2], json!("t1"));
    }
}
