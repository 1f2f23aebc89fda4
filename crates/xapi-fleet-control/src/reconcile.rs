//! Multi-connection reconciliation.
//!
//! Every connection reports raw objects. The reconciler translates them and
//! merges them into one object store keyed by domain id. When several
//! connections report the same domain id, the store holds one value and the
//! others wait in a conflict set; when the holder's object goes away, the
//! most recently reported candidate takes its place.
//!
//! Records that fail to translate are retried at the end of the next batch
//! after the one that produced them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use xapi_fleet_core::{ObjectId, RawId, ServerId};

use crate::events::SourceEvent;
use crate::objects::ObjectStore;
use crate::translate::Translator;
use crate::types::{DomainObject, RawObject};

/// Per-connection bookkeeping.
#[derive(Debug, Default)]
struct ConnectionState {
    /// Remote reference to domain id, for every object this connection
    /// contributed.
    index: HashMap<RawId, ObjectId>,
    /// Failed in the current batch; promoted at the next finish.
    retry_pending: HashMap<RawId, RawObject>,
    /// Retried at the next finish.
    retry_promoted: HashMap<RawId, RawObject>,
}

/// Values held back for one domain id, oldest first.
#[derive(Debug, Default)]
struct ConflictSet {
    entries: Vec<DomainObject>,
}

impl ConflictSet {
    fn upsert(&mut self, object: DomainObject) {
        self.entries.retain(|entry| entry.origin != object.origin);
        self.entries.push(object);
    }

    fn remove(&mut self, origin: &ServerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.origin != *origin);
        self.entries.len() != before
    }
}

#[derive(Debug, Default)]
struct ReconcileState {
    connections: HashMap<ServerId, ConnectionState>,
    conflicts: HashMap<ObjectId, ConflictSet>,
}

/// Merges the objects of every connection into one store.
pub struct Reconciler {
    translator: Arc<dyn Translator>,
    objects: Arc<dyn ObjectStore>,
    state: Mutex<ReconcileState>,
}

impl Reconciler {
    /// Create a reconciler writing to `objects`.
    #[must_use]
    pub fn new(translator: Arc<dyn Translator>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            translator,
            objects,
            state: Mutex::new(ReconcileState::default()),
        }
    }

    /// The store this reconciler writes to.
    #[must_use]
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Start tracking a connection. Attaching twice keeps the existing state.
    pub fn attach(&self, server_id: ServerId) {
        self.state.lock().connections.entry(server_id).or_default();
    }

    /// Check whether a connection is tracked.
    #[must_use]
    pub fn is_attached(&self, server_id: &ServerId) -> bool {
        self.state.lock().connections.contains_key(server_id)
    }

    /// Withdraw every object of a connection and stop tracking it.
    pub fn detach(&self, server_id: &ServerId) {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.get(server_id) else {
            return;
        };
        let raw_ids: Vec<RawId> = connection.index.keys().cloned().collect();
        for raw_id in &raw_ids {
            self.remove_locked(&mut state, server_id, raw_id);
        }
        state.connections.remove(server_id);
        tracing::debug!(server_id = %server_id, withdrawn = raw_ids.len(), "Connection detached");
    }

    /// Apply one event from a connection. Events of unknown connections are
    /// ignored.
    pub fn apply(&self, server_id: &ServerId, event: &SourceEvent) {
        let mut state = self.state.lock();
        if !state.connections.contains_key(server_id) {
            return;
        }
        match event {
            SourceEvent::Add(objects) | SourceEvent::Update(objects) => {
                for raw in objects {
                    self.upsert_locked(&mut state, server_id, raw);
                }
            }
            SourceEvent::Remove(raw_ids) => {
                for raw_id in raw_ids {
                    self.remove_locked(&mut state, server_id, raw_id);
                }
            }
            SourceEvent::Finish => self.finish_locked(&mut state, server_id),
        }
    }

    /// Feed every object known at subscription time.
    pub fn apply_snapshot(&self, server_id: &ServerId, snapshot: &[RawObject]) {
        let mut state = self.state.lock();
        if !state.connections.contains_key(server_id) {
            return;
        }
        for raw in snapshot {
            self.upsert_locked(&mut state, server_id, raw);
        }
    }

    /// Number of objects a connection contributes.
    #[must_use]
    pub fn claims(&self, server_id: &ServerId) -> usize {
        self.state
            .lock()
            .connections
            .get(server_id)
            .map_or(0, |connection| connection.index.len())
    }

    /// Connections whose value for `id` is held back, oldest first.
    #[must_use]
    pub fn conflict_candidates(&self, id: &ObjectId) -> Vec<ServerId> {
        self.state.lock().conflicts.get(id).map_or_else(Vec::new, |set| {
            set.entries.iter().map(|entry| entry.origin).collect()
        })
    }

    /// Number of records of a connection awaiting another translation attempt.
    #[must_use]
    pub fn pending_retries(&self, server_id: &ServerId) -> usize {
        self.state
            .lock()
            .connections
            .get(server_id)
            .map_or(0, |connection| {
                connection.retry_pending.len() + connection.retry_promoted.len()
            })
    }

    fn upsert_locked(&self, state: &mut ReconcileState, server_id: &ServerId, raw: &RawObject) {
        let Some(connection) = state.connections.get_mut(server_id) else {
            return;
        };

        let translated = match self.translator.translate(raw) {
            Ok(Some(translated)) => translated,
            Ok(None) => return,
            Err(failure) => {
                tracing::warn!(server_id = %server_id, error = %failure, "Translation failed, will retry");
                connection.retry_promoted.remove(&raw.raw_id);
                connection.retry_pending.insert(raw.raw_id.clone(), raw.clone());
                return;
            }
        };

        connection.retry_pending.remove(&raw.raw_id);
        connection.retry_promoted.remove(&raw.raw_id);
        connection.index.insert(raw.raw_id.clone(), translated.id.clone());

        let object = DomainObject {
            id: translated.id,
            kind: translated.kind,
            attributes: translated.attributes,
            pool_id: translated.pool_id,
            raw_id: raw.raw_id.clone(),
            origin: *server_id,
        };
        tracing::trace!(server_id = %server_id, id = %object.id, kind = %object.kind, "Object upserted");

        match self.objects.get(&object.id) {
            Some(current) if current.origin != *server_id => {
                tracing::debug!(
                    id = %object.id,
                    holder = %current.origin,
                    candidate = %server_id,
                    "Object reported by several connections"
                );
                state
                    .conflicts
                    .entry(object.id.clone())
                    .or_default()
                    .upsert(object);
            }
            _ => self.objects.set(object),
        }
    }

    fn remove_locked(&self, state: &mut ReconcileState, server_id: &ServerId, raw_id: &RawId) {
        let Some(connection) = state.connections.get_mut(server_id) else {
            return;
        };
        connection.retry_pending.remove(raw_id);
        connection.retry_promoted.remove(raw_id);

        let Some(id) = connection.index.remove(raw_id) else {
            return;
        };
        tracing::trace!(server_id = %server_id, id = %id, "Object removed");

        let Some(conflicts) = state.conflicts.get_mut(&id) else {
            self.objects.unset(&id);
            return;
        };
        if !conflicts.remove(server_id) {
            // The holder went away; the latest candidate replaces it.
            if let Some(next) = conflicts.entries.pop() {
                self.objects.set(next);
            }
        }
        if conflicts.entries.is_empty() {
            state.conflicts.remove(&id);
        }
    }

    fn finish_locked(&self, state: &mut ReconcileState, server_id: &ServerId) {
        let Some(connection) = state.connections.get_mut(server_id) else {
            return;
        };
        let promoted = std::mem::take(&mut connection.retry_promoted);
        for raw in promoted.values() {
            self.upsert_locked(state, server_id, raw);
        }
        if let Some(connection) = state.connections.get_mut(server_id) {
            connection.retry_promoted = std::mem::take(&mut connection.retry_pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::raw_object;
    use crate::objects::MemoryObjectStore;
    use crate::translate::{StandardTranslator, TranslatedObject, TranslationFailure};
    use crate::types::ObjectKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Reconciler, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        let reconciler = Reconciler::new(
            Arc::new(StandardTranslator),
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
        );
        (reconciler, objects)
    }

    fn vif(raw_id: &str, uuid: &str, mac: &str) -> RawObject {
        raw_object(raw_id, "VIF", json!({"uuid": uuid, "MAC": mac}))
    }

    fn id(value: &str) -> ObjectId {
        ObjectId::new(value).unwrap()
    }

    #[test]
    fn add_then_remove() {
        let (reconciler, objects) = setup();
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("ref-1", "vif-1", "aa")]));
        let stored = objects.get(&id("vif-1")).unwrap();
        assert_eq!(stored.kind, ObjectKind::Vif);
        assert_eq!(stored.origin, s1);
        assert_eq!(stored.raw_id.as_str(), "ref-1");
        assert_eq!(reconciler.claims(&s1), 1);

        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("ref-1")]));
        assert!(objects.get(&id("vif-1")).is_none());
        assert_eq!(reconciler.claims(&s1), 0);
    }

    #[test]
    fn removing_unknown_reference_is_noop() {
        let (reconciler, objects) = setup();
        let s1 = ServerId::generate();
        reconciler.attach(s1);
        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("ref-1", "vif-1", "aa")]));

        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("ref-2")]));
        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("ref-1")]));
        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("ref-1")]));

        assert!(objects.is_empty());
    }

    #[test]
    fn unknown_connection_is_ignored() {
        let (reconciler, objects) = setup();
        let s1 = ServerId::generate();

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("ref-1", "vif-1", "aa")]));
        reconciler.apply_snapshot(&s1, &[vif("ref-1", "vif-1", "aa")]);

        assert!(objects.is_empty());
        assert!(!reconciler.is_attached(&s1));
    }

    #[test]
    fn update_replaces_value() {
        let (reconciler, objects) = setup();
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("ref-1", "vif-1", "aa")]));
        reconciler.apply(&s1, &SourceEvent::Update(vec![vif("ref-1", "vif-1", "bb")]));

        let stored = objects.get(&id("vif-1")).unwrap();
        assert_eq!(stored.attributes["MAC"], json!("bb"));
        assert!(reconciler.conflict_candidates(&id("vif-1")).is_empty());
    }

    #[test]
    fn conflicting_connections_hand_over() {
        let (reconciler, objects) = setup();
        let (s1, s2, s3) = (ServerId::generate(), ServerId::generate(), ServerId::generate());
        for server in [s1, s2, s3] {
            reconciler.attach(server);
        }

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("a", "vif-1", "from-1")]));
        reconciler.apply(&s2, &SourceEvent::Add(vec![vif("b", "vif-1", "from-2")]));
        reconciler.apply(&s3, &SourceEvent::Add(vec![vif("c", "vif-1", "from-3")]));

        // First reporter holds the value.
        assert_eq!(objects.get(&id("vif-1")).unwrap().origin, s1);
        assert_eq!(reconciler.conflict_candidates(&id("vif-1")), vec![s2, s3]);

        // An update moves a candidate to the back.
        reconciler.apply(&s2, &SourceEvent::Update(vec![vif("b", "vif-1", "from-2b")]));
        assert_eq!(reconciler.conflict_candidates(&id("vif-1")), vec![s3, s2]);

        // Holder leaves: the most recent candidate takes over.
        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("a")]));
        let stored = objects.get(&id("vif-1")).unwrap();
        assert_eq!(stored.origin, s2);
        assert_eq!(stored.attributes["MAC"], json!("from-2b"));
        assert_eq!(reconciler.conflict_candidates(&id("vif-1")), vec![s3]);

        // A candidate leaving does not touch the stored value.
        reconciler.apply(&s3, &SourceEvent::Remove(vec![RawId::from("c")]));
        assert_eq!(objects.get(&id("vif-1")).unwrap().origin, s2);
        assert!(reconciler.conflict_candidates(&id("vif-1")).is_empty());

        reconciler.apply(&s2, &SourceEvent::Remove(vec![RawId::from("b")]));
        assert!(objects.is_empty());
    }

    #[test]
    fn detach_withdraws_everything() {
        let (reconciler, objects) = setup();
        let (s1, s2) = (ServerId::generate(), ServerId::generate());
        reconciler.attach(s1);
        reconciler.attach(s2);

        reconciler.apply(
            &s1,
            &SourceEvent::Add(vec![vif("a", "vif-1", "x"), vif("b", "vif-2", "y")]),
        );
        reconciler.apply(&s2, &SourceEvent::Add(vec![vif("c", "vif-2", "z")]));

        reconciler.detach(&s1);

        assert!(objects.get(&id("vif-1")).is_none());
        assert_eq!(objects.get(&id("vif-2")).unwrap().origin, s2);
        assert!(!reconciler.is_attached(&s1));

        // Late events from the detached connection change nothing.
        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("a", "vif-1", "x")]));
        assert!(objects.get(&id("vif-1")).is_none());
    }

    /// Fails the first `failures` attempts, then behaves like the standard
    /// translator.
    struct FlakyTranslator {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl Translator for FlakyTranslator {
        fn translate(
            &self,
            raw: &RawObject,
        ) -> Result<Option<TranslatedObject>, TranslationFailure> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(TranslationFailure::new(raw, "not ready"));
            }
            StandardTranslator.translate(raw)
        }
    }

    fn flaky(failures: usize) -> (Reconciler, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        let reconciler = Reconciler::new(
            Arc::new(FlakyTranslator {
                failures,
                attempts: AtomicUsize::new(0),
            }),
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
        );
        (reconciler, objects)
    }

    #[test]
    fn failed_translation_retried_after_next_batch() {
        let (reconciler, objects) = flaky(1);
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("a", "vif-1", "x")]));
        assert!(objects.is_empty());
        assert_eq!(reconciler.pending_retries(&s1), 1);

        // The failing batch ends: the record is promoted, not retried.
        reconciler.apply(&s1, &SourceEvent::Finish);
        assert!(objects.is_empty());
        assert_eq!(reconciler.pending_retries(&s1), 1);

        // The next batch ends: the record is retried.
        reconciler.apply(&s1, &SourceEvent::Finish);
        assert!(objects.get(&id("vif-1")).is_some());
        assert_eq!(reconciler.pending_retries(&s1), 0);
    }

    #[test]
    fn repeated_failures_keep_retrying() {
        let (reconciler, objects) = flaky(2);
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("a", "vif-1", "x")]));
        reconciler.apply(&s1, &SourceEvent::Finish);
        reconciler.apply(&s1, &SourceEvent::Finish);
        assert!(objects.is_empty());
        assert_eq!(reconciler.pending_retries(&s1), 1);

        reconciler.apply(&s1, &SourceEvent::Finish);
        reconciler.apply(&s1, &SourceEvent::Finish);
        assert!(objects.get(&id("vif-1")).is_some());
    }

    #[test]
    fn removal_cancels_retry() {
        let (reconciler, objects) = flaky(1);
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply(&s1, &SourceEvent::Add(vec![vif("a", "vif-1", "x")]));
        reconciler.apply(&s1, &SourceEvent::Remove(vec![RawId::from("a")]));
        assert_eq!(reconciler.pending_retries(&s1), 0);

        reconciler.apply(&s1, &SourceEvent::Finish);
        reconciler.apply(&s1, &SourceEvent::Finish);
        assert!(objects.is_empty());
    }

    #[test]
    fn random_interleavings_keep_one_live_value() {
        const UUIDS: [&str; 4] = ["vif-1", "vif-2", "vif-3", "vif-4"];

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (reconciler, objects) = setup();
            let servers = [ServerId::generate(), ServerId::generate(), ServerId::generate()];
            // Latest MAC each connection reported, per uuid.
            let mut claims: Vec<HashMap<&str, String>> = vec![HashMap::new(); servers.len()];
            for server in servers {
                reconciler.attach(server);
            }

            for step in 0..200 {
                let n = rng.gen_range(0..servers.len());
                let server = servers[n];

                if rng.gen_bool(0.05) {
                    reconciler.detach(&server);
                    reconciler.attach(server);
                    claims[n].clear();
                } else {
                    for _ in 0..rng.gen_range(1..=3) {
                        let uuid = UUIDS[rng.gen_range(0..UUIDS.len())];
                        let raw_id = format!("s{n}-{uuid}");
                        if rng.gen_bool(0.35) {
                            let event = SourceEvent::Remove(vec![RawId::from(raw_id)]);
                            reconciler.apply(&server, &event);
                            claims[n].remove(uuid);
                        } else {
                            let mac = format!("{seed}-{step}-{}", rng.gen_range(0..1000));
                            let event = if claims[n].contains_key(uuid) {
                                SourceEvent::Update(vec![vif(&raw_id, uuid, &mac)])
                            } else {
                                SourceEvent::Add(vec![vif(&raw_id, uuid, &mac)])
                            };
                            reconciler.apply(&server, &event);
                            claims[n].insert(uuid, mac);
                        }
                    }
                    reconciler.apply(&server, &SourceEvent::Finish);
                }

                for uuid in UUIDS {
                    let claimers: Vec<usize> =
                        (0..servers.len()).filter(|&i| claims[i].contains_key(uuid)).collect();
                    let stored = objects.get(&id(uuid));
                    let Some(stored) = stored else {
                        assert!(claimers.is_empty(), "seed {seed} step {step}: {uuid} lost");
                        continue;
                    };
                    let holder = servers
                        .iter()
                        .position(|server| *server == stored.origin)
                        .unwrap();
                    assert!(
                        claimers.contains(&holder),
                        "seed {seed} step {step}: {uuid} held by a connection that no longer reports it"
                    );
                    assert_eq!(stored.attributes["MAC"], json!(claims[holder][uuid]));

                    let mut waiting = reconciler.conflict_candidates(&id(uuid));
                    assert!(!waiting.contains(&stored.origin));
                    waiting.sort();
                    let mut others: Vec<ServerId> = claimers
                        .iter()
                        .filter(|&&i| i != holder)
                        .map(|&i| servers[i])
                        .collect();
                    others.sort();
                    assert_eq!(waiting, others, "seed {seed} step {step}: {uuid} candidates");
                }
            }
        }
    }

    #[test]
    fn snapshot_is_applied() {
        let (reconciler, objects) = setup();
        let s1 = ServerId::generate();
        reconciler.attach(s1);

        reconciler.apply_snapshot(
            &s1,
            &[
                vif("a", "vif-1", "x"),
                raw_object("m", "message", json!({"uuid": "msg-1"})),
            ],
        );

        assert_eq!(objects.len(), 1);
        assert_eq!(reconciler.claims(&s1), 1);
    }
}
