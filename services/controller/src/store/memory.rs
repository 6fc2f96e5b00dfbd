//! In-memory cluster state store.
//!
//! Holds AppScalers and Workloads behind a single lock, assigns uids and
//! resource versions, and broadcasts a [`StoreEvent`] after every successful
//! mutation. Operator-side writes (`apply_*`, `delete_*`,
//! `set_workload_replicas`) are unconditional; controller-side writes go
//! through [`ClusterStore`] and are checked against the uid and resource
//! version the caller read.
//!
//! For tests the store counts controller-side calls ([`StoreStats`]) and can
//! fail the next read or write of an object ([`Fault`]).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use appscaler_id::{ObjectKey, ObjectUid, ResourceVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace};

use super::{ChangeKind, ClusterStore, StoreError, StoreEvent, StoreResult};
use crate::api::{AppScaler, ObjectMeta, ResourceKind, Workload};

/// Capacity of the change event channel. Slow subscribers past this many
/// events observe a lag and must resync.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Initial contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub scalers: Vec<AppScaler>,

    #[serde(default)]
    pub workloads: Vec<Workload>,
}

/// Failure to inject into the next controller-side write of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Act as if another writer got there first.
    Conflict,

    /// Fail with an opaque store error.
    Unavailable(String),
}

/// Counts of controller-side store calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub scaler_reads: u64,
    pub workload_reads: u64,
    pub workload_updates: u64,
    pub status_updates: u64,
}

#[derive(Default)]
struct Counters {
    scaler_reads: AtomicU64,
    workload_reads: AtomicU64,
    workload_updates: AtomicU64,
    status_updates: AtomicU64,
}

#[derive(Default)]
struct Objects {
    scalers: BTreeMap<ObjectKey, AppScaler>,
    workloads: BTreeMap<ObjectKey, Workload>,
    faults: HashMap<FaultKey, Fault>,
}

type FaultKey = (ResourceKind, ObjectKey);

/// In-memory [`ClusterStore`].
pub struct MemoryStore {
    objects: RwLock<Objects>,
    read_faults: Mutex<HashMap<FaultKey, String>>,
    events: broadcast::Sender<StoreEvent>,
    counters: Counters,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(Objects::default()),
            read_faults: Mutex::new(HashMap::new()),
            events,
            counters: Counters::default(),
        }
    }

    /// Create a store holding the objects in `seed`.
    pub async fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for workload in seed.workloads {
            store.apply_workload(workload).await;
        }
        for scaler in seed.scalers {
            store.apply_scaler(scaler).await;
        }
        store
    }

    /// Create a store from a JSON seed file.
    pub async fn load_seed(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let seed: Seed = serde_json::from_slice(&bytes)?;

        info!(
            path = %path.display(),
            scalers = seed.scalers.len(),
            workloads = seed.workloads.len(),
            "Loaded store seed"
        );

        Ok(Self::from_seed(seed).await)
    }

    /// Create or replace an AppScaler's spec.
    ///
    /// A new object keeps the status it was given; an existing one keeps its
    /// stored status.
    pub async fn apply_scaler(&self, scaler: AppScaler) -> AppScaler {
        let key = scaler.key().clone();
        let stored = {
            let mut objects = self.objects.write().await;
            match objects.scalers.get_mut(&key) {
                Some(existing) => {
                    if existing.spec != scaler.spec {
                        existing.spec = scaler.spec;
                        existing.metadata.generation += 1;
                    }
                    bump_version(&mut existing.metadata.resource_version);
                    existing.clone()
                }
                None => {
                    let mut created = scaler;
                    initialize_meta(&mut created.metadata);
                    objects.scalers.insert(key.clone(), created.clone());
                    created
                }
            }
        };

        self.publish(ResourceKind::AppScaler, key, ChangeKind::Applied);
        stored
    }

    /// Create or replace a Workload's spec.
    pub async fn apply_workload(&self, workload: Workload) -> Workload {
        let key = workload.key().clone();
        let stored = {
            let mut objects = self.objects.write().await;
            match objects.workloads.get_mut(&key) {
                Some(existing) => {
                    replace_workload_spec(existing, workload);
                    existing.clone()
                }
                None => {
                    let mut created = workload;
                    initialize_meta(&mut created.metadata);
                    objects.workloads.insert(key.clone(), created.clone());
                    created
                }
            }
        };

        self.publish(ResourceKind::Workload, key, ChangeKind::Applied);
        stored
    }

    /// Overwrite a Workload's replica count outside the controller, the way
    /// a manual edit would.
    pub async fn set_workload_replicas(
        &self,
        key: &ObjectKey,
        replicas: Option<u32>,
    ) -> StoreResult<Workload> {
        let stored = {
            let mut objects = self.objects.write().await;
            let existing = objects
                .workloads
                .get_mut(key)
                .ok_or_else(|| not_found(ResourceKind::Workload, key))?;

            let mut replacement = existing.clone();
            replacement.spec.replicas = replicas;
            replace_workload_spec(existing, replacement);
            existing.clone()
        };

        self.publish(ResourceKind::Workload, key.clone(), ChangeKind::Applied);
        Ok(stored)
    }

    /// Delete an AppScaler.
    pub async fn delete_scaler(&self, key: &ObjectKey) -> StoreResult<()> {
        let removed = self.objects.write().await.scalers.remove(key);
        if removed.is_none() {
            return Err(not_found(ResourceKind::AppScaler, key));
        }

        self.publish(ResourceKind::AppScaler, key.clone(), ChangeKind::Deleted);
        Ok(())
    }

    /// Delete a Workload.
    pub async fn delete_workload(&self, key: &ObjectKey) -> StoreResult<()> {
        let removed = self.objects.write().await.workloads.remove(key);
        if removed.is_none() {
            return Err(not_found(ResourceKind::Workload, key));
        }

        self.publish(ResourceKind::Workload, key.clone(), ChangeKind::Deleted);
        Ok(())
    }

    /// Fail the next controller-side write to an object.
    ///
    /// Workload faults hit `update_workload`; AppScaler faults hit
    /// `update_scaler_status`. Each fault fires once.
    pub async fn inject_fault(&self, kind: ResourceKind, key: ObjectKey, fault: Fault) {
        debug!(kind = %kind, key = %key, fault = ?fault, "Injecting store fault");
        self.objects.write().await.faults.insert((kind, key), fault);
    }

    /// Fail the next `get_scaler` or `get_workload` of an object with
    /// [`StoreError::Unavailable`]. Fires once.
    pub fn inject_read_fault(
        &self,
        kind: ResourceKind,
        key: ObjectKey,
        message: impl Into<String>,
    ) {
        debug!(kind = %kind, key = %key, "Injecting store read fault");
        self.read_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, key), message.into());
    }

    fn take_read_fault(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        let fault = self
            .read_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, key.clone()));

        match fault {
            Some(message) => Err(StoreError::Unavailable(message)),
            None => Ok(()),
        }
    }

    /// Snapshot of controller-side call counts.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            scaler_reads: self.counters.scaler_reads.load(Ordering::SeqCst),
            workload_reads: self.counters.workload_reads.load(Ordering::SeqCst),
            workload_updates: self.counters.workload_updates.load(Ordering::SeqCst),
            status_updates: self.counters.status_updates.load(Ordering::SeqCst),
        }
    }

    fn publish(&self, kind: ResourceKind, key: ObjectKey, change: ChangeKind) {
        trace!(kind = %kind, key = %key, change = ?change, "Publishing store event");
        // No subscribers is not an error.
        let _ = self.events.send(StoreEvent { kind, key, change });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_scaler(&self, key: &ObjectKey) -> StoreResult<AppScaler> {
        self.counters.scaler_reads.fetch_add(1, Ordering::SeqCst);
        self.take_read_fault(ResourceKind::AppScaler, key)?;
        self.objects
            .read()
            .await
            .scalers
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::AppScaler, key))
    }

    async fn list_scalers(&self) -> StoreResult<Vec<AppScaler>> {
        Ok(self.objects.read().await.scalers.values().cloned().collect())
    }

    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload> {
        self.counters.workload_reads.fetch_add(1, Ordering::SeqCst);
        self.take_read_fault(ResourceKind::Workload, key)?;
        self.objects
            .read()
            .await
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Workload, key))
    }

    async fn update_workload(&self, workload: &Workload) -> StoreResult<Workload> {
        self.counters.workload_updates.fetch_add(1, Ordering::SeqCst);
        let kind = ResourceKind::Workload;
        let key = workload.key();

        let stored = {
            let mut objects = self.objects.write().await;
            let fault = objects.faults.remove(&(kind, key.clone()));
            let existing = objects
                .workloads
                .get_mut(key)
                .ok_or_else(|| not_found(kind, key))?;

            check_write(kind, key, fault, &workload.metadata, &existing.metadata)?;
            replace_workload_spec(existing, workload.clone());
            existing.clone()
        };

        self.publish(kind, key.clone(), ChangeKind::Applied);
        Ok(stored)
    }

    async fn update_scaler_status(&self, scaler: &AppScaler) -> StoreResult<AppScaler> {
        self.counters.status_updates.fetch_add(1, Ordering::SeqCst);
        let kind = ResourceKind::AppScaler;
        let key = scaler.key();

        let stored = {
            let mut objects = self.objects.write().await;
            let fault = objects.faults.remove(&(kind, key.clone()));
            let existing = objects
                .scalers
                .get_mut(key)
                .ok_or_else(|| not_found(kind, key))?;

            check_write(kind, key, fault, &scaler.metadata, &existing.metadata)?;
            existing.status = scaler.status.clone();
            bump_version(&mut existing.metadata.resource_version);
            existing.clone()
        };

        self.publish(kind, key.clone(), ChangeKind::StatusUpdated);
        Ok(stored)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn not_found(kind: ResourceKind, key: &ObjectKey) -> StoreError {
    StoreError::NotFound {
        kind,
        key: key.clone(),
    }
}

fn initialize_meta(meta: &mut ObjectMeta) {
    meta.uid = Some(ObjectUid::new());
    meta.resource_version = Some(ResourceVersion::FIRST);
    meta.generation = 1;
}

fn bump_version(version: &mut Option<ResourceVersion>) {
    *version = Some(version.unwrap_or_default().next());
}

fn replace_workload_spec(existing: &mut Workload, replacement: Workload) {
    if existing.spec != replacement.spec {
        existing.spec = replacement.spec;
        existing.metadata.generation += 1;
    }
    bump_version(&mut existing.metadata.resource_version);
}

/// Apply an injected fault, then the write preconditions.
///
/// A write carrying a uid must address the same incarnation of the object: a
/// key that was deleted and recreated since the read has a new uid even when
/// its resource version happens to match. A write without a version is
/// otherwise unconditional.
fn check_write(
    kind: ResourceKind,
    key: &ObjectKey,
    fault: Option<Fault>,
    write: &ObjectMeta,
    stored: &ObjectMeta,
) -> StoreResult<()> {
    let expected = write.resource_version;
    let actual = stored.resource_version.unwrap_or_default();

    match fault {
        Some(Fault::Conflict) => {
            return Err(StoreError::Conflict {
                kind,
                key: key.clone(),
                expected: expected.unwrap_or(actual),
                actual: actual.next(),
            })
        }
        Some(Fault::Unavailable(message)) => return Err(StoreError::Unavailable(message)),
        None => {}
    }

    if let (Some(expected), Some(actual)) = (write.uid, stored.uid) {
        if expected != actual {
            return Err(StoreError::Recreated {
                kind,
                key: key.clone(),
                expected,
                actual,
            });
        }
    }

    match expected {
        Some(expected) if expected != actual => Err(StoreError::Conflict {
            kind,
            key: key.clone(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AppScalerStatus, ScalerPhase};

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_apply_assigns_metadata() {
        let store = MemoryStore::new();
        let stored = store.apply_workload(Workload::new(key("web"), Some(3))).await;

        assert!(stored.metadata.uid.is_some());
        assert_eq!(stored.metadata.resource_version, Some(ResourceVersion::FIRST));
        assert_eq!(stored.metadata.generation, 1);
    }

    #[tokio::test]
    async fn test_reapply_keeps_uid_and_bumps_generation() {
        let store = MemoryStore::new();
        let first = store.apply_workload(Workload::new(key("web"), Some(3))).await;
        let second = store.apply_workload(Workload::new(key("web"), Some(4))).await;

        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(second.metadata.generation, 2);
        assert_eq!(second.metadata.resource_version, Some(ResourceVersion::new(2)));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::new();
        let stored = store.apply_workload(Workload::new(key("web"), Some(3))).await;
        store.set_workload_replicas(&key("web"), Some(7)).await.unwrap();

        let mut stale = stored;
        stale.spec.replicas = Some(5);
        let err = store.update_workload(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let current = store.get_workload(&key("web")).await.unwrap();
        assert_eq!(current.spec.replicas, Some(7));
    }

    #[tokio::test]
    async fn test_update_missing_workload() {
        let store = MemoryStore::new();
        let err = store
            .update_workload(&Workload::new(key("web"), Some(1)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_update_leaves_spec() {
        let store = MemoryStore::new();
        let stored = store
            .apply_scaler(AppScaler::new(key("s"), 2, vec![key("web")]))
            .await;

        let mut next = stored.clone();
        next.spec.replicas = 9;
        next.status = AppScalerStatus::succeeded(1);
        let updated = store.update_scaler_status(&next).await.unwrap();

        assert_eq!(updated.spec.replicas, 2);
        assert_eq!(updated.status.phase, ScalerPhase::Succeeded);
        assert_eq!(updated.metadata.generation, stored.metadata.generation);
    }

    #[tokio::test]
    async fn test_fault_fires_once() {
        let store = MemoryStore::new();
        let stored = store.apply_workload(Workload::new(key("web"), Some(3))).await;
        store
            .inject_fault(
                ResourceKind::Workload,
                key("web"),
                Fault::Unavailable("down".into()),
            )
            .await;

        let err = store.update_workload(&stored).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.update_workload(&stored).await.is_ok());
        assert_eq!(store.stats().workload_updates, 2);
    }

    #[tokio::test]
    async fn test_write_to_recreated_object_conflicts() {
        let store = MemoryStore::new();
        let stale = store.apply_workload(Workload::new(key("web"), Some(3))).await;
        store.delete_workload(&key("web")).await.unwrap();
        let recreated = store.apply_workload(Workload::new(key("web"), Some(3))).await;
        assert_eq!(
            stale.metadata.resource_version,
            recreated.metadata.resource_version
        );

        let mut update = stale;
        update.spec.replicas = Some(5);
        let err = store.update_workload(&update).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(err, StoreError::Recreated { .. }));
        let current = store.get_workload(&key("web")).await.unwrap();
        assert_eq!(current.spec.replicas, Some(3));
    }

    #[tokio::test]
    async fn test_status_write_to_recreated_scaler_conflicts() {
        let store = MemoryStore::new();
        let stale = store
            .apply_scaler(AppScaler::new(key("s"), 2, vec![key("web")]))
            .await;
        store.delete_scaler(&key("s")).await.unwrap();
        store
            .apply_scaler(AppScaler::new(key("s"), 4, vec![key("web")]))
            .await;

        let mut update = stale;
        update.status = AppScalerStatus::succeeded(1);
        let err = store.update_scaler_status(&update).await.unwrap_err();

        assert!(err.is_conflict());
        let current = store.get_scaler(&key("s")).await.unwrap();
        assert_eq!(current.status.phase, ScalerPhase::Pending);
    }

    #[tokio::test]
    async fn test_read_fault_fires_once() {
        let store = MemoryStore::new();
        store.apply_workload(Workload::new(key("web"), Some(3))).await;
        store.inject_read_fault(ResourceKind::Workload, key("web"), "down");

        let err = store.get_workload(&key("web")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(ref message) if message == "down"));
        assert!(store.get_workload(&key("web")).await.is_ok());
        assert_eq!(store.stats().workload_reads, 2);
    }

    #[tokio::test]
    async fn test_read_fault_is_scoped_to_kind() {
        let store = MemoryStore::new();
        store.apply_workload(Workload::new(key("web"), Some(3))).await;
        store.inject_read_fault(ResourceKind::AppScaler, key("web"), "down");

        assert!(store.get_workload(&key("web")).await.is_ok());
        assert!(store.get_scaler(&key("web")).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_events_published() {
        let store = MemoryStore::new();
        let mut events = store.watch();

        store.apply_workload(Workload::new(key("web"), None)).await;
        store.delete_workload(&key("web")).await.unwrap();

        let applied = events.recv().await.unwrap();
        assert_eq!(applied.kind, ResourceKind::Workload);
        assert_eq!(applied.change, ChangeKind::Applied);
        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.change, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_load_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "scalers": [{
                    "metadata": { "namespace": "default", "name": "web-scaler" },
                    "spec": { "replicas": 5, "targets": [{ "name": "web" }] }
                }],
                "workloads": [{
                    "metadata": { "namespace": "default", "name": "web" },
                    "spec": { "replicas": 3 }
                }]
            })
            .to_string(),
        )
        .unwrap();

        let store = MemoryStore::load_seed(&path).await.unwrap();
        let scaler = store.get_scaler(&key("web-scaler")).await.unwrap();
        assert_eq!(scaler.spec.targets, vec![key("default/web")]);
        let workload = store.get_workload(&key("web")).await.unwrap();
        assert_eq!(workload.spec.replicas, Some(3));
    }

    #[tokio::test]
    async fn test_load_seed_missing_file() {
        let err = MemoryStore::load_seed("/nonexistent/seed.json")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
