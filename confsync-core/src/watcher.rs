use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::bindings::BindingRegistry;
use crate::connection::{ResilientConnection, SessionEvent};
use crate::diff;
use crate::error::{Error, Result};
use crate::events::{ConfigEvent, EventBus};
use crate::fetch::{ResourceFetcher, ResourceHandle, ResourceKind};
use crate::resolver::PropertySource;
use crate::snapshot::Snapshot;

/// Tracks a fixed set of remote configuration resources: re-arms watches,
/// downloads changed content into the local cache, maintains per-resource
/// presence records, and drives the diff/delivery cycle.
#[derive(Clone)]
pub struct ConfigWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Arc<ResilientConnection>,
    fetcher: Arc<dyn ResourceFetcher>,
    resources: Vec<ResourceHandle>,
    registry: Arc<BindingRegistry>,
    fallback: Arc<dyn PropertySource>,
    events: EventBus,
    local_overrides: Vec<(String, String)>,
    fingerprint: String,
    // Serializes update cycles, manual refreshes, and expiry recovery so
    // watch re-registration never races a resource update.
    state: Mutex<WatchState>,
    current: RwLock<Arc<Snapshot>>,
}

#[derive(Default)]
struct WatchState {
    resource_data: HashMap<String, Vec<(String, String)>>,
}

impl ConfigWatcher {
    pub fn new(
        connection: Arc<ResilientConnection>,
        fetcher: Arc<dyn ResourceFetcher>,
        resources: Vec<ResourceHandle>,
        registry: Arc<BindingRegistry>,
        fallback: Arc<dyn PropertySource>,
        events: EventBus,
        local_overrides: Vec<(String, String)>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                fetcher,
                resources,
                registry,
                fallback,
                events,
                local_overrides,
                fingerprint: process_fingerprint(),
                state: Mutex::new(WatchState::default()),
                current: RwLock::new(Arc::new(Snapshot::empty())),
            }),
        }
    }

    /// Connects, registers a watch per resource, performs the initial full
    /// download, publishes the bootstrap snapshot, and spawns the event
    /// loop. No consumer notifications fire for the bootstrap merge.
    pub async fn start(&self, events: mpsc::Receiver<SessionEvent>) -> Result<()> {
        self.inner.connection.connect().await?;

        let mut state = self.inner.state.lock().await;
        for handle in &self.inner.resources {
            if let Err(err) = self.inner.connection.watch(&handle.node_path).await {
                tracing::error!(resource = %handle.node_path, error = %err, "failed to register watch");
            }
        }
        for handle in self.inner.resources.clone() {
            if let Err(err) = self.sync_resource(&handle, &mut state).await {
                tracing::warn!(resource = %handle.node_path, error = %err, "initial download failed");
            }
        }
        self.apply_update(&state).await;
        drop(state);

        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.run(events).await;
        });
        Ok(())
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.read().await.clone()
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Forces a full re-download and diff cycle across every monitored
    /// resource, independent of any watch event.
    pub async fn refresh_all(&self) {
        let mut state = self.inner.state.lock().await;
        for handle in self.inner.resources.clone() {
            if let Err(err) = self.sync_resource(&handle, &mut state).await {
                tracing::warn!(resource = %handle.node_path, error = %err, "refresh failed, keeping previous content");
            }
        }
        self.apply_update(&state).await;
    }

    /// Host identifiers of every process currently consuming the first
    /// monitored resource.
    pub async fn cluster_hosts(&self) -> Result<Vec<String>> {
        let first = self
            .inner
            .resources
            .first()
            .ok_or_else(|| Error::Config("no monitored resources".to_owned()))?;
        self.inner.connection.cluster_hosts(&first.node_path).await
    }

    async fn run(&self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.inner.connection.note_event(&event).await;
            match event {
                SessionEvent::DataChanged(path) => self.handle_data_changed(&path).await,
                SessionEvent::Expired => self.recover_expired().await,
                SessionEvent::Connected | SessionEvent::Disconnected => {}
            }
        }
        tracing::debug!("session event channel closed, watcher loop exiting");
    }

    async fn handle_data_changed(&self, path: &str) {
        let Some(handle) = self
            .inner
            .resources
            .iter()
            .find(|handle| handle.node_path == path)
            .cloned()
        else {
            tracing::warn!(path, "change event for an unmonitored resource");
            return;
        };

        let mut state = self.inner.state.lock().await;
        if let Err(err) = self.sync_resource(&handle, &mut state).await {
            tracing::warn!(resource = %handle.node_path, error = %err, "update cycle abandoned, keeping previous content");
        }
        // The fired watch is consumed either way; re-arm it so later
        // changes to this resource still produce events.
        if let Err(err) = self.inner.connection.watch(&handle.node_path).await {
            tracing::error!(resource = %handle.node_path, error = %err, "failed to re-register watch");
        }
        self.apply_update(&state).await;
    }

    async fn recover_expired(&self) {
        tracing::warn!("coordination session expired, reconnecting");
        let _state = self.inner.state.lock().await;
        if let Err(err) = self.inner.connection.reconnect().await {
            tracing::error!(error = %err, "reconnect after session expiry failed");
            return;
        }
        // Previous registrations died with the session.
        for handle in &self.inner.resources {
            if let Err(err) = self.inner.connection.watch(&handle.node_path).await {
                tracing::error!(resource = %handle.node_path, error = %err, "failed to re-register watch");
            }
        }
    }

    /// Downloads one resource, mirrors it to the local cache, records its
    /// parsed content, and dispatches the presence rewrite. The snapshot
    /// is only touched by `apply_update` after a complete download, so a
    /// failure here leaves stale-but-consistent state.
    async fn sync_resource(&self, handle: &ResourceHandle, state: &mut WatchState) -> Result<()> {
        let bytes = self.inner.fetcher.fetch(handle).await?;

        if let Some(parent) = handle.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&handle.cache_path, &bytes)?;
        self.inner
            .events
            .publish(ConfigEvent::FileUpdated(handle.cache_path.clone()));

        let presence_payload = match handle.kind {
            ResourceKind::Properties => {
                let entries = crate::propfile::parse_properties(&String::from_utf8_lossy(&bytes));
                let members: Map<String, Value> = entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect();
                state
                    .resource_data
                    .insert(handle.node_path.clone(), entries);
                serde_json::to_string(&Value::Object(members))?
            }
            ResourceKind::Opaque => "{}".to_owned(),
        };

        // Presence is for visibility only; it must not block the update
        // cycle beyond its own retry budget.
        let connection = Arc::clone(&self.inner.connection);
        let presence_path = format!("{}/{}", handle.node_path, self.inner.fingerprint);
        tokio::spawn(async move {
            if let Err(err) = connection.write_ephemeral(&presence_path, &presence_payload).await {
                tracing::warn!(path = %presence_path, error = %err, "failed to publish presence record");
            }
        });

        Ok(())
    }

    async fn apply_update(&self, state: &WatchState) {
        let new_snapshot = Arc::new(self.rebuild_snapshot(state));
        let old_snapshot = self.inner.current.read().await.clone();
        let patterns = self.inner.registry.patterns().await;
        let changes = diff::compute_changes(
            &old_snapshot,
            &new_snapshot,
            &patterns,
            self.inner.fallback.as_ref(),
        );

        if changes.is_empty() {
            tracing::debug!("no observable configuration change");
        } else {
            tracing::info!(changed = changes.len(), "configuration changed");
            self.inner
                .registry
                .on_change(&changes, &new_snapshot, self.inner.fallback.as_ref())
                .await;
            self.inner
                .events
                .publish(ConfigEvent::KeysChanged(changes.iter().cloned().collect()));
        }

        *self.inner.current.write().await = new_snapshot;
    }

    fn rebuild_snapshot(&self, state: &WatchState) -> Snapshot {
        let mut entries = BTreeMap::new();
        for handle in &self.inner.resources {
            if let Some(pairs) = state.resource_data.get(&handle.node_path) {
                for (key, value) in pairs {
                    entries.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &self.inner.local_overrides {
            entries.insert(key.clone(), value.clone());
        }
        Snapshot::from_entries(entries)
    }
}

/// Stable per-process identity: local address plus a random instance id,
/// generated once at startup.
fn process_fingerprint() -> String {
    format!("{}{}", local_address(), Uuid::new_v4())
}

fn local_address() -> String {
    let probe = || -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    };
    probe().unwrap_or_else(|| "127.0.0.1".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{ConfigConsumer, ValueShape};
    use crate::connection::{CoordinationService, CoordinationSession, EphemeralRetry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Store {
        data: StdMutex<HashMap<String, Vec<u8>>>,
        watches: StdMutex<Vec<String>>,
    }

    struct MemorySession {
        store: Arc<Store>,
    }

    #[async_trait]
    impl CoordinationSession for MemorySession {
        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.store.data.lock().unwrap().contains_key(path))
        }

        async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
            self.store
                .data
                .lock()
                .unwrap()
                .insert(path.to_owned(), data.to_vec());
            Ok(())
        }

        async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
            self.store
                .data
                .lock()
                .unwrap()
                .insert(path.to_owned(), data.to_vec());
            Ok(())
        }

        async fn watch_data(&self, path: &str) -> Result<()> {
            self.store.watches.lock().unwrap().push(path.to_owned());
            Ok(())
        }

        async fn children(&self, path: &str) -> Result<Vec<String>> {
            let prefix = format!("{path}/");
            Ok(self
                .store
                .data
                .lock()
                .unwrap()
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix))
                .map(str::to_owned)
                .collect())
        }

        async fn close(&self) {}
    }

    struct MemoryService {
        store: Arc<Store>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl CoordinationService for MemoryService {
        async fn connect(
            &self,
            _hosts: &str,
            _events: mpsc::Sender<SessionEvent>,
        ) -> Result<Arc<dyn CoordinationSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemorySession {
                store: self.store.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct MemoryFetcher {
        files: StdMutex<HashMap<String, Vec<u8>>>,
        fetches: StdMutex<HashMap<String, usize>>,
    }

    impl MemoryFetcher {
        fn put(&self, item: &str, content: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(item.to_owned(), content.as_bytes().to_vec());
        }

        fn remove(&self, item: &str) {
            self.files.lock().unwrap().remove(item);
        }

        fn fetch_count(&self, item: &str) -> usize {
            *self.fetches.lock().unwrap().get(item).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl ResourceFetcher for MemoryFetcher {
        async fn fetch(&self, handle: &ResourceHandle) -> Result<Vec<u8>> {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(handle.item.clone())
                .or_insert(0) += 1;
            self.files
                .lock()
                .unwrap()
                .get(&handle.item)
                .cloned()
                .ok_or_else(|| Error::Download(format!("no content for '{}'", handle.item)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, String)>>,
    }

    impl Recorder {
        fn values(&self) -> Vec<(String, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ConfigConsumer for Recorder {
        fn apply(&self, key: &str, value: &str) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((key.to_owned(), value.to_owned()));
            Ok(())
        }
    }

    struct NoFallback;

    impl PropertySource for NoFallback {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }
    }

    struct Harness {
        watcher: ConfigWatcher,
        service: Arc<MemoryService>,
        fetcher: Arc<MemoryFetcher>,
        registry: Arc<BindingRegistry>,
        tx: mpsc::Sender<SessionEvent>,
        _dir: TempDir,
    }

    const NODE_A: &str = "/confsync/shop_1.0_dev/file/a.properties";
    const NODE_B: &str = "/confsync/shop_1.0_dev/file/b.properties";

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::default());
        let service = Arc::new(MemoryService {
            store,
            connects: AtomicUsize::new(0),
        });
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.put("a.properties", "x=1\n");
        fetcher.put("b.properties", "y=5\n");

        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(ResilientConnection::new(
            service.clone(),
            "h1:2181",
            tx.clone(),
            EphemeralRetry {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        ));
        let resources = vec![
            ResourceHandle::new(NODE_A, dir.path()),
            ResourceHandle::new(NODE_B, dir.path()),
        ];
        let registry = Arc::new(BindingRegistry::new());
        let watcher = ConfigWatcher::new(
            connection,
            fetcher.clone(),
            resources,
            registry.clone(),
            Arc::new(NoFallback),
            EventBus::default(),
            Vec::new(),
        );
        watcher.start(rx).await.unwrap();

        Harness {
            watcher,
            service,
            fetcher,
            registry,
            tx,
            _dir: dir,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn watch_count(store: &Store, path: &str) -> usize {
        store
            .watches
            .lock()
            .unwrap()
            .iter()
            .filter(|watched| watched.as_str() == path)
            .count()
    }

    #[tokio::test]
    async fn bootstrap_builds_snapshot_without_notifications() {
        let h = harness().await;
        let consumer = Arc::new(Recorder::default());
        h.registry
            .register("x", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        let snapshot = h.watcher.snapshot().await;
        assert_eq!(snapshot.get("x"), Some("1"));
        assert_eq!(snapshot.get("y"), Some("5"));
        assert!(consumer.values().is_empty());
        assert_eq!(watch_count(&h.service.store, NODE_A), 1);
        assert_eq!(watch_count(&h.service.store, NODE_B), 1);
    }

    #[tokio::test]
    async fn data_change_redownloads_only_that_resource() {
        let h = harness().await;
        let consumer = Arc::new(Recorder::default());
        h.registry
            .register("x", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        h.fetcher.put("a.properties", "x=2\n");
        h.tx.send(SessionEvent::DataChanged(NODE_A.to_owned()))
            .await
            .unwrap();

        let seen = consumer.clone();
        wait_until(move || !seen.values().is_empty()).await;
        assert_eq!(consumer.values(), vec![("x".to_owned(), "2".to_owned())]);
        assert_eq!(h.fetcher.fetch_count("a.properties"), 2);
        assert_eq!(h.fetcher.fetch_count("b.properties"), 1);
        assert_eq!(watch_count(&h.service.store, NODE_A), 2);
        assert_eq!(watch_count(&h.service.store, NODE_B), 1);
    }

    #[tokio::test]
    async fn presence_record_mirrors_resource_content() {
        let h = harness().await;
        let store = h.service.store.clone();
        let prefix = format!("{NODE_A}/");
        wait_until(move || {
            store
                .data
                .lock()
                .unwrap()
                .keys()
                .any(|key| key.starts_with(&prefix))
        })
        .await;

        let data = h.service.store.data.lock().unwrap();
        let presence_path = format!("{NODE_A}/{}", h.watcher.fingerprint());
        let payload: serde_json::Value =
            serde_json::from_slice(data.get(&presence_path).unwrap()).unwrap();
        assert_eq!(payload["x"], "1");
    }

    #[tokio::test]
    async fn refresh_all_redownloads_without_rearming_watches() {
        let h = harness().await;
        let consumer = Arc::new(Recorder::default());
        h.registry
            .register("y", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        h.fetcher.put("b.properties", "y=6\n");
        h.watcher.refresh_all().await;

        assert_eq!(consumer.values(), vec![("y".to_owned(), "6".to_owned())]);
        assert_eq!(h.fetcher.fetch_count("a.properties"), 2);
        assert_eq!(h.fetcher.fetch_count("b.properties"), 2);
        assert_eq!(watch_count(&h.service.store, NODE_A), 1);
    }

    #[tokio::test]
    async fn expiry_reconnects_and_rearms_every_watch() {
        let h = harness().await;
        h.tx.send(SessionEvent::Expired).await.unwrap();

        let store = h.service.store.clone();
        wait_until(move || watch_count(&store, NODE_B) == 2).await;
        assert_eq!(watch_count(&h.service.store, NODE_A), 2);
        assert!(h.service.connects.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failed_download_keeps_previous_content() {
        let h = harness().await;
        let consumer = Arc::new(Recorder::default());
        h.registry
            .register("x", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        h.fetcher.remove("a.properties");
        h.tx.send(SessionEvent::DataChanged(NODE_A.to_owned()))
            .await
            .unwrap();

        // The consumed watch is still re-armed after a failed cycle.
        let store = h.service.store.clone();
        wait_until(move || watch_count(&store, NODE_A) == 2).await;
        assert_eq!(h.watcher.snapshot().await.get("x"), Some("1"));
        assert!(consumer.values().is_empty());
    }

    #[tokio::test]
    async fn cluster_hosts_lists_presence_children() {
        let h = harness().await;
        let store = h.service.store.clone();
        let prefix = format!("{NODE_A}/");
        wait_until(move || {
            store
                .data
                .lock()
                .unwrap()
                .keys()
                .any(|key| key.starts_with(&prefix))
        })
        .await;

        let hosts = h.watcher.cluster_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
    }
}
