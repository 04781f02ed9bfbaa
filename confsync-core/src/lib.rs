pub mod bindings;
pub mod bootstrap;
pub mod connection;
pub mod diff;
pub mod error;
pub mod events;
pub mod fetch;
pub mod logging;
pub mod propfile;
pub mod resolver;
pub mod snapshot;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

pub use bindings::{BindingRegistry, ConfigConsumer, ValueShape};
pub use connection::{
    ConnectionState, CoordinationService, CoordinationSession, EphemeralRetry,
    ResilientConnection, SessionEvent,
};
pub use diff::{compute_changes, ChangeSet};
pub use error::{Error, Result};
pub use events::{ConfigEvent, EventBus};
pub use fetch::{HttpFetcher, ResourceFetcher, ResourceHandle, ResourceKind};
pub use resolver::{EnvSource, PropertySource};
pub use snapshot::Snapshot;
pub use watcher::ConfigWatcher;

use propfile::{parse_properties, PropertyFile};

const PROPERTIES_SUFFIX: &str = ".properties";

pub struct ConfSyncOptions {
    pub app: String,
    /// Configuration item names (remote mode) or local file paths
    /// (local-only mode).
    pub items: Vec<String>,
    /// Local override file; its keys take precedence over central config.
    pub local_conf: PathBuf,
    /// Download directory used when the bootstrap file does not name one.
    pub download_dir: PathBuf,
    pub fetch_timeout: Duration,
}

impl ConfSyncOptions {
    pub fn new(app: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            app: app.into(),
            items,
            local_conf: PathBuf::from("conf/app.properties"),
            download_dir: PathBuf::from("conf/download"),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-scoped entry point. With a bootstrap file present it discovers
/// the coordination hosts and watches the remote resources; without one
/// it degrades to local-only mode over the caller-supplied files.
pub struct ConfSync {
    registry: Arc<BindingRegistry>,
    events: EventBus,
    fallback: Arc<dyn PropertySource>,
    local_conf: PathBuf,
    mode: Mode,
}

enum Mode {
    Remote(ConfigWatcher),
    Local(LocalState),
}

struct LocalState {
    sources: Vec<PathBuf>,
    current: RwLock<Arc<Snapshot>>,
}

impl ConfSync {
    pub async fn init(
        options: ConfSyncOptions,
        service: Arc<dyn CoordinationService>,
    ) -> Result<Self> {
        let registry = Arc::new(BindingRegistry::new());
        let events = EventBus::default();
        let fallback: Arc<dyn PropertySource> = Arc::new(EnvSource);
        ensure_local_conf(&options.local_conf)?;

        let Some(boot) = bootstrap::load_bootstrap(&options.app) else {
            let mut sources: Vec<PathBuf> = options
                .items
                .iter()
                .filter(|item| item.ends_with(PROPERTIES_SUFFIX))
                .map(PathBuf::from)
                .collect();
            sources.push(options.local_conf.clone());
            let current = RwLock::new(Arc::new(load_local_snapshot(&sources)));
            return Ok(Self {
                registry,
                events,
                fallback,
                local_conf: options.local_conf,
                mode: Mode::Local(LocalState { sources, current }),
            });
        };

        let client = reqwest::Client::builder()
            .timeout(options.fetch_timeout)
            .build()
            .map_err(|err| Error::Bootstrap(format!("failed to build discovery client: {err}")))?;
        let hosts = bootstrap::discover_hosts(&client, &boot.conf_server).await?;
        tracing::info!(hosts = %hosts, "discovered coordination hosts");

        let download_dir = boot
            .download_dir
            .clone()
            .unwrap_or_else(|| options.download_dir.clone());
        let prefix = bootstrap::node_prefix(&options.app, &boot.version, &boot.env);
        let resources: Vec<ResourceHandle> = options
            .items
            .iter()
            .map(|item| ResourceHandle::new(format!("{prefix}{item}"), &download_dir))
            .collect();
        let fetcher = Arc::new(HttpFetcher::new(
            &boot.conf_server,
            &options.app,
            &boot.version,
            &boot.env,
            options.fetch_timeout,
        )?);

        let (event_tx, event_rx) = mpsc::channel(64);
        let connection = Arc::new(ResilientConnection::new(
            service,
            hosts,
            event_tx,
            EphemeralRetry::default(),
        ));
        let local_overrides = read_properties_file(&options.local_conf);
        let watcher = ConfigWatcher::new(
            connection,
            fetcher,
            resources,
            registry.clone(),
            fallback.clone(),
            events.clone(),
            local_overrides,
        );
        watcher.start(event_rx).await?;

        Ok(Self {
            registry,
            events,
            fallback,
            local_conf: options.local_conf,
            mode: Mode::Remote(watcher),
        })
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        match &self.mode {
            Mode::Remote(watcher) => watcher.snapshot().await,
            Mode::Local(state) => state.current.read().await.clone(),
        }
    }

    /// Forces a full re-read and diff cycle, independent of any watch
    /// event. In local-only mode this re-reads the local files.
    pub async fn refresh_all(&self) {
        match &self.mode {
            Mode::Remote(watcher) => watcher.refresh_all().await,
            Mode::Local(state) => {
                // One cycle at a time: the write guard spans load, diff,
                // and delivery, so concurrent refreshes cannot diff
                // against the same prior snapshot and double-deliver.
                let mut current = state.current.write().await;
                let new_snapshot = Arc::new(load_local_snapshot(&state.sources));
                let old_snapshot = current.clone();
                let patterns = self.registry.patterns().await;
                let changes = compute_changes(
                    &old_snapshot,
                    &new_snapshot,
                    &patterns,
                    self.fallback.as_ref(),
                );
                if !changes.is_empty() {
                    self.registry
                        .on_change(&changes, &new_snapshot, self.fallback.as_ref())
                        .await;
                    self.events
                        .publish(ConfigEvent::KeysChanged(changes.iter().cloned().collect()));
                }
                *current = new_snapshot;
            }
        }
    }

    /// Writes entries into the local override file, preserving its
    /// existing lines and order.
    pub fn save_to_local(
        &self,
        entries: &BTreeMap<String, String>,
        comment: Option<&str>,
    ) -> Result<()> {
        PropertyFile::load(&self.local_conf)?.save(entries, comment)
    }

    pub async fn cluster_hosts(&self) -> Result<Vec<String>> {
        match &self.mode {
            Mode::Remote(watcher) => watcher.cluster_hosts().await,
            Mode::Local(_) => Err(Error::Config(
                "cluster hosts are not available in local-only mode".to_owned(),
            )),
        }
    }
}

fn ensure_local_conf(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "")?;
    Ok(())
}

fn read_properties_file(path: &Path) -> Vec<(String, String)> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_properties(&content),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read properties file");
            Vec::new()
        }
    }
}

fn load_local_snapshot(sources: &[PathBuf]) -> Snapshot {
    let mut entries = BTreeMap::new();
    for source in sources {
        for (key, value) in read_properties_file(source) {
            entries.insert(key, value);
        }
    }
    Snapshot::from_entries(entries)
}
