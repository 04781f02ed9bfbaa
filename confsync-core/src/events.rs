use std::path::PathBuf;

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A monitored resource was re-downloaded and its local cache file
    /// rewritten.
    FileUpdated(PathBuf),
    /// A delivery cycle completed with a non-empty change-set.
    KeysChanged(Vec<String>),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConfigEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ConfigEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}
