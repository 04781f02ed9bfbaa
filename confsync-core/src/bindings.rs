use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::diff::ChangeSet;
use crate::error::Result;
use crate::resolver::{self, PropertySource};
use crate::snapshot::Snapshot;

/// Opaque consumer of a resolved configuration value. Mapping the callback
/// onto a concrete object field or setter is the caller's concern.
pub trait ConfigConsumer: Send + Sync {
    fn apply(&self, key: &str, value: &str) -> Result<()>;
}

/// Declared shape of the value a consumer expects. Carried on the binding
/// for external conversion layers; the core delivers strings either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Text,
    Json,
}

#[derive(Clone)]
struct Binding {
    shape: ValueShape,
    consumer: Arc<dyn ConfigConsumer>,
}

/// Maps each logical key or wildcard pattern to the set of consumers that
/// depend on it. Bindings accumulate over the process lifetime; wildcard
/// patterns are only tracked once a binding registers them.
#[derive(Default)]
pub struct BindingRegistry {
    bindings: RwLock<HashMap<String, Vec<Binding>>>,
    patterns: RwLock<BTreeSet<String>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        key: &str,
        shape: ValueShape,
        consumer: Arc<dyn ConfigConsumer>,
    ) -> Result<()> {
        if resolver::is_pattern(key) {
            resolver::compile_pattern(key)?;
            self.patterns.write().await.insert(key.to_owned());
        }

        let mut bindings = self.bindings.write().await;
        let entries = bindings.entry(key.to_owned()).or_default();
        // A binding is identified by both the consumer and the shape it
        // expects; the same consumer may bind a key under another shape.
        if entries
            .iter()
            .any(|binding| binding.shape == shape && Arc::ptr_eq(&binding.consumer, &consumer))
        {
            return Ok(());
        }
        entries.push(Binding { shape, consumer });
        Ok(())
    }

    /// Wildcard patterns registered so far, for the diff step.
    pub async fn patterns(&self) -> BTreeSet<String> {
        self.patterns.read().await.clone()
    }

    pub async fn binding_count(&self, key: &str) -> usize {
        self.bindings
            .read()
            .await
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Resolves each changed key against the new snapshot and delivers the
    /// result to every binding registered under it. Failures are scoped:
    /// a missing or unresolvable key skips that key only, and a consumer
    /// rejecting a value does not affect the remaining bindings.
    pub async fn on_change(
        &self,
        changes: &ChangeSet,
        snapshot: &Snapshot,
        fallback: &dyn PropertySource,
    ) {
        if changes.is_empty() {
            return;
        }

        let bindings = self.bindings.read().await;
        for key in changes.iter() {
            let Some(entries) = bindings.get(key) else {
                continue;
            };

            let value = if resolver::is_pattern(key) {
                match resolver::aggregate_pattern(key, snapshot, fallback) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(key, error = %err, "failed to build aggregate value");
                        continue;
                    }
                }
            } else {
                let Some(raw) = snapshot.get(key) else {
                    tracing::warn!(key, "changed key absent from snapshot, skipping delivery");
                    continue;
                };
                match resolver::resolve(raw, snapshot, fallback) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(key, error = %err, "failed to resolve changed value");
                        continue;
                    }
                }
            };

            for binding in entries {
                if let Err(err) = binding.consumer.apply(key, &value) {
                    tracing::warn!(
                        key,
                        shape = ?binding.shape,
                        error = %err,
                        "consumer rejected resolved value"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    struct NoFallback;

    impl PropertySource for NoFallback {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        reject: bool,
    }

    impl ConfigConsumer for Recorder {
        fn apply(&self, key: &str, value: &str) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((key.to_owned(), value.to_owned()));
            if self.reject {
                return Err(Error::Delivery("rejected".to_owned()));
            }
            Ok(())
        }
    }

    fn snapshot(pairs: &[(&str, &str)]) -> Snapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn changes(keys: &[&str]) -> ChangeSet {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn duplicate_registrations_are_deduplicated() {
        let registry = BindingRegistry::new();
        let consumer = Arc::new(Recorder::default());
        registry
            .register("a", ValueShape::Text, consumer.clone())
            .await
            .unwrap();
        registry
            .register("a", ValueShape::Text, consumer.clone())
            .await
            .unwrap();
        assert_eq!(registry.binding_count("a").await, 1);
    }

    #[tokio::test]
    async fn same_consumer_with_another_shape_registers_again() {
        let registry = BindingRegistry::new();
        let consumer = Arc::new(Recorder::default());
        registry
            .register("a", ValueShape::Text, consumer.clone())
            .await
            .unwrap();
        registry
            .register("a", ValueShape::Json, consumer.clone())
            .await
            .unwrap();
        assert_eq!(registry.binding_count("a").await, 2);
    }

    #[tokio::test]
    async fn delivers_resolved_values_to_bound_consumers() {
        let registry = BindingRegistry::new();
        let consumer = Arc::new(Recorder::default());
        registry
            .register("url", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        let snap = snapshot(&[("url", "http://${host}"), ("host", "h1")]);
        registry
            .on_change(&changes(&["url", "host"]), &snap, &NoFallback)
            .await;

        let seen = consumer.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("url".to_owned(), "http://h1".to_owned())]);
    }

    #[tokio::test]
    async fn deleted_key_is_not_delivered() {
        let registry = BindingRegistry::new();
        let consumer = Arc::new(Recorder::default());
        registry
            .register("gone", ValueShape::Text, consumer.clone())
            .await
            .unwrap();

        registry
            .on_change(&changes(&["gone"]), &snapshot(&[("a", "1")]), &NoFallback)
            .await;
        assert!(consumer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejecting_consumer_does_not_block_others() {
        let registry = BindingRegistry::new();
        let bad = Arc::new(Recorder {
            reject: true,
            ..Recorder::default()
        });
        let good = Arc::new(Recorder::default());
        registry
            .register("a", ValueShape::Text, bad.clone())
            .await
            .unwrap();
        registry
            .register("a", ValueShape::Text, good.clone())
            .await
            .unwrap();

        registry
            .on_change(&changes(&["a"]), &snapshot(&[("a", "1")]), &NoFallback)
            .await;
        assert_eq!(bad.seen.lock().unwrap().len(), 1);
        assert_eq!(good.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pattern_binding_receives_aggregate_value() {
        let registry = BindingRegistry::new();
        let consumer = Arc::new(Recorder::default());
        registry
            .register("app.user.hobby.*", ValueShape::Json, consumer.clone())
            .await
            .unwrap();
        assert!(registry.patterns().await.contains("app.user.hobby.*"));

        let snap = snapshot(&[("app.user.hobby.a", "1"), ("app.user.hobby.b", "2")]);
        registry
            .on_change(&changes(&["app.user.hobby.*"]), &snap, &NoFallback)
            .await;

        let seen = consumer.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                "app.user.hobby.*".to_owned(),
                r#"{"app.user.hobby.a":"1","app.user.hobby.b":"2"}"#.to_owned()
            )]
        );
    }
}
