use crate::events::{handler, EventBus, SubscriptionId};
use crate::storage::KeyValueStorage;
use serde_json::Value;
use shared::{AppConfig, AppError, EventType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Serves read-only configuration snapshots with `{placeholder}` tokens
/// substituted from the key/value store. The canonical config is never
/// mutated; substitution happens on a clone during snapshot rebuild.
pub struct ConfigService {
    canonical: RwLock<AppConfig>,
    config_path: Option<PathBuf>,
    kv: Arc<dyn KeyValueStorage>,
    events: Arc<EventBus>,
    snapshot: RwLock<Option<Arc<AppConfig>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ConfigService {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        kv: Arc<dyn KeyValueStorage>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            canonical: RwLock::new(config),
            config_path,
            kv,
            events: Arc::clone(&events),
            snapshot: RwLock::new(None),
            subscription: Mutex::new(None),
        });

        let weak: Weak<ConfigService> = Arc::downgrade(&service);
        let id = events.subscribe(
            EventType::KeyUpdated,
            handler(move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(service) = weak.upgrade() {
                        debug!(
                            key = event.str_field("key_name").unwrap_or(""),
                            "key updated, invalidating config snapshot"
                        );
                        service.invalidate_cache().await;
                    }
                    Ok(())
                }
            }),
        );
        *service.subscription.lock().unwrap() = Some(id);
        service
    }

    /// Return the cached snapshot, rebuilding it on a miss. A KV failure
    /// during rebuild degrades to an unsubstituted snapshot instead of
    /// failing the call.
    pub async fn get_config(&self) -> Arc<AppConfig> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Arc::clone(snapshot);
        }

        let mut guard = self.snapshot.write().await;
        // Double check: another task may have rebuilt while we waited.
        if let Some(snapshot) = guard.as_ref() {
            return Arc::clone(snapshot);
        }

        let clone = self.canonical.read().await.clone();
        let built = match self.kv.get_all().await {
            Ok(values) => substitute_placeholders(&clone, &values).unwrap_or(clone),
            Err(e) => {
                warn!(error = %e, "KV fetch failed during config rebuild, serving unsubstituted snapshot");
                clone
            }
        };
        let snapshot = Arc::new(built);
        *guard = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub async fn invalidate_cache(&self) {
        *self.snapshot.write().await = None;
    }

    /// Re-read the canonical config from its file path, optionally clearing
    /// the KV store first. A read failure leaves the prior canonical config
    /// intact.
    pub async fn reload_config(&self, clear: bool) -> shared::Result<()> {
        if clear {
            self.kv.delete_all().await?;
        }
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| AppError::Config("no config file path configured".to_string()))?;
        let fresh = AppConfig::load_from_file(path)?;
        *self.canonical.write().await = fresh;
        self.invalidate_cache().await;
        info!(path = %path.display(), cleared = clear, "configuration reloaded");
        Ok(())
    }

    /// The canonical, unsubstituted configuration.
    pub async fn canonical(&self) -> AppConfig {
        self.canonical.read().await.clone()
    }

    pub async fn close(&self) {
        if let Some(id) = self.subscription.lock().unwrap().take() {
            self.events.unsubscribe(EventType::KeyUpdated, id);
        }
        self.invalidate_cache().await;
    }
}

fn substitute_placeholders(
    config: &AppConfig,
    values: &HashMap<String, String>,
) -> Option<AppConfig> {
    let mut tree = serde_json::to_value(config).ok()?;
    walk_strings(&mut tree, values);
    serde_json::from_value(tree).ok()
}

fn walk_strings(value: &mut Value, values: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if s.contains('{') {
                for (key, replacement) in values {
                    let token = format!("{{{}}}", key);
                    if s.contains(&token) {
                        *s = s.replace(&token, replacement);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_strings(item, values);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                walk_strings(item, values);
            }
        }
        _ => {}
    }
}
