/// Persistence over chrome.storage.local
///
/// Reads go through an in-memory cache. Writes update the cache right away
/// and reach the storage area either immediately or after a per-key debounce
/// window; a newer write to the same key cancels the pending one. Debounced
/// writes that fail are retried with exponential backoff and then dropped.
///
/// Without a storage area the adapter runs cache-only, so the rest of the
/// extension keeps working for the lifetime of the process.
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use futures::future::{abortable, AbortHandle};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StorageConfig;
use crate::error::{Result, TabError};
use crate::host::{Clock, Scheduler, StorageArea};
use crate::rules::{validate_custom_rules, CustomRules};
use crate::tab_data::{Settings, TabRecord};

pub const TABS_KEY: &str = "tabs";
pub const SETTINGS_KEY: &str = "settings";
pub const CATEGORY_RULES_KEY: &str = "categoryRules";
pub const LAST_UPDATED_KEY: &str = "lastUpdated";

const KNOWN_KEYS: [&str; 4] = [TABS_KEY, SETTINGS_KEY, CATEGORY_RULES_KEY, LAST_UPDATED_KEY];

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaStatus {
    Healthy,
    Warning,
    Critical,
}

impl QuotaStatus {
    pub fn classify(ratio: f64, config: &StorageConfig) -> QuotaStatus {
        if ratio < config.warning_ratio {
            QuotaStatus::Healthy
        } else if ratio <= config.critical_ratio {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
    pub per_key: BTreeMap<String, u64>,
    pub status: QuotaStatus,
}

/// Settings and custom rules as exported to a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u32,
    #[serde(default)]
    pub exported_at: f64,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub category_rules: CustomRules,
}

pub struct Storage {
    area: Option<Rc<dyn StorageArea>>,
    scheduler: Rc<dyn Scheduler>,
    clock: Rc<dyn Clock>,
    config: StorageConfig,
    cache: RefCell<HashMap<String, Value>>,
    pending: RefCell<HashMap<String, AbortHandle>>,
}

impl Storage {
    /// Connect to the storage area, failing if it is missing or unreadable
    pub async fn open(
        area: Option<Rc<dyn StorageArea>>,
        scheduler: Rc<dyn Scheduler>,
        clock: Rc<dyn Clock>,
        config: StorageConfig,
    ) -> Result<Rc<Storage>> {
        let Some(area) = area else {
            return Err(TabError::StorageUnavailable("storage API is not available".to_string()));
        };

        area.get(vec![SETTINGS_KEY.to_string()])
            .await
            .map_err(|e| TabError::StorageUnavailable(e.to_string()))?;

        Ok(Rc::new(Storage::build(Some(area), scheduler, clock, config)))
    }

    /// Cache-only adapter used when the storage area cannot be opened
    pub fn in_memory(scheduler: Rc<dyn Scheduler>, clock: Rc<dyn Clock>, config: StorageConfig) -> Rc<Storage> {
        Rc::new(Storage::build(None, scheduler, clock, config))
    }

    fn build(
        area: Option<Rc<dyn StorageArea>>,
        scheduler: Rc<dyn Scheduler>,
        clock: Rc<dyn Clock>,
        config: StorageConfig,
    ) -> Storage {
        Storage {
            area,
            scheduler,
            clock,
            config,
            cache: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.area.is_some()
    }

    pub async fn get(&self, key: &str, use_cache: bool) -> Result<Option<Value>> {
        let mut values = self.get_multiple(&[key], use_cache).await?;
        Ok(values.remove(key))
    }

    /// Values for every requested key that exists; missing keys are left out
    pub async fn get_multiple(&self, keys: &[&str], use_cache: bool) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        {
            let cache = self.cache.borrow();
            let pending = self.pending.borrow();
            for key in keys {
                // A value waiting to be written is newer than what the area holds
                let prefer_cache = use_cache || pending.contains_key(*key) || self.area.is_none();
                match cache.get(*key) {
                    Some(value) if prefer_cache => {
                        found.insert(key.to_string(), value.clone());
                    }
                    _ => missing.push(key.to_string()),
                }
            }
        }

        let Some(area) = &self.area else {
            return Ok(found);
        };
        if missing.is_empty() {
            return Ok(found);
        }

        match area.get(missing.clone()).await {
            Ok(values) => {
                let mut cache = self.cache.borrow_mut();
                for (key, value) in values {
                    cache.insert(key.clone(), value.clone());
                    found.insert(key, value);
                }
                Ok(found)
            }
            Err(err) => {
                let cache = self.cache.borrow();
                let fallback: Vec<&String> = missing.iter().filter(|key| cache.contains_key(*key)).collect();
                if fallback.is_empty() && found.is_empty() {
                    return Err(err.into());
                }
                warn!("Storage read failed ({}), serving {:?} from cache", err, fallback);
                for key in fallback {
                    if let Some(value) = cache.get(key) {
                        found.insert(key.clone(), value.clone());
                    }
                }
                Ok(found)
            }
        }
    }

    pub async fn set(self: &Rc<Self>, key: &str, value: Value, immediate: bool) -> Result<()> {
        self.set_multiple(vec![(key.to_string(), value)], immediate).await
    }

    /// Update the cache now; write through now or after the debounce window
    pub async fn set_multiple(self: &Rc<Self>, items: Vec<(String, Value)>, immediate: bool) -> Result<()> {
        {
            let mut cache = self.cache.borrow_mut();
            for (key, value) in &items {
                cache.insert(key.clone(), value.clone());
            }
        }

        if self.area.is_none() {
            return Ok(());
        }

        if immediate {
            for (key, _) in &items {
                self.cancel_pending(key);
            }
            self.write_now(items).await
        } else {
            for (key, _) in items {
                self.schedule_write(key);
            }
            Ok(())
        }
    }

    /// Cancel every pending debounce timer and write the queued keys now
    pub async fn flush_pending_saves(&self) -> Result<()> {
        let keys: Vec<String> = self
            .pending
            .borrow_mut()
            .drain()
            .map(|(key, handle)| {
                handle.abort();
                key
            })
            .collect();

        if keys.is_empty() || self.area.is_none() {
            return Ok(());
        }

        let items: Vec<(String, Value)> = {
            let cache = self.cache.borrow();
            keys.into_iter()
                .filter_map(|key| cache.get(&key).cloned().map(|value| (key, value)))
                .collect()
        };
        debug!("Flushing {} pending storage writes", items.len());
        self.write_now(items).await
    }

    /// Apply a change notification from the storage area to the cache.
    ///
    /// Keys with a local write still pending keep the local value.
    pub fn apply_external_change(&self, changes: &HashMap<String, Option<Value>>) {
        let pending = self.pending.borrow();
        let mut cache = self.cache.borrow_mut();
        for (key, value) in changes {
            if pending.contains_key(key) {
                continue;
            }
            match value {
                Some(value) => {
                    cache.insert(key.clone(), value.clone());
                }
                None => {
                    cache.remove(key);
                }
            }
        }
    }

    pub async fn usage(&self) -> Result<StorageUsage> {
        let Some(area) = &self.area else {
            return Err(TabError::StorageUnavailable("running without persistent storage".to_string()));
        };

        let total_bytes = area.bytes_in_use(None).await?;

        let keys: BTreeSet<String> = {
            let cache = self.cache.borrow();
            KNOWN_KEYS.iter().map(|key| key.to_string()).chain(cache.keys().cloned()).collect()
        };
        let mut per_key = BTreeMap::new();
        for key in keys {
            let bytes = area.bytes_in_use(Some(vec![key.clone()])).await?;
            per_key.insert(key, bytes);
        }

        let quota_bytes = area.quota_bytes();
        let ratio = if quota_bytes == 0 { 1.0 } else { total_bytes as f64 / quota_bytes as f64 };

        Ok(StorageUsage {
            total_bytes,
            quota_bytes,
            percent_used: ratio * 100.0,
            per_key,
            status: QuotaStatus::classify(ratio, &self.config),
        })
    }

    pub async fn get_tabs(&self) -> Result<HashMap<i32, TabRecord>> {
        let Some(value) = self.get(TABS_KEY, true).await? else {
            return Ok(HashMap::new());
        };

        let raw: HashMap<String, Value> = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Discarding unreadable tab mapping: {}", e);
                return Ok(HashMap::new());
            }
        };

        let tabs = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.parse::<i32>().ok()?;
                match serde_json::from_value::<TabRecord>(value) {
                    Ok(record) => Some((id, record)),
                    Err(e) => {
                        warn!("Skipping stored tab {}: {}", key, e);
                        None
                    }
                }
            })
            .collect();
        Ok(tabs)
    }

    /// Persist the tab mapping together with the last-updated timestamp
    pub async fn set_tabs(self: &Rc<Self>, tabs: &HashMap<i32, TabRecord>, immediate: bool) -> Result<()> {
        let items = vec![
            (TABS_KEY.to_string(), serde_json::to_value(tabs)?),
            (LAST_UPDATED_KEY.to_string(), Value::from(self.clock.now())),
        ];
        self.set_multiple(items, immediate).await
    }

    /// Stored settings merged over the defaults
    pub async fn get_settings(&self) -> Result<Settings> {
        match self.get(SETTINGS_KEY, true).await? {
            Some(value) => Ok(Settings::from_stored(&value)),
            None => Ok(Settings::default()),
        }
    }

    pub async fn set_settings(self: &Rc<Self>, settings: &Settings) -> Result<()> {
        self.set(SETTINGS_KEY, serde_json::to_value(settings)?, true).await
    }

    pub async fn get_category_rules(&self) -> Result<CustomRules> {
        match self.get(CATEGORY_RULES_KEY, true).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Stored category rules are invalid, ignoring them: {}", e);
                CustomRules::new()
            })),
            None => Ok(CustomRules::new()),
        }
    }

    pub async fn set_category_rules(self: &Rc<Self>, rules: &CustomRules) -> Result<()> {
        self.set(CATEGORY_RULES_KEY, serde_json::to_value(rules)?, true).await
    }

    pub async fn export_bundle(&self) -> Result<ExportBundle> {
        Ok(ExportBundle {
            version: EXPORT_VERSION,
            exported_at: self.clock.now(),
            settings: serde_json::to_value(self.get_settings().await?)?,
            category_rules: self.get_category_rules().await?,
        })
    }

    /// Validate everything in the bundle, then write settings and rules together
    pub async fn import_bundle(self: &Rc<Self>, bundle: &ExportBundle) -> Result<(Settings, CustomRules)> {
        if bundle.version > EXPORT_VERSION {
            return Err(TabError::InvalidSettings(format!(
                "export version {} is newer than supported version {}",
                bundle.version, EXPORT_VERSION
            )));
        }

        let settings = if bundle.settings.is_null() {
            Settings::default()
        } else {
            Settings::default().merged_with(&bundle.settings)?
        };
        let rules = validate_custom_rules(&bundle.category_rules)?;

        let items = vec![
            (SETTINGS_KEY.to_string(), serde_json::to_value(&settings)?),
            (CATEGORY_RULES_KEY.to_string(), serde_json::to_value(&rules)?),
        ];
        self.set_multiple(items, true).await?;
        Ok((settings, rules))
    }

    fn cancel_pending(&self, key: &str) {
        if let Some(handle) = self.pending.borrow_mut().remove(key) {
            handle.abort();
        }
    }

    fn schedule_write(self: &Rc<Self>, key: String) {
        self.cancel_pending(&key);

        let this = Rc::clone(self);
        let delay = self.scheduler.sleep(self.config.debounce());
        let task_key = key.clone();
        // The key stays pending through every retry, so a flush or a newer
        // write for it takes over instead of racing this task.
        let (task, handle) = abortable(async move {
            delay.await;
            this.write_with_retry(&task_key).await;
            this.pending.borrow_mut().remove(&task_key);
        });

        self.pending.borrow_mut().insert(key, handle);
        self.scheduler.spawn(Box::pin(async move {
            let _ = task.await;
        }));
    }

    /// Write the cached value for `key`, retrying with backoff on failure
    async fn write_with_retry(&self, key: &str) {
        let mut attempt = 0;
        loop {
            let Some(value) = self.cache.borrow().get(key).cloned() else {
                return;
            };

            match self.write_now(vec![(key.to_string(), value)]).await {
                Ok(()) => return,
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!("{} (retrying in {:?})", e, delay);
                    attempt += 1;
                    self.scheduler.sleep(delay).await;
                }
                Err(e) => {
                    warn!("{} (giving up after {} retries)", e, self.config.max_retries);
                    return;
                }
            }
        }
    }

    async fn write_now(&self, items: Vec<(String, Value)>) -> Result<()> {
        let Some(area) = &self.area else {
            return Ok(());
        };
        if items.is_empty() {
            return Ok(());
        }

        let keys: Vec<&str> = items.iter().map(|(key, _)| key.as_str()).collect();
        let key = keys.join(", ");
        let map: HashMap<String, Value> = items.iter().cloned().collect();

        area.set(map).await.map_err(|e| TabError::StorageWriteFailed {
            key,
            reason: e.to_string(),
        })
    }
}
