/// In-memory authoritative cache of tracked tabs
///
/// Records are created on the first create/update notification for an id,
/// mutated by update and activation, and dropped on removal or when a stale
/// sweep no longer finds the id among the live tabs. Every mutation schedules
/// a debounced save of the whole mapping; a full refresh saves immediately.
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::{debug, info, warn};

use crate::categorizer::{CategorizeInput, Categorizer};
use crate::config::TabStoreConfig;
use crate::error::{Result, TabError};
use crate::host::{BrowserTabs, Clock, Scheduler};
use crate::storage::Storage;
use crate::tab_data::{BrowserTab, CategorizationMode, TabRecord};

/// Clears the refresh flag however the refresh ends
struct RefreshGuard<'a>(&'a Cell<bool>);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct TabStore {
    tabs: RefCell<HashMap<i32, TabRecord>>,
    refreshing: Cell<bool>,
    browser: Rc<dyn BrowserTabs>,
    storage: Rc<Storage>,
    categorizer: Rc<Categorizer>,
    scheduler: Rc<dyn Scheduler>,
    clock: Rc<dyn Clock>,
    config: TabStoreConfig,
}

impl TabStore {
    pub fn new(
        browser: Rc<dyn BrowserTabs>,
        storage: Rc<Storage>,
        categorizer: Rc<Categorizer>,
        scheduler: Rc<dyn Scheduler>,
        clock: Rc<dyn Clock>,
        config: TabStoreConfig,
    ) -> Self {
        TabStore {
            tabs: RefCell::new(HashMap::new()),
            refreshing: Cell::new(false),
            browser,
            storage,
            categorizer,
            scheduler,
            clock,
            config,
        }
    }

    /// Replace the mapping with whatever was persisted last
    pub async fn initialize(&self) -> Result<usize> {
        let stored = self.storage.get_tabs().await?;
        let count = stored.len();
        *self.tabs.borrow_mut() = stored;
        debug!("Loaded {} persisted tabs", count);
        Ok(count)
    }

    pub fn get(&self, tab_id: i32) -> Option<TabRecord> {
        self.tabs.borrow().get(&tab_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tabs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TabRecord> {
        self.tabs.borrow().values().cloned().collect()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.get()
    }

    pub async fn handle_created(&self, tab: &BrowserTab) -> TabRecord {
        let existing = self.get(tab.id);
        let record = match existing {
            Some(mut record) => {
                record.merge_content(tab);
                record
            }
            None => {
                let category = self.categorizer.categorize(&CategorizeInput::new(
                    tab.url.as_deref(),
                    tab.title.as_deref(),
                    0,
                ));
                TabRecord::new(tab, category, self.clock.now())
            }
        };

        debug!("Tracking tab {} as {}", record.id, record.category);
        self.tabs.borrow_mut().insert(record.id, record.clone());
        self.save(false).await;
        record
    }

    /// Merge new content into a tracked tab, or start tracking it
    pub async fn handle_updated(&self, tab_id: i32, tab: &BrowserTab) -> TabRecord {
        let updated = {
            let mut tabs = self.tabs.borrow_mut();
            tabs.get_mut(&tab_id).map(|record| {
                let content_changed = record.merge_content(tab);
                if content_changed && self.categorizer.mode() != CategorizationMode::Manual {
                    record.category = self.categorizer.categorize(&CategorizeInput::from_record(record));
                }
                record.clone()
            })
        };

        match updated {
            Some(record) => {
                self.save(false).await;
                record
            }
            None => {
                let tab = BrowserTab { id: tab_id, ..tab.clone() };
                self.handle_created(&tab).await
            }
        }
    }

    /// Stop tracking a tab. `None` if it was never tracked.
    pub async fn handle_removed(&self, tab_id: i32) -> Option<TabRecord> {
        let removed = self.tabs.borrow_mut().remove(&tab_id);
        if removed.is_some() {
            debug!("Stopped tracking tab {}", tab_id);
            self.save(false).await;
        }
        removed
    }

    /// Record an access and mark the tab active within its window
    pub async fn handle_activated(&self, tab_id: i32) -> Option<TabRecord> {
        let now = self.clock.now();
        let activated = {
            let mut tabs = self.tabs.borrow_mut();
            let window_id = tabs.get(&tab_id)?.window_id;
            for record in tabs.values_mut().filter(|r| r.window_id == window_id) {
                record.active = record.id == tab_id;
            }
            tabs.get_mut(&tab_id).map(|record| {
                record.touch(now);
                record.access_count += 1;
                record.clone()
            })
        };

        if activated.is_some() {
            self.save(false).await;
        }
        activated
    }

    /// Rebuild the whole mapping from the live tab set.
    ///
    /// Rejected with `RefreshInProgress` while another refresh is running.
    /// Access history of tabs that were already tracked is carried over.
    pub async fn refresh_all(&self) -> Result<usize> {
        if self.refreshing.replace(true) {
            return Err(TabError::RefreshInProgress);
        }
        let _guard = RefreshGuard(&self.refreshing);

        let live = self.browser.query_tabs().await?;
        let previous = self.tabs.borrow().clone();
        let manual = self.categorizer.mode() == CategorizationMode::Manual;
        let now = self.clock.now();

        let mut rebuilt = HashMap::with_capacity(live.len());
        for batch in live.chunks(self.config.refresh_batch_size.max(1)) {
            self.scheduler.yield_now().await;

            for tab in batch {
                let old = previous.get(&tab.id);
                let access_count = old.map_or(0, |r| r.access_count);
                let category = match old {
                    Some(old) if manual => old.category.clone(),
                    _ => self.categorizer.categorize(&CategorizeInput::new(
                        tab.url.as_deref(),
                        tab.title.as_deref(),
                        access_count,
                    )),
                };

                let mut record = TabRecord::new(tab, category, now);
                if let Some(old) = old {
                    record.created_at = old.created_at;
                    record.last_accessed = old.last_accessed;
                    record.access_count = old.access_count;
                }
                rebuilt.insert(tab.id, record);
            }
        }

        let count = {
            let mut tabs = self.tabs.borrow_mut();
            Self::merge_concurrent_changes(&mut rebuilt, &previous, &tabs);
            *tabs = rebuilt;
            tabs.len()
        };
        info!("Refreshed {} tabs", count);
        self.save(true).await;
        Ok(count)
    }

    /// Fold in what other handlers did while the refresh was suspended:
    /// access fields never go backwards, tabs created meanwhile are kept
    /// and tabs removed meanwhile stay removed.
    fn merge_concurrent_changes(
        rebuilt: &mut HashMap<i32, TabRecord>,
        previous: &HashMap<i32, TabRecord>,
        current: &HashMap<i32, TabRecord>,
    ) {
        rebuilt.retain(|id, _| current.contains_key(id) || !previous.contains_key(id));

        for (id, record) in current {
            match rebuilt.get_mut(id) {
                Some(fresh) => {
                    if record.last_accessed > fresh.last_accessed {
                        fresh.last_accessed = record.last_accessed;
                        fresh.active = record.active;
                    }
                    fresh.access_count = fresh.access_count.max(record.access_count);
                }
                None if !previous.contains_key(id) => {
                    rebuilt.insert(*id, record.clone());
                }
                None => {}
            }
        }
    }

    /// Assign tracked tabs to a category. Returns how many were moved.
    pub async fn move_tabs(&self, tab_ids: &[i32], category: &str) -> Result<usize> {
        self.ensure_known(category)?;
        let now = self.clock.now();

        let mut moved = 0;
        {
            let mut tabs = self.tabs.borrow_mut();
            for id in tab_ids {
                if let Some(record) = tabs.get_mut(id) {
                    record.category = category.to_string();
                    record.touch(now);
                    moved += 1;
                }
            }
        }

        if moved > 0 {
            self.save(false).await;
        }
        Ok(moved)
    }

    /// Re-sequence `last_accessed` so the listed tabs of `category` come first
    /// in the given order. Unlisted tabs keep their relative order after them.
    pub async fn reorder_tabs(&self, tab_ids: &[i32], category: &str) -> Result<usize> {
        self.ensure_known(category)?;
        let now = self.clock.now();

        let reordered = {
            let mut tabs = self.tabs.borrow_mut();

            let mut seen = HashSet::new();
            let listed: Vec<i32> = tab_ids
                .iter()
                .copied()
                .filter(|id| tabs.get(id).is_some_and(|r| r.category == category))
                .filter(|id| seen.insert(*id))
                .collect();

            let max_existing = tabs
                .values()
                .filter(|r| r.category == category)
                .map(|r| r.last_accessed)
                .fold(f64::NEG_INFINITY, f64::max);
            // Highest timestamp first; the last listed tab still lands above
            // every existing timestamp, so nothing moves backwards.
            let base = now.max(max_existing + listed.len() as f64);

            for (index, id) in listed.iter().enumerate() {
                if let Some(record) = tabs.get_mut(id) {
                    record.last_accessed = base - index as f64;
                }
            }
            listed.len()
        };

        if reordered > 0 {
            self.save(false).await;
        }
        Ok(reordered)
    }

    /// Drop tracked tabs the browser no longer knows about
    pub async fn cleanup_stale(&self) -> Result<usize> {
        let live: HashSet<i32> = self.browser.query_tabs().await?.into_iter().map(|tab| tab.id).collect();

        let removed = {
            let mut tabs = self.tabs.borrow_mut();
            let before = tabs.len();
            tabs.retain(|id, _| live.contains(id));
            before - tabs.len()
        };

        if removed > 0 {
            info!("Removed {} stale tabs", removed);
            self.save(false).await;
        }
        Ok(removed)
    }

    /// Recategorize tabs whose category no longer exists in the rule table
    pub async fn ensure_categories(&self) -> usize {
        let fixed = {
            let mut tabs = self.tabs.borrow_mut();
            tabs.values_mut()
                .filter(|record| !self.categorizer.is_known(&record.category))
                .map(|record| {
                    record.category = self.categorizer.categorize(&CategorizeInput::from_record(record));
                })
                .count()
        };

        if fixed > 0 {
            debug!("Recategorized {} tabs with unknown categories", fixed);
            self.save(false).await;
        }
        fixed
    }

    fn ensure_known(&self, category: &str) -> Result<()> {
        if self.categorizer.is_known(category) {
            Ok(())
        } else {
            Err(TabError::InvalidMessage(format!("unknown category '{}'", category)))
        }
    }

    /// Persist the mapping; failures are logged, the in-memory state stands
    async fn save(&self, immediate: bool) {
        let tabs = self.tabs.borrow().clone();
        if let Err(e) = self.storage.set_tabs(&tabs, immediate).await {
            warn!("Failed to save tabs: {}", e);
        }
    }
}
