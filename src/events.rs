/// Browser event handling and internal notifications
///
/// `EventDispatcher` receives browser lifecycle notifications, applies them
/// to the tab store and tells UI listeners through the `EventBus`. Handlers
/// never fail outward: the browser has nobody to report a failure to, so
/// errors stop at `dispatch` and are logged.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::categorizer::Categorizer;
use crate::error::{Result, TabError};
use crate::host::{EventSource, Scheduler};
use crate::storage::{Storage, CATEGORY_RULES_KEY, SETTINGS_KEY};
use crate::tab_data::{BrowserTab, Settings};
use crate::tab_store::TabStore;

pub const TABS_CHANGED: &str = "tabsChanged";
pub const SETTINGS_CHANGED: &str = "settingsChanged";
pub const RULES_CHANGED: &str = "rulesChanged";
pub const INSTALLED: &str = "installed";

/// Window id reported when no browser window has focus
pub const WINDOW_ID_NONE: i32 = -1;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TabChangeInfo {
    pub status: Option<String>,
}

impl TabChangeInfo {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("complete")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    Install,
    Update,
    ChromeUpdate,
    SharedModuleUpdate,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Lifecycle notifications delivered by the browser
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrowserEvent {
    TabCreated {
        tab: BrowserTab,
    },
    TabUpdated {
        tab_id: i32,
        #[serde(default)]
        change_info: TabChangeInfo,
        tab: BrowserTab,
    },
    TabRemoved {
        tab_id: i32,
    },
    TabActivated {
        tab_id: i32,
        #[serde(default)]
        window_id: i32,
    },
    WindowFocusChanged {
        window_id: i32,
    },
    Installed {
        reason: InstallReason,
        #[serde(default)]
        previous_version: Option<String>,
    },
    Startup,
    StorageChanged {
        changes: HashMap<String, StorageChange>,
    },
}

impl BrowserEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserEvent::TabCreated { .. } => "tabCreated",
            BrowserEvent::TabUpdated { .. } => "tabUpdated",
            BrowserEvent::TabRemoved { .. } => "tabRemoved",
            BrowserEvent::TabActivated { .. } => "tabActivated",
            BrowserEvent::WindowFocusChanged { .. } => "windowFocusChanged",
            BrowserEvent::Installed { .. } => "installed",
            BrowserEvent::Startup => "startup",
            BrowserEvent::StorageChanged { .. } => "storageChanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Listener = Rc<dyn Fn(&Value)>;

/// Named publish/subscribe channel for notifications between components
#[derive(Default)]
pub struct EventBus {
    listeners: RefCell<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, name: &str, listener: impl Fn(&Value) + 'static) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.listeners
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push((id, Rc::new(listener)));
        id
    }

    /// Returns false if the listener was not registered under `name`
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(registered) = listeners.get_mut(name) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(existing, _)| *existing != id);
        let removed = registered.len() < before;
        if registered.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    /// Call every listener of `name`; returns how many were called
    pub fn emit(&self, name: &str, payload: &Value) -> usize {
        // Listeners may subscribe or unsubscribe while being called
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .get(name)
            .map(|registered| registered.iter().map(|(_, listener)| Rc::clone(listener)).collect())
            .unwrap_or_default();

        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }
}

pub struct EventDispatcher {
    tabs: Rc<TabStore>,
    storage: Rc<Storage>,
    categorizer: Rc<Categorizer>,
    bus: Rc<EventBus>,
    scheduler: Rc<dyn Scheduler>,
    bound: Cell<bool>,
}

impl EventDispatcher {
    pub fn new(
        tabs: Rc<TabStore>,
        storage: Rc<Storage>,
        categorizer: Rc<Categorizer>,
        bus: Rc<EventBus>,
        scheduler: Rc<dyn Scheduler>,
    ) -> Self {
        EventDispatcher {
            tabs,
            storage,
            categorizer,
            bus,
            scheduler,
            bound: Cell::new(false),
        }
    }

    /// Subscribe to the browser's notifications. Only the first call binds.
    pub fn bind(self: &Rc<Self>, source: &dyn EventSource) -> bool {
        if self.bound.replace(true) {
            warn!("Event dispatcher is already bound");
            return false;
        }

        let this = Rc::clone(self);
        source.subscribe(Rc::new(move |event| {
            let dispatcher = Rc::clone(&this);
            this.scheduler.spawn(Box::pin(async move {
                dispatcher.dispatch(event).await;
            }));
        }));
        debug!("Event dispatcher bound");
        true
    }

    /// Handle one notification, logging any failure
    pub async fn dispatch(&self, event: BrowserEvent) {
        let name = event.name();
        if let Err(e) = self.handle(event).await {
            error!("Error handling {} event: {}", name, e);
        }
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        match event {
            BrowserEvent::TabCreated { tab } => {
                let record = self.tabs.handle_created(&tab).await;
                self.notify_tabs("created", Some(record.id));
            }
            BrowserEvent::TabUpdated { tab_id, change_info, tab } => {
                if !change_info.is_complete() {
                    return Ok(());
                }
                self.tabs.handle_updated(tab_id, &tab).await;
                self.notify_tabs("updated", Some(tab_id));
            }
            BrowserEvent::TabRemoved { tab_id } => match self.tabs.handle_removed(tab_id).await {
                Some(_) => self.notify_tabs("removed", Some(tab_id)),
                None => debug!("Removed tab {} was not tracked", tab_id),
            },
            BrowserEvent::TabActivated { tab_id, .. } => match self.tabs.handle_activated(tab_id).await {
                Some(_) => self.notify_tabs("activated", Some(tab_id)),
                None => debug!("Activated tab {} is not tracked yet", tab_id),
            },
            BrowserEvent::WindowFocusChanged { window_id } => {
                if window_id == WINDOW_ID_NONE {
                    debug!("All browser windows lost focus");
                } else {
                    debug!("Window {} focused", window_id);
                }
            }
            BrowserEvent::Installed { reason, previous_version } => match reason {
                InstallReason::Install => {
                    info!("Extension installed");
                    self.initialize_defaults().await?;
                    self.bus.emit(INSTALLED, &json!({ "reason": "install" }));
                    self.refresh().await?;
                }
                InstallReason::Update => {
                    info!("Extension updated from {}", previous_version.as_deref().unwrap_or("unknown"));
                    self.migrate(previous_version.as_deref()).await?;
                    self.refresh().await?;
                }
                other => debug!("Ignoring install event {:?}", other),
            },
            BrowserEvent::Startup => {
                info!("Browser started");
                self.categorizer.reload(&self.storage).await?;
                self.tabs.initialize().await?;
                self.tabs.cleanup_stale().await?;
                // Tab ids do not survive a browser restart; pick up the live set
                self.refresh().await?;
                self.notify_tabs("startup", None);
            }
            BrowserEvent::StorageChanged { changes } => {
                let changes: HashMap<String, Option<Value>> = changes
                    .into_iter()
                    .map(|(key, change)| (key, change.new_value))
                    .collect();
                self.storage.apply_external_change(&changes);

                if changes.contains_key(SETTINGS_KEY) || changes.contains_key(CATEGORY_RULES_KEY) {
                    self.categorizer.reload(&self.storage).await?;
                }
            }
        }
        Ok(())
    }

    /// Write default settings unless some are already stored
    async fn initialize_defaults(&self) -> Result<()> {
        if self.storage.get(SETTINGS_KEY, false).await?.is_none() {
            self.storage.set_settings(&Settings::default()).await?;
            self.bus.emit(SETTINGS_CHANGED, &serde_json::to_value(Settings::default())?);
        }
        Ok(())
    }

    /// Hook for converting data written by an older version; nothing to convert yet
    async fn migrate(&self, previous_version: Option<&str>) -> Result<()> {
        debug!("No data migration needed from {:?}", previous_version);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        match self.tabs.refresh_all().await {
            Ok(_) => {
                self.notify_tabs("refreshed", None);
                Ok(())
            }
            Err(TabError::RefreshInProgress) => {
                debug!("Refresh already running, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn notify_tabs(&self, reason: &str, tab_id: Option<i32>) {
        self.bus.emit(
            TABS_CHANGED,
            &json!({ "reason": reason, "tabId": tab_id, "totalCount": self.tabs.len() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{browser_tab, local, FakeEventSource, Harness};
    use std::time::Duration;

    fn complete(tab: BrowserTab) -> BrowserEvent {
        BrowserEvent::TabUpdated {
            tab_id: tab.id,
            change_info: TabChangeInfo { status: Some("complete".to_string()) },
            tab,
        }
    }

    #[test]
    fn test_bus_on_off_emit() {
        let bus = EventBus::new();
        let hits = Rc::new(Cell::new(0));

        let counter = Rc::clone(&hits);
        let id = bus.on("ping", move |_| counter.set(counter.get() + 1));

        assert_eq!(bus.emit("ping", &Value::Null), 1);
        assert_eq!(bus.emit("other", &Value::Null), 0);
        assert!(bus.off("ping", id));
        assert!(!bus.off("ping", id));
        assert_eq!(bus.emit("ping", &Value::Null), 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus = Rc::new(EventBus::new());
        let slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));

        let (bus_ref, slot_ref) = (Rc::clone(&bus), Rc::clone(&slot));
        let id = bus.on("once", move |_| {
            if let Some(id) = slot_ref.get() {
                bus_ref.off("once", id);
            }
        });
        slot.set(Some(id));

        assert_eq!(bus.emit("once", &Value::Null), 1);
        assert_eq!(bus.emit("once", &Value::Null), 0);
    }

    #[test]
    fn test_event_deserialization() {
        let event: BrowserEvent = serde_json::from_value(json!({
            "kind": "tabUpdated",
            "tabId": 4,
            "changeInfo": {"status": "complete"},
            "tab": {"id": 4, "url": "https://github.com", "title": "GitHub", "windowId": 1}
        }))
        .unwrap();
        assert!(matches!(event, BrowserEvent::TabUpdated { tab_id: 4, .. }));

        let event: BrowserEvent =
            serde_json::from_value(json!({"kind": "installed", "reason": "update", "previousVersion": "0.0.9"})).unwrap();
        assert_eq!(
            event,
            BrowserEvent::Installed { reason: InstallReason::Update, previous_version: Some("0.0.9".to_string()) }
        );

        assert!(serde_json::from_value::<BrowserEvent>(json!({"kind": "startup"})).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_only_once_and_events_flow() {
        local(async {
            let h = Harness::new().await;
            let dispatcher = h.dispatcher();
            let source = FakeEventSource::new();

            assert!(dispatcher.bind(&source));
            assert!(!dispatcher.bind(&source));
            assert_eq!(source.subscriptions(), 1);

            let notifications = h.record_bus(TABS_CHANGED);
            source.emit(BrowserEvent::TabCreated { tab: browser_tab(1, "https://github.com", "GitHub") });
            tokio::time::sleep(Duration::from_millis(1)).await;

            assert_eq!(h.tabs.get(1).unwrap().category, "development");
            assert_eq!(notifications.borrow().len(), 1);
            assert_eq!(notifications.borrow()[0]["reason"], "created");
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_only_on_complete() {
        local(async {
            let h = Harness::new().await;
            let dispatcher = h.dispatcher();

            dispatcher
                .dispatch(BrowserEvent::TabUpdated {
                    tab_id: 2,
                    change_info: TabChangeInfo { status: Some("loading".to_string()) },
                    tab: browser_tab(2, "https://github.com", "GitHub"),
                })
                .await;
            assert!(h.tabs.get(2).is_none());

            dispatcher.dispatch(complete(browser_tab(2, "https://github.com", "GitHub"))).await;
            assert!(h.tabs.get(2).is_some());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_activate() {
        local(async {
            let h = Harness::new().await;
            let dispatcher = h.dispatcher();
            dispatcher.dispatch(BrowserEvent::TabCreated { tab: browser_tab(1, "https://a.com", "A") }).await;

            dispatcher.dispatch(BrowserEvent::TabActivated { tab_id: 1, window_id: 1 }).await;
            assert_eq!(h.tabs.get(1).unwrap().access_count, 1);

            // Unknown ids are harmless
            dispatcher.dispatch(BrowserEvent::TabActivated { tab_id: 5, window_id: 1 }).await;
            dispatcher.dispatch(BrowserEvent::TabRemoved { tab_id: 5 }).await;

            dispatcher.dispatch(BrowserEvent::TabRemoved { tab_id: 1 }).await;
            assert!(h.tabs.is_empty());

            dispatcher.dispatch(BrowserEvent::WindowFocusChanged { window_id: WINDOW_ID_NONE }).await;
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_writes_defaults_and_refreshes() {
        local(async {
            let h = Harness::new().await;
            let dispatcher = h.dispatcher();
            let welcomed = h.record_bus(INSTALLED);
            h.browser.set_tabs(vec![browser_tab(1, "https://github.com", "GitHub")]);

            dispatcher
                .dispatch(BrowserEvent::Installed { reason: InstallReason::Install, previous_version: None })
                .await;

            assert!(h.area.value(SETTINGS_KEY).is_some());
            assert_eq!(welcomed.borrow().len(), 1);
            assert_eq!(h.tabs.len(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_keeps_existing_settings() {
        local(async {
            let h = Harness::new().await;
            h.area.insert(SETTINGS_KEY, json!({"theme": "dark"}));

            h.dispatcher()
                .dispatch(BrowserEvent::Installed { reason: InstallReason::Install, previous_version: None })
                .await;

            assert_eq!(h.area.value(SETTINGS_KEY), Some(json!({"theme": "dark"})));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_refreshes_tabs() {
        local(async {
            let h = Harness::new().await;
            h.browser.set_tabs(vec![browser_tab(3, "https://netflix.com", "Netflix")]);

            h.dispatcher()
                .dispatch(BrowserEvent::Installed {
                    reason: InstallReason::Update,
                    previous_version: Some("0.0.1".to_string()),
                })
                .await;

            assert_eq!(h.tabs.get(3).unwrap().category, "entertainment");
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_restores_and_cleans_up() {
        local(async {
            let h = Harness::new().await;
            h.tabs.handle_created(&browser_tab(1, "https://a.com", "A")).await;
            h.tabs.handle_created(&browser_tab(2, "https://b.com", "B")).await;
            h.storage.flush_pending_saves().await.unwrap();

            let restarted = Harness::with_area(h.area.clone()).await;
            restarted.browser.set_tabs(vec![browser_tab(2, "https://b.com", "B")]);
            restarted.dispatcher().dispatch(BrowserEvent::Startup).await;

            assert_eq!(restarted.tabs.len(), 1);
            assert!(restarted.tabs.get(2).is_some());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_tracks_tabs_with_new_ids() {
        local(async {
            let h = Harness::new().await;
            h.tabs.handle_created(&browser_tab(1, "https://github.com", "GitHub")).await;
            h.tabs.handle_created(&browser_tab(2, "https://youtube.com", "YouTube")).await;
            h.storage.flush_pending_saves().await.unwrap();

            let restarted = Harness::with_area(h.area.clone()).await;
            restarted.browser.set_tabs(vec![
                browser_tab(101, "https://github.com", "GitHub"),
                browser_tab(102, "https://youtube.com", "YouTube"),
            ]);
            restarted.dispatcher().dispatch(BrowserEvent::Startup).await;

            assert_eq!(restarted.tabs.len(), 2);
            assert_eq!(restarted.tabs.get(101).unwrap().category, "development");
            assert_eq!(restarted.tabs.get(102).unwrap().category, "entertainment");
            assert!(restarted.tabs.get(1).is_none());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_is_contained() {
        local(async {
            let h = Harness::new().await;
            h.tabs.handle_created(&browser_tab(1, "https://a.com", "A")).await;
            h.browser.set_failing(true);

            // cleanup_stale fails inside the handler; dispatch still returns
            h.dispatcher().dispatch(BrowserEvent::Startup).await;
            h.dispatcher()
                .dispatch(BrowserEvent::Installed { reason: InstallReason::Update, previous_version: None })
                .await;
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_change_reloads_rules() {
        local(async {
            let h = Harness::new().await;
            let dispatcher = h.dispatcher();
            let rules = json!({"work": {"domains": ["corp.example"], "keywords": []}});

            let mut changes = HashMap::new();
            changes.insert(
                CATEGORY_RULES_KEY.to_string(),
                StorageChange { old_value: None, new_value: Some(rules) },
            );
            dispatcher.dispatch(BrowserEvent::StorageChanged { changes }).await;

            assert!(h.categorizer.is_known("work"));
        })
        .await;
    }
}
