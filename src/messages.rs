/// Request/response API for the popup and sidebar
///
/// Every request is a JSON object tagged by `type`. Every response, including
/// failures, is a `{success, data?, error?, code?}` envelope; nothing is ever
/// thrown back across the messaging boundary.
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{select, Either};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::categorizer::Categorizer;
use crate::domain::{count_domains, top_domains};
use crate::error::{Result, TabError};
use crate::events::{EventBus, RULES_CHANGED, SETTINGS_CHANGED, TABS_CHANGED};
use crate::host::{BrowserTabs, Scheduler};
use crate::operations::{count_by_category, find_duplicates, search_tabs, sort_for_display};
use crate::rules::{add_rule, remove_rule, validate_custom_rules, CustomRules, RuleKind};
use crate::storage::{ExportBundle, Storage, StorageUsage, LAST_UPDATED_KEY};
use crate::tab_data::TabRecord;
use crate::tab_store::TabStore;

const TOP_DOMAIN_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Ping,
    GetAllTabs,
    RefreshTabs,
    FocusTab { tab_id: i32 },
    CloseTab { tab_id: i32 },
    MoveTabs { tab_ids: Vec<i32>, category: String },
    ReorderTabs { tab_ids: Vec<i32>, category: String },
    SearchTabs { query: String },
    GetSettings,
    SetSettings { settings: Value },
    GetCustomRules,
    SetCustomRules { rules: CustomRules },
    AddCustomRule { category: String, value: String, rule_type: RuleKind },
    RemoveCustomRule { category: String, value: String, rule_type: RuleKind },
    GetStats,
    ExportSettings,
    ImportSettings { data: ExportBundle },
}

impl Request {
    pub const TYPES: &'static [&'static str] = &[
        "ping",
        "getAllTabs",
        "refreshTabs",
        "focusTab",
        "closeTab",
        "moveTabs",
        "reorderTabs",
        "searchTabs",
        "getSettings",
        "setSettings",
        "getCustomRules",
        "setCustomRules",
        "addCustomRule",
        "removeCustomRule",
        "getStats",
        "exportSettings",
        "importSettings",
    ];

    /// Decode a raw message, telling unknown types apart from malformed payloads
    pub fn parse(raw: &Value) -> Result<Request> {
        let Some(kind) = raw.get("type").and_then(Value::as_str) else {
            return Err(TabError::InvalidMessage("message has no type".to_string()));
        };
        if !Self::TYPES.contains(&kind) {
            return Err(TabError::InvalidMessage(format!("Unknown message type: {}", kind)));
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| TabError::InvalidMessage(format!("malformed {} request: {}", kind, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Response {
        Response { success: true, data: Some(data), error: None, code: None }
    }

    pub fn fail(err: &TabError) -> Response {
        Response {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }

    pub fn no_response(timeout: Duration) -> Response {
        Response {
            success: false,
            data: None,
            error: Some(format!("No response within {} ms", timeout.as_millis())),
            code: Some("timeout".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TabsPayload {
    tabs: Vec<TabRecord>,
    categories: BTreeMap<String, usize>,
    total_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DomainCount {
    domain: String,
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    total_tabs: usize,
    pinned_tabs: usize,
    window_count: usize,
    duplicate_count: usize,
    categories: BTreeMap<String, usize>,
    top_domains: Vec<DomainCount>,
    persistent: bool,
    storage: Option<StorageUsage>,
    last_updated: Option<f64>,
}

pub struct MessageRouter {
    tabs: Rc<TabStore>,
    storage: Rc<Storage>,
    categorizer: Rc<Categorizer>,
    browser: Rc<dyn BrowserTabs>,
    bus: Rc<EventBus>,
}

impl MessageRouter {
    pub fn new(
        tabs: Rc<TabStore>,
        storage: Rc<Storage>,
        categorizer: Rc<Categorizer>,
        browser: Rc<dyn BrowserTabs>,
        bus: Rc<EventBus>,
    ) -> Self {
        MessageRouter { tabs, storage, categorizer, browser, bus }
    }

    /// Handle an undecoded message from another extension context
    pub async fn handle_raw(&self, raw: Value) -> Response {
        match Request::parse(&raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Rejected message: {}", e);
                Response::fail(&e)
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("Handling {:?}", request);
        match self.route(request).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!("Request failed: {}", e);
                Response::fail(&e)
            }
        }
    }

    async fn route(&self, request: Request) -> Result<Value> {
        match request {
            Request::Ping => Ok(json!({ "status": "ready", "tabCount": self.tabs.len() })),
            Request::GetAllTabs => self.tabs_payload().await,
            Request::RefreshTabs => {
                self.refresh().await?;
                self.tabs_payload().await
            }
            Request::FocusTab { tab_id } => {
                let tab = self.browser.get_tab(tab_id).await?;
                self.browser.activate_tab(tab_id).await?;
                self.browser.focus_window(tab.window_id).await?;
                self.tabs.handle_activated(tab_id).await;
                Ok(json!({ "tabId": tab_id, "windowId": tab.window_id }))
            }
            Request::CloseTab { tab_id } => {
                // The store forgets the tab when the browser reports the removal
                self.browser.remove_tab(tab_id).await?;
                Ok(json!({ "tabId": tab_id }))
            }
            Request::MoveTabs { tab_ids, category } => {
                let moved = self.tabs.move_tabs(&tab_ids, &category).await?;
                self.notify_tabs("moved");
                Ok(json!({ "moved": moved, "category": category }))
            }
            Request::ReorderTabs { tab_ids, category } => {
                let reordered = self.tabs.reorder_tabs(&tab_ids, &category).await?;
                self.notify_tabs("reordered");
                Ok(json!({ "reordered": reordered, "category": category }))
            }
            Request::SearchTabs { query } => {
                self.tabs.ensure_categories().await;
                let sorted = sort_for_display(&self.tabs.snapshot(), &self.categorizer.table());
                let matches = search_tabs(&sorted, &query);
                Ok(json!({ "totalCount": matches.len(), "tabs": matches }))
            }
            Request::GetSettings => Ok(serde_json::to_value(self.storage.get_settings().await?)?),
            Request::SetSettings { settings } => {
                let current = self.storage.get_settings().await?;
                let merged = current.merged_with(&settings)?;
                self.storage.set_settings(&merged).await?;

                let value = serde_json::to_value(&merged)?;
                self.bus.emit(SETTINGS_CHANGED, &value);
                if merged.categorization_mode != current.categorization_mode {
                    self.rules_changed().await?;
                }
                Ok(value)
            }
            Request::GetCustomRules => Ok(serde_json::to_value(self.storage.get_category_rules().await?)?),
            Request::SetCustomRules { rules } => {
                let rules = validate_custom_rules(&rules)?;
                self.storage.set_category_rules(&rules).await?;
                self.rules_changed().await?;
                Ok(serde_json::to_value(&rules)?)
            }
            Request::AddCustomRule { category, value, rule_type } => {
                let mut rules = self.storage.get_category_rules().await?;
                let added = add_rule(&mut rules, &category, rule_type, &value)?;
                if added {
                    self.storage.set_category_rules(&rules).await?;
                    self.rules_changed().await?;
                }
                Ok(json!({ "added": added, "rules": rules }))
            }
            Request::RemoveCustomRule { category, value, rule_type } => {
                let mut rules = self.storage.get_category_rules().await?;
                let removed = remove_rule(&mut rules, &category, rule_type, &value);
                if removed {
                    self.storage.set_category_rules(&rules).await?;
                    self.rules_changed().await?;
                }
                Ok(json!({ "removed": removed, "rules": rules }))
            }
            Request::GetStats => self.stats().await,
            Request::ExportSettings => Ok(serde_json::to_value(self.storage.export_bundle().await?)?),
            Request::ImportSettings { data } => {
                let (settings, rules) = self.storage.import_bundle(&data).await?;
                self.bus.emit(SETTINGS_CHANGED, &serde_json::to_value(&settings)?);
                self.rules_changed().await?;
                Ok(json!({ "settings": settings, "categoryRules": rules }))
            }
        }
    }

    /// Current tabs in display order, categories re-checked against the rule table
    async fn tabs_payload(&self) -> Result<Value> {
        self.tabs.ensure_categories().await;
        let table = self.categorizer.table();
        let snapshot = self.tabs.snapshot();

        let payload = TabsPayload {
            categories: count_by_category(&snapshot, &table),
            total_count: snapshot.len(),
            tabs: sort_for_display(&snapshot, &table),
        };
        Ok(serde_json::to_value(payload)?)
    }

    async fn stats(&self) -> Result<Value> {
        self.tabs.ensure_categories().await;
        let table = self.categorizer.table();
        let snapshot = self.tabs.snapshot();

        let domain_counts = count_domains(snapshot.iter().map(|tab| tab.url.as_str()));
        let windows: HashSet<i32> = snapshot.iter().map(|tab| tab.window_id).collect();
        let storage = match self.storage.usage().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!("Storage usage unavailable: {}", e);
                None
            }
        };
        let last_updated = self
            .storage
            .get(LAST_UPDATED_KEY, true)
            .await
            .ok()
            .flatten()
            .and_then(|value| value.as_f64());

        let stats = Stats {
            total_tabs: snapshot.len(),
            pinned_tabs: snapshot.iter().filter(|tab| tab.pinned).count(),
            window_count: windows.len(),
            duplicate_count: find_duplicates(&snapshot).len(),
            categories: count_by_category(&snapshot, &table),
            top_domains: top_domains(&domain_counts, TOP_DOMAIN_COUNT)
                .into_iter()
                .map(|(domain, count)| DomainCount { domain, count })
                .collect(),
            persistent: self.storage.is_persistent(),
            storage,
            last_updated,
        };
        Ok(serde_json::to_value(stats)?)
    }

    /// Reload the rule table and recategorize every tab
    async fn rules_changed(&self) -> Result<()> {
        self.categorizer.reload(&self.storage).await?;
        self.bus
            .emit(RULES_CHANGED, &serde_json::to_value(self.storage.get_category_rules().await?)?);

        if let Err(e) = self.refresh().await {
            // Rules are saved; tabs that can't be recategorized now keep
            // their category unless it no longer exists.
            warn!("Could not recategorize tabs after rule change: {}", e);
            self.tabs.ensure_categories().await;
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        match self.tabs.refresh_all().await {
            Ok(_) => {
                self.notify_tabs("refreshed");
                Ok(())
            }
            Err(TabError::RefreshInProgress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn notify_tabs(&self, reason: &str) {
        self.bus
            .emit(TABS_CHANGED, &json!({ "reason": reason, "totalCount": self.tabs.len() }));
    }
}

/// Send a request and stop waiting after `timeout`, as a UI context would.
///
/// The handler runs as its own task, so a caller that gives up never cuts
/// short work the router has already started.
pub async fn request_with_timeout(
    router: &Rc<MessageRouter>,
    request: Value,
    scheduler: &dyn Scheduler,
    timeout: Duration,
) -> Response {
    let (reply, response) = oneshot::channel();
    let router = Rc::clone(router);
    scheduler.spawn(Box::pin(async move {
        let response = router.handle_raw(request).await;
        if reply.send(response).is_err() {
            debug!("Caller stopped waiting; response dropped");
        }
    }));

    match select(response, scheduler.sleep(timeout)).await {
        Either::Left((Ok(response), _)) => response,
        Either::Left((Err(_), _)) => Response::no_response(timeout),
        Either::Right(_) => {
            warn!("Request timed out after {:?}", timeout);
            Response::no_response(timeout)
        }
    }
}
