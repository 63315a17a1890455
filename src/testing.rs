/// In-memory host fakes and a wired-up harness for unit tests
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::categorizer::Categorizer;
use crate::config::{StorageConfig, TabStoreConfig};
use crate::events::{BrowserEvent, EventBus, EventDispatcher};
use crate::host::{BrowserTabs, Clock, EventSink, EventSource, HostError, HostResult, Scheduler, StorageArea};
use crate::messages::MessageRouter;
use crate::rules::{add_rule, RuleKind};
use crate::storage::{Storage, TABS_KEY};
use crate::tab_data::{BrowserTab, TabRecord};
use crate::tab_store::TabStore;

pub const TEST_QUOTA_BYTES: u64 = 10 * 1024 * 1024;

/// Run a future on a `LocalSet` so `spawn_local` works inside it
pub async fn local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(task);
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn yield_now(&self) -> LocalBoxFuture<'static, ()> {
        Box::pin(tokio::task::yield_now())
    }
}

pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { now: Cell::new(1_700_000_000_000.0) }
    }

    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: f64) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }
}

#[derive(Default)]
pub struct MemoryArea {
    values: RefCell<HashMap<String, Value>>,
    write_count: Cell<usize>,
    write_attempts: Cell<usize>,
    failing_writes: Cell<usize>,
    read_failure: Cell<bool>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.values.borrow_mut().insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.borrow().get(key).cloned()
    }

    /// Successful `set` calls
    pub fn write_count(&self) -> usize {
        self.write_count.get()
    }

    /// All `set` calls, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.get()
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.set(n);
    }

    pub fn set_read_failure(&self, failing: bool) {
        self.read_failure.set(failing);
    }

    fn size_of(&self, key: &str) -> u64 {
        self.values
            .borrow()
            .get(key)
            .map_or(0, |value| (key.len() + value.to_string().len()) as u64)
    }
}

impl StorageArea for MemoryArea {
    fn get(&self, keys: Vec<String>) -> LocalBoxFuture<'_, HostResult<HashMap<String, Value>>> {
        Box::pin(async move {
            if self.read_failure.get() {
                return Err(HostError::Failed("read failed".to_string()));
            }
            let values = self.values.borrow();
            Ok(keys
                .into_iter()
                .filter_map(|key| values.get(&key).cloned().map(|value| (key, value)))
                .collect())
        })
    }

    fn set(&self, items: HashMap<String, Value>) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move {
            self.write_attempts.set(self.write_attempts.get() + 1);
            let failing = self.failing_writes.get();
            if failing > 0 {
                self.failing_writes.set(failing - 1);
                return Err(HostError::Failed("write failed".to_string()));
            }
            self.values.borrow_mut().extend(items);
            self.write_count.set(self.write_count.get() + 1);
            Ok(())
        })
    }

    fn bytes_in_use(&self, keys: Option<Vec<String>>) -> LocalBoxFuture<'_, HostResult<u64>> {
        Box::pin(async move {
            let keys = keys.unwrap_or_else(|| self.values.borrow().keys().cloned().collect());
            Ok(keys.iter().map(|key| self.size_of(key)).sum())
        })
    }

    fn quota_bytes(&self) -> u64 {
        TEST_QUOTA_BYTES
    }
}

#[derive(Default)]
pub struct FakeBrowser {
    tabs: RefCell<Vec<BrowserTab>>,
    failing: Cell<bool>,
    latency: Cell<Duration>,
    query_count: Cell<usize>,
    activated: RefCell<Vec<i32>>,
    focused: RefCell<Vec<i32>>,
    removed: RefCell<Vec<i32>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tabs(&self, tabs: Vec<BrowserTab>) {
        *self.tabs.borrow_mut() = tabs;
    }

    /// Every call fails as if the extension context went away
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    pub fn query_count(&self) -> usize {
        self.query_count.get()
    }

    pub fn activated(&self) -> Vec<i32> {
        self.activated.borrow().clone()
    }

    pub fn focused(&self) -> Vec<i32> {
        self.focused.borrow().clone()
    }

    pub fn removed(&self) -> Vec<i32> {
        self.removed.borrow().clone()
    }

    async fn call(&self) -> HostResult<()> {
        let latency = self.latency.get();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.get() {
            return Err(HostError::ContextInvalidated);
        }
        Ok(())
    }

    fn find(&self, tab_id: i32) -> HostResult<BrowserTab> {
        self.tabs
            .borrow()
            .iter()
            .find(|tab| tab.id == tab_id)
            .cloned()
            .ok_or(HostError::NoSuchTab(tab_id))
    }
}

impl BrowserTabs for FakeBrowser {
    fn query_tabs(&self) -> LocalBoxFuture<'_, HostResult<Vec<BrowserTab>>> {
        Box::pin(async move {
            self.query_count.set(self.query_count.get() + 1);
            self.call().await?;
            Ok(self.tabs.borrow().clone())
        })
    }

    fn get_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<BrowserTab>> {
        Box::pin(async move {
            self.call().await?;
            self.find(tab_id)
        })
    }

    fn activate_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move {
            self.call().await?;
            self.find(tab_id)?;
            self.activated.borrow_mut().push(tab_id);
            Ok(())
        })
    }

    fn remove_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move {
            self.call().await?;
            self.find(tab_id)?;
            self.tabs.borrow_mut().retain(|tab| tab.id != tab_id);
            self.removed.borrow_mut().push(tab_id);
            Ok(())
        })
    }

    fn focus_window(&self, window_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move {
            self.call().await?;
            if !self.tabs.borrow().iter().any(|tab| tab.window_id == window_id) {
                return Err(HostError::NoSuchWindow(window_id));
            }
            self.focused.borrow_mut().push(window_id);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct FakeEventSource {
    sinks: RefCell<Vec<EventSink>>,
}

impl FakeEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> usize {
        self.sinks.borrow().len()
    }

    pub fn emit(&self, event: BrowserEvent) {
        let sinks = self.sinks.borrow().clone();
        for sink in sinks {
            sink(event.clone());
        }
    }
}

impl EventSource for FakeEventSource {
    fn subscribe(&self, sink: EventSink) {
        self.sinks.borrow_mut().push(sink);
    }
}

pub fn browser_tab(id: i32, url: &str, title: &str) -> BrowserTab {
    BrowserTab {
        id,
        url: Some(url.to_string()),
        title: Some(title.to_string()),
        window_id: 1,
        status: Some("complete".to_string()),
        ..BrowserTab::default()
    }
}

pub fn record(id: i32, url: &str, title: &str, category: &str) -> TabRecord {
    TabRecord::new(&browser_tab(id, url, title), category.to_string(), 0.0)
}

/// Every component wired over the fakes, the way the background starts them
pub struct Harness {
    pub browser: Rc<FakeBrowser>,
    pub area: Rc<MemoryArea>,
    pub clock: Rc<ManualClock>,
    pub scheduler: Rc<dyn Scheduler>,
    pub storage: Rc<Storage>,
    pub categorizer: Rc<Categorizer>,
    pub tabs: Rc<TabStore>,
    pub bus: Rc<EventBus>,
}

impl Harness {
    pub async fn new() -> Harness {
        Self::with_area(Rc::new(MemoryArea::new())).await
    }

    /// A fresh harness over an existing storage area, like a restarted worker
    pub async fn with_area(area: Rc<MemoryArea>) -> Harness {
        let browser = Rc::new(FakeBrowser::new());
        let clock = Rc::new(ManualClock::new());
        let scheduler: Rc<dyn Scheduler> = Rc::new(TokioScheduler);

        let storage = Storage::open(
            Some(area.clone() as Rc<dyn StorageArea>),
            Rc::clone(&scheduler),
            clock.clone(),
            StorageConfig::default(),
        )
        .await
        .expect("memory area opens");

        let categorizer = Rc::new(Categorizer::new());
        categorizer.reload(&storage).await.expect("rules load");

        let tabs = Rc::new(TabStore::new(
            browser.clone(),
            Rc::clone(&storage),
            Rc::clone(&categorizer),
            Rc::clone(&scheduler),
            clock.clone(),
            TabStoreConfig::default(),
        ));

        Harness {
            browser,
            area,
            clock,
            scheduler,
            storage,
            categorizer,
            tabs,
            bus: Rc::new(EventBus::new()),
        }
    }

    /// Number of tab records currently written to the storage area
    pub fn storage_tab_count(&self) -> usize {
        self.area
            .value(TABS_KEY)
            .and_then(|value| value.as_object().map(|tabs| tabs.len()))
            .unwrap_or(0)
    }

    pub async fn add_custom_keyword(&self, category: &str, keyword: &str) {
        let mut rules = self.storage.get_category_rules().await.unwrap();
        add_rule(&mut rules, category, RuleKind::Keyword, keyword).unwrap();
        self.storage.set_category_rules(&rules).await.unwrap();
        self.categorizer.reload(&self.storage).await.unwrap();
    }

    /// Collect every payload emitted on the bus under `name`
    pub fn record_bus(&self, name: &str) -> Rc<RefCell<Vec<Value>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        self.bus.on(name, move |payload| sink.borrow_mut().push(payload.clone()));
        seen
    }

    pub fn dispatcher(&self) -> Rc<EventDispatcher> {
        Rc::new(EventDispatcher::new(
            Rc::clone(&self.tabs),
            Rc::clone(&self.storage),
            Rc::clone(&self.categorizer),
            Rc::clone(&self.bus),
            Rc::clone(&self.scheduler),
        ))
    }

    pub fn router(&self) -> MessageRouter {
        MessageRouter::new(
            Rc::clone(&self.tabs),
            Rc::clone(&self.storage),
            Rc::clone(&self.categorizer),
            self.browser.clone(),
            Rc::clone(&self.bus),
        )
    }
}
