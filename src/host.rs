/// Capabilities borrowed from the browser host
///
/// Everything the extension needs from the outside world goes through these
/// traits: the tab/window APIs, the key-value storage area, timers and the
/// wall clock. The `chrome` module implements them over the JS bridge; tests
/// implement them with in-memory fakes.
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::events::BrowserEvent;
use crate::tab_data::BrowserTab;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HostError {
    #[error("no tab with id {0}")]
    NoSuchTab(i32),
    #[error("no window with id {0}")]
    NoSuchWindow(i32),
    #[error("extension context invalidated")]
    ContextInvalidated,
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// Tab and window control operations
pub trait BrowserTabs {
    /// Every live tab across all windows
    fn query_tabs(&self) -> LocalBoxFuture<'_, HostResult<Vec<BrowserTab>>>;

    fn get_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<BrowserTab>>;

    /// Make the tab the active one in its window
    fn activate_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>>;

    fn remove_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>>;

    fn focus_window(&self, window_id: i32) -> LocalBoxFuture<'_, HostResult<()>>;
}

/// Key-value storage area (chrome.storage.local)
pub trait StorageArea {
    /// Values for the requested keys; absent keys are simply missing from the map
    fn get(&self, keys: Vec<String>) -> LocalBoxFuture<'_, HostResult<HashMap<String, Value>>>;

    fn set(&self, items: HashMap<String, Value>) -> LocalBoxFuture<'_, HostResult<()>>;

    /// Bytes used by the given keys, or by the whole area when `keys` is `None`
    fn bytes_in_use(&self, keys: Option<Vec<String>>) -> LocalBoxFuture<'_, HostResult<u64>>;

    fn quota_bytes(&self) -> u64;
}

/// Single-threaded task spawning and timers
pub trait Scheduler {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;

    /// Give other queued tasks a chance to run
    fn yield_now(&self) -> LocalBoxFuture<'static, ()> {
        self.sleep(Duration::ZERO)
    }
}

/// Wall clock in milliseconds since the Unix epoch
pub trait Clock {
    fn now(&self) -> f64;
}

/// Receiver of browser lifecycle notifications
pub type EventSink = Rc<dyn Fn(BrowserEvent)>;

/// Source of browser lifecycle notifications
pub trait EventSource {
    /// Register the sink that receives every subsequent notification
    fn subscribe(&self, sink: EventSink);
}
