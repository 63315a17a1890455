/// Host capabilities over the extension APIs, through `background_bridge.js`
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use log::warn;
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use crate::background::{Background, Host};
use crate::config::Config;
use crate::events::{BrowserEvent, INSTALLED, RULES_CHANGED, SETTINGS_CHANGED, TABS_CHANGED};
use crate::host::{BrowserTabs, Clock, EventSink, EventSource, HostError, HostResult, Scheduler, StorageArea};
use crate::tab_data::BrowserTab;

#[wasm_bindgen(module = "/background_bridge.js")]
extern "C" {
    #[wasm_bindgen(catch)]
    async fn queryTabs() -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn getTab(tab_id: i32) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn activateTab(tab_id: i32) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn removeTab(tab_id: i32) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn focusWindow(window_id: i32) -> Result<(), JsValue>;

    fn hasStorage() -> bool;

    #[wasm_bindgen(catch)]
    async fn storageGet(keys: JsValue) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn storageSet(items: JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn storageBytesInUse(keys: JsValue) -> Result<JsValue, JsValue>;

    fn storageQuotaBytes() -> f64;

    #[wasm_bindgen(catch)]
    async fn sleepMs(ms: f64) -> Result<(), JsValue>;

    fn bindBrowserEvents(callback: &js_sys::Function);

    fn notifyUi(name: &str, payload: JsValue);
}

fn error_message(err: &JsValue) -> String {
    err.dyn_ref::<js_sys::Error>()
        .map(|e| String::from(e.message()))
        .or_else(|| err.as_string())
        .unwrap_or_else(|| format!("{:?}", err))
}

fn host_error(err: JsValue) -> HostError {
    let message = error_message(&err);
    if message.contains("Extension context invalidated") {
        HostError::ContextInvalidated
    } else {
        HostError::Failed(message)
    }
}

fn tab_error(tab_id: i32) -> impl Fn(JsValue) -> HostError {
    move |err| match host_error(err) {
        HostError::Failed(message) if message.starts_with("No tab with id") => HostError::NoSuchTab(tab_id),
        other => other,
    }
}

fn window_error(window_id: i32) -> impl Fn(JsValue) -> HostError {
    move |err| match host_error(err) {
        HostError::Failed(message) if message.starts_with("No window with id") => HostError::NoSuchWindow(window_id),
        other => other,
    }
}

/// Plain objects and arrays, never JS `Map`s
fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}

fn decode_error(e: serde_wasm_bindgen::Error) -> HostError {
    HostError::Failed(e.to_string())
}

pub struct ChromeTabs;

impl BrowserTabs for ChromeTabs {
    fn query_tabs(&self) -> LocalBoxFuture<'_, HostResult<Vec<BrowserTab>>> {
        Box::pin(async {
            let tabs = queryTabs().await.map_err(host_error)?;
            serde_wasm_bindgen::from_value(tabs).map_err(decode_error)
        })
    }

    fn get_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<BrowserTab>> {
        Box::pin(async move {
            let tab = getTab(tab_id).await.map_err(tab_error(tab_id))?;
            serde_wasm_bindgen::from_value(tab).map_err(decode_error)
        })
    }

    fn activate_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move { activateTab(tab_id).await.map_err(tab_error(tab_id)) })
    }

    fn remove_tab(&self, tab_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move { removeTab(tab_id).await.map_err(tab_error(tab_id)) })
    }

    fn focus_window(&self, window_id: i32) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move { focusWindow(window_id).await.map_err(window_error(window_id)) })
    }
}

/// chrome.storage.local
pub struct ChromeStorage;

impl StorageArea for ChromeStorage {
    fn get(&self, keys: Vec<String>) -> LocalBoxFuture<'_, HostResult<HashMap<String, Value>>> {
        Box::pin(async move {
            let keys = to_js(&keys).map_err(decode_error)?;
            let items = storageGet(keys).await.map_err(host_error)?;
            serde_wasm_bindgen::from_value(items).map_err(decode_error)
        })
    }

    fn set(&self, items: HashMap<String, Value>) -> LocalBoxFuture<'_, HostResult<()>> {
        Box::pin(async move {
            let items = to_js(&items).map_err(decode_error)?;
            storageSet(items).await.map_err(host_error)
        })
    }

    fn bytes_in_use(&self, keys: Option<Vec<String>>) -> LocalBoxFuture<'_, HostResult<u64>> {
        Box::pin(async move {
            let keys = match keys {
                Some(keys) => to_js(&keys).map_err(decode_error)?,
                None => JsValue::NULL,
            };
            let bytes = storageBytesInUse(keys).await.map_err(host_error)?;
            Ok(bytes.as_f64().unwrap_or(0.0) as u64)
        })
    }

    fn quota_bytes(&self) -> u64 {
        storageQuotaBytes() as u64
    }
}

pub struct WasmScheduler;

impl Scheduler for WasmScheduler {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        wasm_bindgen_futures::spawn_local(task);
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = sleepMs(duration.as_millis() as f64).await {
                warn!("Timer failed: {}", error_message(&e));
            }
        })
    }
}

pub struct WasmClock;

impl Clock for WasmClock {
    fn now(&self) -> f64 {
        js_sys::Date::now()
    }
}

/// Listeners registered by `bindBrowserEvents`
pub struct ChromeEvents;

impl EventSource for ChromeEvents {
    fn subscribe(&self, sink: EventSink) {
        let callback = Closure::<dyn FnMut(JsValue)>::new(move |raw: JsValue| {
            match serde_wasm_bindgen::from_value::<BrowserEvent>(raw) {
                Ok(event) => sink(event),
                Err(e) => warn!("Ignoring unrecognized browser event: {}", e),
            }
        });
        bindBrowserEvents(callback.as_ref().unchecked_ref());
        // Listeners stay registered for the life of the worker
        callback.forget();
    }
}

#[wasm_bindgen]
pub struct BackgroundHandle {
    inner: Rc<Background>,
}

#[wasm_bindgen]
impl BackgroundHandle {
    /// Resolves with the `{success, data?, error?, code?}` response envelope
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, message: JsValue) -> js_sys::Promise {
        let inner = Rc::clone(&self.inner);
        wasm_bindgen_futures::future_to_promise(async move {
            let raw: Value = serde_wasm_bindgen::from_value(message).unwrap_or(Value::Null);
            let response = inner.handle_message(raw).await;
            to_js(&response).map_err(JsValue::from)
        })
    }

    pub fn shutdown(&self) -> js_sys::Promise {
        let inner = Rc::clone(&self.inner);
        wasm_bindgen_futures::future_to_promise(async move {
            inner
                .shutdown()
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(|e| JsValue::from_str(&e.to_string()))
        })
    }
}

/// Start the background services with an optional config object
#[wasm_bindgen(js_name = startBackground)]
pub async fn start_background(config: JsValue) -> Result<BackgroundHandle, JsValue> {
    let config: Config = if config.is_undefined() || config.is_null() {
        Config::default()
    } else {
        serde_wasm_bindgen::from_value(config)?
    };

    let host = Host {
        browser: Rc::new(ChromeTabs),
        storage_area: hasStorage().then(|| Rc::new(ChromeStorage) as Rc<dyn StorageArea>),
        scheduler: Rc::new(WasmScheduler),
        clock: Rc::new(WasmClock),
        events: Rc::new(ChromeEvents),
    };
    let background = Background::start(host, config).await;

    let bus = background.bus();
    for name in [TABS_CHANGED, SETTINGS_CHANGED, RULES_CHANGED, INSTALLED] {
        bus.on(name, move |payload| match to_js(payload) {
            Ok(payload) => notifyUi(name, payload),
            Err(e) => warn!("Could not forward {}: {}", name, e),
        });
    }

    Ok(BackgroundHandle { inner: Rc::new(background) })
}
