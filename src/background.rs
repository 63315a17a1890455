/// Composition root for the background worker
///
/// Opens storage (falling back to a cache-only adapter), loads rules and
/// the persisted tab mapping, binds the browser event dispatcher and hands
/// out the message router.
use std::rc::Rc;

use log::{info, warn};
use serde_json::Value;

use crate::categorizer::Categorizer;
use crate::config::Config;
use crate::error::{Result, TabError};
use crate::events::{EventBus, EventDispatcher};
use crate::host::{BrowserTabs, Clock, EventSource, Scheduler, StorageArea};
use crate::messages::{request_with_timeout, MessageRouter, Response};
use crate::storage::Storage;
use crate::tab_store::TabStore;

/// Host capabilities handed to the background at startup
pub struct Host {
    pub browser: Rc<dyn BrowserTabs>,
    /// `None` when the storage API is missing from the host
    pub storage_area: Option<Rc<dyn StorageArea>>,
    pub scheduler: Rc<dyn Scheduler>,
    pub clock: Rc<dyn Clock>,
    pub events: Rc<dyn EventSource>,
}

pub struct Background {
    storage: Rc<Storage>,
    tabs: Rc<TabStore>,
    bus: Rc<EventBus>,
    router: Rc<MessageRouter>,
    scheduler: Rc<dyn Scheduler>,
    config: Config,
}

impl Background {
    pub async fn start(host: Host, config: Config) -> Background {
        let storage = match Storage::open(
            host.storage_area,
            Rc::clone(&host.scheduler),
            Rc::clone(&host.clock),
            config.storage.clone(),
        )
        .await
        {
            Ok(storage) => storage,
            Err(e) => {
                warn!("{}; changes will not survive a restart", e);
                Storage::in_memory(Rc::clone(&host.scheduler), Rc::clone(&host.clock), config.storage.clone())
            }
        };

        let categorizer = Rc::new(Categorizer::new());
        if let Err(e) = categorizer.reload(&storage).await {
            warn!("Using built-in rules only: {}", e);
        }

        let tabs = Rc::new(TabStore::new(
            Rc::clone(&host.browser),
            Rc::clone(&storage),
            Rc::clone(&categorizer),
            Rc::clone(&host.scheduler),
            Rc::clone(&host.clock),
            config.tabs.clone(),
        ));
        match tabs.initialize().await {
            Ok(0) => match tabs.refresh_all().await {
                Ok(count) => info!("Nothing persisted, tracked {} live tabs", count),
                Err(TabError::RefreshInProgress) => {}
                Err(e) => warn!("Initial refresh failed: {}", e),
            },
            Ok(count) => info!("Restored {} tabs", count),
            Err(e) => warn!("Could not restore tabs: {}", e),
        }

        let bus = Rc::new(EventBus::new());
        let dispatcher = Rc::new(EventDispatcher::new(
            Rc::clone(&tabs),
            Rc::clone(&storage),
            Rc::clone(&categorizer),
            Rc::clone(&bus),
            Rc::clone(&host.scheduler),
        ));
        dispatcher.bind(host.events.as_ref());

        let router = Rc::new(MessageRouter::new(
            Rc::clone(&tabs),
            Rc::clone(&storage),
            categorizer,
            host.browser,
            Rc::clone(&bus),
        ));

        info!("Background started (persistent storage: {})", storage.is_persistent());
        Background {
            storage,
            tabs,
            bus,
            router,
            scheduler: host.scheduler,
            config,
        }
    }

    pub fn router(&self) -> Rc<MessageRouter> {
        Rc::clone(&self.router)
    }

    pub fn bus(&self) -> Rc<EventBus> {
        Rc::clone(&self.bus)
    }

    pub fn tabs(&self) -> Rc<TabStore> {
        Rc::clone(&self.tabs)
    }

    /// Answer one message from a UI context within the configured timeout
    pub async fn handle_message(&self, raw: Value) -> Response {
        request_with_timeout(&self.router, raw, self.scheduler.as_ref(), self.config.request_timeout()).await
    }

    /// Write out every pending debounced save
    pub async fn shutdown(&self) -> Result<()> {
        info!("Flushing pending saves");
        self.storage.flush_pending_saves().await
    }
}
