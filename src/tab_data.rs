/// Data structures for Tab Sorter
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TabError};

/// Category assigned when nothing scores above the threshold
pub const OTHER_CATEGORY: &str = "other";

/// A tab as reported by the browser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrowserTab {
    pub id: i32,
    pub title: Option<String>,
    pub url: Option<String>,
    pub fav_icon_url: Option<String>,
    pub active: bool,
    pub pinned: bool,
    pub window_id: i32,
    pub status: Option<String>,
}

/// Tracked state of one tab, owned by the tab store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub id: i32,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    pub active: bool,
    pub pinned: bool,
    pub window_id: i32,
    pub created_at: f64,
    pub last_accessed: f64,
    pub access_count: u32,
    pub category: String,
}

impl TabRecord {
    /// Fresh record for a tab seen for the first time
    pub fn new(tab: &BrowserTab, category: String, now: f64) -> TabRecord {
        TabRecord {
            id: tab.id,
            title: tab.title.clone().unwrap_or_default(),
            url: tab.url.clone().unwrap_or_default(),
            fav_icon_url: tab.fav_icon_url.clone(),
            active: tab.active,
            pinned: tab.pinned,
            window_id: tab.window_id,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            category,
        }
    }

    /// Overwrite the content fields from a browser update.
    ///
    /// Returns true when the url or title changed.
    pub fn merge_content(&mut self, tab: &BrowserTab) -> bool {
        let mut changed = false;
        if let Some(title) = &tab.title {
            changed |= *title != self.title;
            self.title = title.clone();
        }
        if let Some(url) = &tab.url {
            changed |= *url != self.url;
            self.url = url.clone();
        }
        if tab.fav_icon_url.is_some() {
            self.fav_icon_url = tab.fav_icon_url.clone();
        }
        self.active = tab.active;
        self.pinned = tab.pinned;
        self.window_id = tab.window_id;
        changed
    }

    /// Record an access without ever moving `last_accessed` backwards
    pub fn touch(&mut self, now: f64) {
        self.last_accessed = self.last_accessed.max(now);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CategorizationMode {
    /// Domain and keyword scoring
    #[default]
    Auto,
    /// Hostname matches only
    Domain,
    /// No automatic categorization
    Manual,
}

/// User preferences, persisted as a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Settings {
    pub auto_organize: bool,
    pub show_notifications: bool,
    pub theme: Theme,
    pub categorization_mode: CategorizationMode,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            auto_organize: true,
            show_notifications: true,
            theme: Theme::default(),
            categorization_mode: CategorizationMode::default(),
        }
    }
}

impl Settings {
    /// Apply a partial settings object on top of these settings
    pub fn merged_with(&self, patch: &Value) -> Result<Settings> {
        let Value::Object(patch) = patch else {
            return Err(TabError::InvalidSettings("settings must be an object".to_string()));
        };

        let mut merged = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut merged {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged).map_err(|e| TabError::InvalidSettings(e.to_string()))
    }

    /// Read stored settings field by field over the defaults, skipping
    /// unknown keys and invalid values
    pub fn from_stored(stored: &Value) -> Settings {
        let mut settings = Settings::default();
        let Value::Object(fields) = stored else {
            warn!("Stored settings are not an object, using defaults");
            return settings;
        };

        for (key, value) in fields {
            let patch = Value::Object(Map::from_iter([(key.clone(), value.clone())]));
            match settings.merged_with(&patch) {
                Ok(merged) => settings = merged,
                Err(e) => warn!("Ignoring stored setting '{}': {}", key, e),
            }
        }
        settings
    }
}
