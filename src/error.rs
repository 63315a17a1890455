/// Error taxonomy for Tab Sorter
use thiserror::Error;

use crate::host::HostError;

#[derive(Debug, Error)]
pub enum TabError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Failed to write '{key}' to storage: {reason}")]
    StorageWriteFailed { key: String, reason: String },

    #[error("A tab refresh is already in progress")]
    RefreshInProgress,

    #[error("Tab {0} not found")]
    TabNotFound(i32),

    #[error("Window {0} not found")]
    WindowNotFound(i32),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Browser call failed: {0}")]
    Browser(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TabError {
    /// Stable identifier sent to the UI alongside the display message
    pub fn code(&self) -> &'static str {
        match self {
            TabError::StorageUnavailable(_) => "storageUnavailable",
            TabError::StorageWriteFailed { .. } => "storageWriteFailed",
            TabError::RefreshInProgress => "refreshInProgress",
            TabError::TabNotFound(_) => "tabNotFound",
            TabError::WindowNotFound(_) => "windowNotFound",
            TabError::InvalidMessage(_) => "invalidMessage",
            TabError::InvalidRule(_) => "invalidRule",
            TabError::InvalidSettings(_) => "invalidSettings",
            TabError::Browser(_) => "browser",
            TabError::Serialization(_) => "serialization",
        }
    }
}

impl From<HostError> for TabError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NoSuchTab(id) => TabError::TabNotFound(id),
            HostError::NoSuchWindow(id) => TabError::WindowNotFound(id),
            HostError::Unavailable(msg) => TabError::StorageUnavailable(msg),
            HostError::ContextInvalidated => TabError::Browser(err.to_string()),
            HostError::Failed(msg) => TabError::Browser(msg),
        }
    }
}

pub type Result<T, E = TabError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_errors_map_to_not_found() {
        assert!(matches!(TabError::from(HostError::NoSuchTab(7)), TabError::TabNotFound(7)));
        assert!(matches!(TabError::from(HostError::NoSuchWindow(2)), TabError::WindowNotFound(2)));
        assert!(matches!(
            TabError::from(HostError::ContextInvalidated),
            TabError::Browser(_)
        ));
    }

    #[test]
    fn test_codes_and_messages() {
        let err = TabError::StorageWriteFailed {
            key: "tabs".to_string(),
            reason: "quota".to_string(),
        };
        assert_eq!(err.code(), "storageWriteFailed");
        assert_eq!(err.to_string(), "Failed to write 'tabs' to storage: quota");
        assert_eq!(TabError::TabNotFound(3).to_string(), "Tab 3 not found");
    }
}
