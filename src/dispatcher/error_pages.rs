use std::collections::HashMap;

use serde::Deserialize;

/// What an error page is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPageKey {
    /// A response status such as 404 or 500.
    Status(u16),
    /// A fault category as reported by [`UnitError::category`](crate::error::UnitError::category).
    Category(String),
    /// Anything not matched more specifically.
    Default,
}

/// Error-page table. Lookup order: category, then status, then default.
#[derive(Debug, Clone, Default)]
pub struct ErrorPages {
    by_status: HashMap<u16, String>,
    by_category: HashMap<String, String>,
    default: Option<String>,
}

impl ErrorPages {
    /// Map `key` to an application-relative location. Later entries for the
    /// same key replace earlier ones.
    pub fn insert(&mut self, key: ErrorPageKey, location: impl Into<String>) {
        let location = location.into();
        match key {
            ErrorPageKey::Status(status) => {
                self.by_status.insert(status, location);
            }
            ErrorPageKey::Category(category) => {
                self.by_category.insert(category, location);
            }
            ErrorPageKey::Default => self.default = Some(location),
        }
    }

    #[must_use]
    pub fn lookup(&self, category: Option<&str>, status: u16) -> Option<&str> {
        category
            .and_then(|c| self.by_category.get(c))
            .or_else(|| self.by_status.get(&status))
            .or(self.default.as_ref())
            .map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_status.is_empty() && self.by_category.is_empty() && self.default.is_none()
    }
}
