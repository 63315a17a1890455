/// Rule-based tab categorization
///
/// Each category in the merged rule table is scored against a tab:
/// - hostname contains one of the category's domains: `weight * 2`
/// - keywords found in the url or title: `(matches / KEYWORD_THRESHOLD) * weight`
/// - tab accessed more than `FREQUENT_ACCESS_COUNT` times: flat `FREQUENT_ACCESS_BONUS`
///
/// The highest score wins (first in table order on ties) but only if it is
/// strictly above `MIN_SCORE_THRESHOLD`; otherwise the tab is "other".
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::domain::extract_hostname;
use crate::error::Result;
use crate::rules::{CategoryRule, RuleTable};
use crate::storage::Storage;
use crate::tab_data::{CategorizationMode, TabRecord, OTHER_CATEGORY};

pub const KEYWORD_THRESHOLD: f64 = 2.0;
pub const MIN_SCORE_THRESHOLD: f64 = 0.5;
pub const FREQUENT_ACCESS_COUNT: u32 = 3;
pub const FREQUENT_ACCESS_BONUS: f64 = 0.2;

/// What the scorer looks at
#[derive(Debug, Clone, Copy)]
pub struct CategorizeInput<'a> {
    pub url: Option<&'a str>,
    pub title: Option<&'a str>,
    pub access_count: u32,
}

impl<'a> CategorizeInput<'a> {
    pub fn new(url: Option<&'a str>, title: Option<&'a str>, access_count: u32) -> Self {
        CategorizeInput { url, title, access_count }
    }

    pub fn from_record(record: &'a TabRecord) -> Self {
        CategorizeInput {
            url: Some(&record.url),
            title: Some(&record.title),
            access_count: record.access_count,
        }
    }
}

/// Score one category for an already lower-cased url, title and hostname
fn score_rule(rule: &CategoryRule, hostname: &str, url: &str, title: &str, access_count: u32, mode: CategorizationMode) -> f64 {
    let mut score = 0.0;

    if rule.domains.iter().any(|domain| hostname.contains(domain.as_str())) {
        score += rule.weight * 2.0;
    }

    if mode != CategorizationMode::Domain {
        let matches = rule
            .keywords
            .iter()
            .filter(|keyword| url.contains(keyword.as_str()) || title.contains(keyword.as_str()))
            .count();
        score += (matches as f64 / KEYWORD_THRESHOLD) * rule.weight;
    }

    if access_count > FREQUENT_ACCESS_COUNT {
        score += FREQUENT_ACCESS_BONUS;
    }

    score
}

/// Pick the best category for a tab. Pure: same input and table, same answer.
pub fn categorize(input: &CategorizeInput, table: &RuleTable, mode: CategorizationMode) -> String {
    if mode == CategorizationMode::Manual {
        return OTHER_CATEGORY.to_string();
    }
    let (Some(url), Some(title)) = (input.url, input.title) else {
        return OTHER_CATEGORY.to_string();
    };
    let Some(hostname) = extract_hostname(url) else {
        return OTHER_CATEGORY.to_string();
    };

    let url = url.to_lowercase();
    let title = title.to_lowercase();

    let mut best: Option<(&str, f64)> = None;
    for rule in table.rules() {
        let score = score_rule(rule, &hostname, &url, &title, input.access_count, mode);
        // Strict comparison keeps the first category on ties
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((&rule.name, score));
        }
    }

    match best {
        Some((name, score)) if score > MIN_SCORE_THRESHOLD => name.to_string(),
        _ => OTHER_CATEGORY.to_string(),
    }
}

/// Holds the current merged rule table and categorization mode
///
/// Categorization is only as fresh as the last `reload`.
pub struct Categorizer {
    table: RefCell<Rc<RuleTable>>,
    mode: Cell<CategorizationMode>,
}

impl Categorizer {
    pub fn new() -> Self {
        Categorizer {
            table: RefCell::new(Rc::new(RuleTable::builtin())),
            mode: Cell::new(CategorizationMode::default()),
        }
    }

    /// Rebuild the merged table from persisted custom rules and settings
    pub async fn reload(&self, storage: &Storage) -> Result<()> {
        let custom = storage.get_category_rules().await?;
        let settings = storage.get_settings().await?;

        let table = RuleTable::merged(&custom);
        debug!(
            "Reloaded {} categories ({} custom), mode {:?}",
            table.rules().len(),
            custom.len(),
            settings.categorization_mode
        );
        *self.table.borrow_mut() = Rc::new(table);
        self.mode.set(settings.categorization_mode);
        Ok(())
    }

    pub fn table(&self) -> Rc<RuleTable> {
        Rc::clone(&self.table.borrow())
    }

    pub fn mode(&self) -> CategorizationMode {
        self.mode.get()
    }

    pub fn categorize(&self, input: &CategorizeInput) -> String {
        categorize(input, &self.table.borrow(), self.mode.get())
    }

    /// Whether a category name is known to the current table
    pub fn is_known(&self, category: &str) -> bool {
        category == OTHER_CATEGORY || self.table.borrow().contains(category)
    }
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new()
    }
}
