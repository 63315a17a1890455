/// Tab list operations: display ordering, counting, search, duplicates
use std::collections::{BTreeMap, HashSet};

use crate::rules::RuleTable;
use crate::tab_data::TabRecord;

/// Order tabs by category (rule table order, unknown categories last),
/// then most recently accessed first
pub fn sort_for_display(tabs: &[TabRecord], table: &RuleTable) -> Vec<TabRecord> {
    let mut sorted = tabs.to_vec();
    sorted.sort_by(|a, b| {
        let rank_a = table.position(&a.category).unwrap_or(usize::MAX);
        let rank_b = table.position(&b.category).unwrap_or(usize::MAX);
        rank_a
            .cmp(&rank_b)
            .then_with(|| b.last_accessed.total_cmp(&a.last_accessed))
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

/// Number of tabs per category; every table category is present, even at zero
pub fn count_by_category(tabs: &[TabRecord], table: &RuleTable) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = table.names().map(|name| (name.to_string(), 0)).collect();
    for tab in tabs {
        *counts.entry(tab.category.clone()).or_insert(0) += 1;
    }
    counts
}

/// Tabs whose title, url or category contains every query term
pub fn search_tabs(tabs: &[TabRecord], query: &str) -> Vec<TabRecord> {
    let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return tabs.to_vec();
    }

    tabs.iter()
        .filter(|tab| {
            let haystack = format!("{} {} {}", tab.title, tab.url, tab.category).to_lowercase();
            terms.iter().all(|term| haystack.contains(term.as_str()))
        })
        .cloned()
        .collect()
}

/// Ids of tabs repeating an earlier tab's URL (oldest tab is kept)
pub fn find_duplicates(tabs: &[TabRecord]) -> Vec<i32> {
    let mut ordered: Vec<&TabRecord> = tabs.iter().collect();
    ordered.sort_by(|a, b| a.created_at.total_cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut seen_urls = HashSet::new();
    ordered
        .into_iter()
        .filter(|tab| !tab.url.is_empty() && !seen_urls.insert(tab.url.as_str()))
        .map(|tab| tab.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn tab(id: i32, url: &str, title: &str, category: &str, last_accessed: f64) -> TabRecord {
        TabRecord {
            created_at: id as f64,
            last_accessed,
            ..record(id, url, title, category)
        }
    }

    #[test]
    fn test_sort_for_display() {
        let table = RuleTable::builtin();
        let tabs = vec![
            tab(1, "https://a.com", "A", "other", 5.0),
            tab(2, "https://youtube.com", "YT", "entertainment", 1.0),
            tab(3, "https://github.com", "GH", "development", 1.0),
            tab(4, "https://gitlab.com", "GL", "development", 9.0),
            tab(5, "https://x.test", "X", "gone", 100.0),
        ];

        let ids: Vec<i32> = sort_for_display(&tabs, &table).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1, 5]);
    }

    #[test]
    fn test_count_by_category() {
        let table = RuleTable::builtin();
        let tabs = vec![
            tab(1, "https://a.com", "A", "news", 0.0),
            tab(2, "https://b.com", "B", "news", 0.0),
        ];

        let counts = count_by_category(&tabs, &table);
        assert_eq!(counts["news"], 2);
        assert_eq!(counts["shopping"], 0);
        assert_eq!(counts.len(), 8);
    }

    #[test]
    fn test_search_tabs() {
        let tabs = vec![
            tab(1, "https://github.com/rust-lang", "Rust repo", "development", 0.0),
            tab(2, "https://docs.rs/serde", "serde docs", "development", 0.0),
            tab(3, "https://youtube.com", "Rust talk", "entertainment", 0.0),
        ];

        let ids = |query: &str| search_tabs(&tabs, query).iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(ids("rust"), vec![1, 3]);
        assert_eq!(ids("RUST development"), vec![1]);
        assert_eq!(ids("   "), vec![1, 2, 3]);
        assert!(ids("nothing-matches").is_empty());
    }

    #[test]
    fn test_find_duplicates() {
        let tabs = vec![
            tab(3, "https://google.com", "Google 2", "other", 0.0),
            tab(1, "https://google.com", "Google 1", "other", 0.0),
            tab(2, "https://github.com", "GitHub", "development", 0.0),
            tab(4, "", "New Tab", "other", 0.0),
            tab(5, "", "New Tab", "other", 0.0),
        ];

        assert_eq!(find_duplicates(&tabs), vec![3]);
    }
}
