/// Category rule table: built-in defaults plus user-defined rules
///
/// The built-in layer is a constant. Custom rules live in storage under
/// `categoryRules` and are merged on top whenever the table is rebuilt; the
/// merge never touches the built-in layer.
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TabError};
use crate::tab_data::OTHER_CATEGORY;

/// Weight given to a category that only exists in the custom layer
pub const CUSTOM_CATEGORY_WEIGHT: f64 = 0.6;

const MAX_KEYWORD_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;

struct BuiltinRule {
    name: &'static str,
    weight: f64,
    domains: &'static [&'static str],
    keywords: &'static [&'static str],
}

// Declaration order is the tie-break order when two categories score the same.
const BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        name: "development",
        weight: 1.0,
        domains: &[
            "github.com",
            "gitlab.com",
            "bitbucket.org",
            "stackoverflow.com",
            "stackexchange.com",
            "developer.mozilla.org",
            "npmjs.com",
            "crates.io",
            "docs.rs",
            "pypi.org",
            "codepen.io",
            "codesandbox.io",
            "replit.com",
            "vercel.com",
            "netlify.com",
        ],
        keywords: &[
            "github",
            "gitlab",
            "code",
            "programming",
            "developer",
            "api",
            "documentation",
            "tutorial",
            "debug",
            "repository",
            "javascript",
            "python",
            "rust",
            "compiler",
        ],
    },
    BuiltinRule {
        name: "social",
        weight: 0.9,
        domains: &[
            "facebook.com",
            "twitter.com",
            "instagram.com",
            "linkedin.com",
            "reddit.com",
            "tiktok.com",
            "mastodon.social",
            "discord.com",
            "threads.net",
        ],
        keywords: &[
            "social",
            "friends",
            "followers",
            "tweet",
            "post",
            "share",
            "community",
            "chat",
            "messenger",
        ],
    },
    BuiltinRule {
        name: "productivity",
        weight: 0.8,
        domains: &[
            "docs.google.com",
            "drive.google.com",
            "mail.google.com",
            "calendar.google.com",
            "notion.so",
            "trello.com",
            "asana.com",
            "slack.com",
            "office.com",
            "outlook.live.com",
            "dropbox.com",
            "evernote.com",
            "todoist.com",
            "airtable.com",
            "figma.com",
        ],
        keywords: &[
            "email",
            "calendar",
            "document",
            "spreadsheet",
            "notes",
            "task",
            "project",
            "meeting",
            "inbox",
            "todo",
        ],
    },
    BuiltinRule {
        name: "entertainment",
        weight: 0.7,
        domains: &[
            "youtube.com",
            "netflix.com",
            "twitch.tv",
            "spotify.com",
            "hulu.com",
            "disneyplus.com",
            "primevideo.com",
            "soundcloud.com",
            "imdb.com",
            "vimeo.com",
        ],
        keywords: &[
            "video", "music", "movie", "watch", "stream", "game", "podcast", "episode", "playlist",
        ],
    },
    BuiltinRule {
        name: "shopping",
        weight: 0.6,
        domains: &[
            "amazon.com",
            "amazon.co.uk",
            "ebay.com",
            "etsy.com",
            "walmart.com",
            "target.com",
            "bestbuy.com",
            "aliexpress.com",
            "shopify.com",
        ],
        keywords: &[
            "shop", "cart", "checkout", "price", "deal", "sale", "order", "product", "buy",
        ],
    },
    BuiltinRule {
        name: "news",
        weight: 0.6,
        domains: &[
            "cnn.com",
            "bbc.com",
            "bbc.co.uk",
            "nytimes.com",
            "theguardian.com",
            "reuters.com",
            "apnews.com",
            "washingtonpost.com",
            "bloomberg.com",
            "news.ycombinator.com",
            "npr.org",
        ],
        keywords: &[
            "news", "breaking", "headline", "article", "politics", "world", "report", "weather",
        ],
    },
    BuiltinRule {
        name: "reference",
        weight: 0.6,
        domains: &[
            "wikipedia.org",
            "wiktionary.org",
            "britannica.com",
            "dictionary.com",
            "merriam-webster.com",
            "scholar.google.com",
            "arxiv.org",
            "quora.com",
        ],
        keywords: &[
            "wiki",
            "dictionary",
            "definition",
            "encyclopedia",
            "research",
            "paper",
            "learn",
            "guide",
        ],
    },
    BuiltinRule {
        name: OTHER_CATEGORY,
        weight: 0.1,
        domains: &[],
        keywords: &[],
    },
];

static CATEGORY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("valid category pattern"));

static DOMAIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9.])?$").expect("valid domain pattern"));

/// Matching criteria for one category
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRule {
    pub name: String,
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
    pub weight: f64,
}

/// User-defined additions for one category, as persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl RuleSet {
    fn values_mut(&mut self, kind: RuleKind) -> &mut Vec<String> {
        match kind {
            RuleKind::Domain => &mut self.domains,
            RuleKind::Keyword => &mut self.keywords,
        }
    }

    fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.keywords.is_empty()
    }
}

/// Custom rules keyed by category name
pub type CustomRules = BTreeMap<String, RuleSet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Domain,
    Keyword,
}

/// Read-only merged view of built-in and custom rules, in evaluation order
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable {
    rules: Vec<CategoryRule>,
}

impl RuleTable {
    pub fn builtin() -> RuleTable {
        Self::merged(&CustomRules::new())
    }

    /// Built-in categories first in declared order, then custom-only
    /// categories in name order. Custom values are appended to the
    /// built-in lists of the same category.
    pub fn merged(custom: &CustomRules) -> RuleTable {
        let mut rules: Vec<CategoryRule> = BUILTIN_RULES
            .iter()
            .map(|builtin| CategoryRule {
                name: builtin.name.to_string(),
                domains: builtin.domains.iter().map(|d| d.to_string()).collect(),
                keywords: builtin.keywords.iter().map(|k| k.to_string()).collect(),
                weight: builtin.weight,
            })
            .collect();

        for (name, extra) in custom {
            match rules.iter_mut().find(|rule| rule.name == *name) {
                Some(rule) => {
                    rule.domains.extend(extra.domains.iter().cloned());
                    rule.keywords.extend(extra.keywords.iter().cloned());
                }
                None => rules.push(CategoryRule {
                    name: name.clone(),
                    domains: extra.domains.clone(),
                    keywords: extra.keywords.clone(),
                    weight: CUSTOM_CATEGORY_WEIGHT,
                }),
            }
        }

        RuleTable { rules }
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|rule| rule.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name.as_str())
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Normalize and check a category name
pub fn validate_category(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if CATEGORY_PATTERN.is_match(&name) {
        Ok(name)
    } else {
        Err(TabError::InvalidRule(format!(
            "category '{}' must start with a letter and contain only letters, digits, '-' or '_' (max 32)",
            name
        )))
    }
}

/// Normalize and check a single domain or keyword value
pub fn normalize_value(kind: RuleKind, value: &str) -> Result<String> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return Err(TabError::InvalidRule("rule value cannot be empty".to_string()));
    }

    match kind {
        RuleKind::Domain => {
            // Accept a pasted URL and keep only its host part
            let host = value
                .split("://")
                .last()
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default()
                .to_string();
            if host.len() > MAX_DOMAIN_LEN || !DOMAIN_PATTERN.is_match(&host) {
                return Err(TabError::InvalidRule(format!("'{}' is not a valid domain", value)));
            }
            Ok(host)
        }
        RuleKind::Keyword => {
            if value.chars().count() > MAX_KEYWORD_LEN || value.chars().any(char::is_control) {
                return Err(TabError::InvalidRule(format!(
                    "keyword must be at most {} printable characters",
                    MAX_KEYWORD_LEN
                )));
            }
            Ok(value)
        }
    }
}

/// Validate a whole custom rule mapping, returning its normalized form
pub fn validate_custom_rules(rules: &CustomRules) -> Result<CustomRules> {
    let mut normalized = CustomRules::new();
    for (category, set) in rules {
        let category = validate_category(category)?;
        let entry = normalized.entry(category).or_default();
        for domain in &set.domains {
            push_unique(&mut entry.domains, normalize_value(RuleKind::Domain, domain)?);
        }
        for keyword in &set.keywords {
            push_unique(&mut entry.keywords, normalize_value(RuleKind::Keyword, keyword)?);
        }
    }
    Ok(normalized)
}

/// Add one value to a category. Returns false if it was already present.
pub fn add_rule(rules: &mut CustomRules, category: &str, kind: RuleKind, value: &str) -> Result<bool> {
    let category = validate_category(category)?;
    let value = normalize_value(kind, value)?;
    Ok(push_unique(rules.entry(category).or_default().values_mut(kind), value))
}

/// Remove one value from a category, dropping the category once it is empty.
/// Returns false if nothing matched.
pub fn remove_rule(rules: &mut CustomRules, category: &str, kind: RuleKind, value: &str) -> bool {
    let category = category.trim().to_lowercase();
    let value = value.trim().to_lowercase();

    let Some(set) = rules.get_mut(&category) else {
        return false;
    };
    let values = set.values_mut(kind);
    let before = values.len();
    values.retain(|existing| *existing != value);
    let removed = values.len() < before;

    if set.is_empty() {
        rules.remove(&category);
    }
    removed
}

fn push_unique(values: &mut Vec<String>, value: String) -> bool {
    if values.contains(&value) {
        false
    } else {
        values.push(value);
        true
    }
}
