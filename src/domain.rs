/// Hostname and domain helpers used by categorization and stats
use std::collections::HashMap;

use url::Url;

/// Lower-cased hostname of a URL, or `None` if it does not parse or has no host
///
/// - https://www.github.com/rust → www.github.com
/// - chrome://newtab → newtab
/// - not a url → None
pub fn extract_hostname(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.').to_lowercase();
    if host.is_empty() { None } else { Some(host) }
}

/// Registrable domain of a URL with simple country-TLD handling
///
/// Two-letter TLDs preceded by "co" or "com" keep three labels:
/// - https://mail.google.com → google.com
/// - https://news.bbc.co.uk/article → bbc.co.uk
/// - http://localhost:3000 → localhost
pub fn extract_domain(url: &str) -> Option<String> {
    let hostname = extract_hostname(url)?;
    if hostname == "localhost" || is_ip_address(&hostname) {
        return Some(hostname);
    }

    let parts: Vec<&str> = hostname.split('.').collect();
    if parts.len() < 2 {
        return Some(hostname);
    }

    let tld = parts[parts.len() - 1];
    let num_parts = if parts.len() >= 3 && tld.len() == 2 && matches!(parts[parts.len() - 2], "co" | "com") {
        3
    } else {
        2
    };

    Some(parts[parts.len() - num_parts..].join("."))
}

fn is_ip_address(s: &str) -> bool {
    s.parse::<std::net::IpAddr>().is_ok() || (s.starts_with('[') && s.ends_with(']'))
}

/// Count registrable domains across a set of URLs, skipping unparsable ones
pub fn count_domains<'a>(urls: impl IntoIterator<Item = &'a str>) -> HashMap<String, usize> {
    urls.into_iter()
        .filter_map(extract_domain)
        .fold(HashMap::new(), |mut counts, domain| {
            *counts.entry(domain).or_insert(0) += 1;
            counts
        })
}

/// Top `n` domains by count, ties broken alphabetically
pub fn top_domains(counts: &HashMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut domains: Vec<(String, usize)> = counts
        .iter()
        .map(|(domain, count)| (domain.clone(), *count))
        .collect();

    domains.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    domains.truncate(n);
    domains
}
