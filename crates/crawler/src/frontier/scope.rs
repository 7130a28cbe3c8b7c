//! Crawl scope: which hosts the frontier will accept URLs for.

use std::collections::HashSet;

use url::Url;

/// Host-based scope derived from the crawl's seed URLs.
///
/// An empty scope accepts everything, so a job without seeds degrades to
/// an unrestricted crawl rather than a silent no-op.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    hosts: HashSet<String>,
}

impl Scope {
    pub fn from_seeds<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scope = Scope::default();
        for seed in seeds {
            scope.add(seed.as_ref());
        }
        scope
    }

    pub fn add(&mut self, seed: &str) {
        if let Some(host) = host_of(seed) {
            self.hosts.insert(host);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn in_scope(&self, candidate: &str) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        match host_of(candidate) {
            Some(host) => self.hosts.contains(&host),
            None => false,
        }
    }
}

fn host_of(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

/// True when `candidate` is the same document as `current` and differs
/// only by its fragment.
pub fn is_inner_page_link(current: &str, candidate: &str) -> bool {
    let (Ok(mut cur), Ok(mut cand)) = (Url::parse(current), Url::parse(candidate)) else {
        return false;
    };
    if cand.fragment().is_none() {
        return false;
    }
    cur.set_fragment(None);
    cand.set_fragment(None);
    cur == cand
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scope_accepts_everything() {
        let scope = Scope::default();
        assert!(scope.in_scope("http://anything.test/page"));
    }

    #[test]
    fn scope_matches_by_host() {
        let scope = Scope::from_seeds(["http://example.test/start"]);
        assert!(scope.in_scope("https://example.test/other"));
        assert!(!scope.in_scope("http://elsewhere.test/"));
        assert!(!scope.in_scope("not a url"));
    }

    #[test]
    fn host_comparison_ignores_case() {
        let scope = Scope::from_seeds(["http://Example.TEST/"]);
        assert!(scope.in_scope("http://example.test/a"));
    }

    #[test]
    fn fragment_only_links_are_inner() {
        assert!(is_inner_page_link(
            "http://a.test/page",
            "http://a.test/page#section"
        ));
        assert!(!is_inner_page_link(
            "http://a.test/page",
            "http://a.test/other#section"
        ));
        assert!(!is_inner_page_link(
            "http://a.test/page",
            "http://a.test/page"
        ));
    }
}
