use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::options::ProgramOptions;
use crate::rules::{parse_rule_line, ElementRule, FilterRule, ParsedLine, RulePattern};
use crate::{RequestContext, Verdict};

/// Immutable rule snapshot for one category. Published as a whole behind an
/// atomic pointer; queries either see the previous or the next snapshot,
/// never a mixture.
#[derive(Debug, Default, Clone)]
struct CategoryRules {
    allow_by_host: HashMap<String, Vec<FilterRule>>,
    block_by_host: HashMap<String, Vec<FilterRule>>,
    allow_generic: Vec<FilterRule>,
    block_generic: Vec<FilterRule>,
    selectors_by_domain: HashMap<String, Vec<String>>,
    selectors_global: Vec<String>,
}

impl CategoryRules {
    fn is_empty(&self) -> bool {
        self.allow_by_host.is_empty()
            && self.block_by_host.is_empty()
            && self.allow_generic.is_empty()
            && self.block_generic.is_empty()
            && self.selectors_by_domain.is_empty()
            && self.selectors_global.is_empty()
    }

    fn insert_filter(&mut self, rule: FilterRule) {
        let (by_host, generic) = if rule.allow {
            (&mut self.allow_by_host, &mut self.allow_generic)
        } else {
            (&mut self.block_by_host, &mut self.block_generic)
        };
        match &rule.pattern {
            RulePattern::HostAnchor { host, .. } => {
                by_host.entry(host.clone()).or_default().push(rule);
            }
            _ => generic.push(rule),
        }
    }

    fn insert_element(&mut self, rule: ElementRule) {
        if rule.domains.is_empty() {
            self.selectors_global.push(rule.selector);
            return;
        }
        for domain in rule.domains {
            self.selectors_by_domain
                .entry(domain)
                .or_default()
                .push(rule.selector.clone());
        }
    }

    fn matches_allow(&self, ctx: &RequestContext, url_lower: &str) -> bool {
        bucket_chain_matches(&self.allow_by_host, ctx, url_lower)
            || self.allow_generic.iter().any(|rule| rule.matches(ctx, url_lower))
    }

    fn matches_block(&self, ctx: &RequestContext, url_lower: &str) -> bool {
        bucket_chain_matches(&self.block_by_host, ctx, url_lower)
            || self.block_generic.iter().any(|rule| rule.matches(ctx, url_lower))
    }
}

fn bucket_chain_matches(
    buckets: &HashMap<String, Vec<FilterRule>>,
    ctx: &RequestContext,
    url_lower: &str,
) -> bool {
    if buckets.is_empty() {
        return false;
    }
    host_suffixes(&ctx.host).any(|suffix| {
        buckets
            .get(suffix)
            .is_some_and(|rules| rules.iter().any(|rule| rule.matches(ctx, url_lower)))
    })
}

/// Iterate `a.b.example.com`, `b.example.com`, `example.com`, `com`.
fn host_suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(host), |current| {
        current.split_once('.').map(|(_, rest)| rest)
    })
}

/// Parsed filter rules and element selectors, bucketed per category.
///
/// Readers are lock-free: every query loads the current per-category snapshot
/// with an acquire load. Loads and unloads serialize on one writer mutex,
/// build the replacement snapshot off to the side and publish it atomically.
pub struct RuleStore {
    options: Arc<ProgramOptions>,
    categories: Vec<ArcSwap<CategoryRules>>,
    writer: Mutex<()>,
}

impl RuleStore {
    pub fn new(options: Arc<ProgramOptions>) -> Self {
        Self {
            options,
            categories: (0..=u8::MAX as usize)
                .map(|_| ArcSwap::from_pointee(CategoryRules::default()))
                .collect(),
            writer: Mutex::new(()),
        }
    }

    /// Parse `source` as Adblock-Plus lines and install the result for
    /// `category`. Returns `(loaded, failed)`; individual parse failures
    /// never abort the load. Category zero is reserved and loads nothing.
    pub fn load_rules(&self, source: &str, category: u8, flush_category_first: bool) -> (u32, u32) {
        if category == 0 {
            return (0, 0);
        }

        let _writer = self.writer.lock().expect("rule store writer lock poisoned");
        let mut next = if flush_category_first {
            CategoryRules::default()
        } else {
            (**self.categories[category as usize].load()).clone()
        };

        let mut loaded = 0_u32;
        let mut failed = 0_u32;
        for raw_line in source.split('\n') {
            let line = raw_line.trim_end_matches('\r');
            match parse_rule_line(line, category) {
                Ok(ParsedLine::Comment) => {}
                Ok(ParsedLine::Filter(rule)) => {
                    next.insert_filter(rule);
                    loaded += 1;
                }
                Ok(ParsedLine::Element(rule)) => {
                    next.insert_element(rule);
                    loaded += 1;
                }
                Err(_) => failed += 1,
            }
        }

        self.categories[category as usize].store(Arc::new(next));
        (loaded, failed)
    }

    pub fn unload_rules(&self, category: u8) {
        if category == 0 {
            return;
        }
        let _writer = self.writer.lock().expect("rule store writer lock poisoned");
        self.categories[category as usize].store(Arc::new(CategoryRules::default()));
    }

    /// Allowlist match in any enabled category wins; otherwise the block
    /// match with the lowest category number; otherwise `Pass`.
    pub fn query_url(&self, ctx: &RequestContext) -> Verdict {
        let url_lower = ctx.url.to_ascii_lowercase();

        let mut live: Vec<(u8, Arc<CategoryRules>)> = Vec::new();
        for category in 1..=u8::MAX {
            if !self.options.category_enabled(category) {
                continue;
            }
            let snapshot = self.categories[category as usize].load_full();
            if !snapshot.is_empty() {
                live.push((category, snapshot));
            }
        }

        for (_, snapshot) in &live {
            if snapshot.matches_allow(ctx, &url_lower) {
                return Verdict::Allow;
            }
        }
        for (category, snapshot) in &live {
            if snapshot.matches_block(ctx, &url_lower) {
                return Verdict::Block(*category);
            }
        }
        Verdict::Pass
    }

    /// Element selectors applicable to `host` across all enabled categories,
    /// deduplicated, global selectors included.
    pub fn query_element_selectors(&self, host: &str) -> Vec<String> {
        let host = host.to_ascii_lowercase();
        let mut selectors = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for category in 1..=u8::MAX {
            if !self.options.category_enabled(category) {
                continue;
            }
            let snapshot = self.categories[category as usize].load_full();
            for selector in &snapshot.selectors_global {
                if seen.insert(selector.clone()) {
                    selectors.push(selector.clone());
                }
            }
            if snapshot.selectors_by_domain.is_empty() {
                continue;
            }
            for suffix in host_suffixes(&host) {
                if let Some(domain_selectors) = snapshot.selectors_by_domain.get(suffix) {
                    for selector in domain_selectors {
                        if seen.insert(selector.clone()) {
                            selectors.push(selector.clone());
                        }
                    }
                }
            }
        }
        selectors
    }

    /// Cheap probe used to decide whether a response for `host` could need
    /// HTML rewriting at all.
    pub fn has_element_selectors(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        for category in 1..=u8::MAX {
            if !self.options.category_enabled(category) {
                continue;
            }
            let snapshot = self.categories[category as usize].load_full();
            if !snapshot.selectors_global.is_empty() {
                return true;
            }
            if snapshot.selectors_by_domain.is_empty() {
                continue;
            }
            if host_suffixes(&host).any(|suffix| snapshot.selectors_by_domain.contains_key(suffix))
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::RuleStore;
    use crate::{ProgramOptions, RequestContext, Verdict};

    fn store_with_categories(enabled: &[u8]) -> RuleStore {
        let options = Arc::new(ProgramOptions::new());
        for &category in enabled {
            options.set_category_enabled(category, true);
        }
        RuleStore::new(options)
    }

    fn ctx(url: &str, host: &str) -> RequestContext {
        RequestContext::new(url, host)
    }

    #[test]
    fn load_reports_loaded_and_failed_counts() {
        let store = store_with_categories(&[1]);
        let source = "! comment\n\n||ads.example.com^\n##.ad\n||bad.example.com^$bogusopt\n";
        let (loaded, failed) = store.load_rules(source, 1, true);
        assert_eq!(loaded, 2);
        assert_eq!(failed, 1);
    }

    #[test]
    fn category_zero_loads_nothing_and_never_matches() {
        let store = store_with_categories(&[]);
        let (loaded, failed) = store.load_rules("||ads.example.com^\n", 0, true);
        assert_eq!((loaded, failed), (0, 0));
        assert_eq!(
            store.query_url(&ctx("http://ads.example.com/x", "ads.example.com")),
            Verdict::Pass
        );
    }

    #[test]
    fn block_rule_matches_in_enabled_category_only() {
        let store = store_with_categories(&[1]);
        store.load_rules("||ads.example.com^\n", 2, true);
        assert_eq!(
            store.query_url(&ctx(
                "http://ads.example.com/banner.gif",
                "ads.example.com"
            )),
            Verdict::Pass
        );

        store.load_rules("||ads.example.com^\n", 1, true);
        assert_eq!(
            store.query_url(&ctx(
                "http://ads.example.com/banner.gif",
                "ads.example.com"
            )),
            Verdict::Block(1)
        );
    }

    #[test]
    fn allowlist_overrides_block_in_any_enabled_category() {
        let store = store_with_categories(&[1, 2]);
        store.load_rules("||example.com^\n", 1, true);
        store.load_rules("@@||example.com/allowed^\n", 2, true);

        assert_eq!(
            store.query_url(&ctx("http://example.com/allowed/x", "example.com")),
            Verdict::Allow
        );
        assert_eq!(
            store.query_url(&ctx("http://example.com/other", "example.com")),
            Verdict::Block(1)
        );
    }

    #[test]
    fn lowest_block_category_wins_for_reporting() {
        let store = store_with_categories(&[3, 7]);
        store.load_rules("||tracker.example.com^\n", 7, true);
        store.load_rules("/banner/\n", 3, true);

        assert_eq!(
            store.query_url(&ctx(
                "http://tracker.example.com/banner/x.gif",
                "tracker.example.com"
            )),
            Verdict::Block(3)
        );
    }

    #[test]
    fn unload_removes_only_the_given_category() {
        let store = store_with_categories(&[1, 2]);
        store.load_rules("||one.example.com^\n", 1, true);
        store.load_rules("||two.example.com^\n", 2, true);

        store.unload_rules(1);
        assert_eq!(
            store.query_url(&ctx("http://one.example.com/", "one.example.com")),
            Verdict::Pass
        );
        assert_eq!(
            store.query_url(&ctx("http://two.example.com/", "two.example.com")),
            Verdict::Block(2)
        );
    }

    #[test]
    fn append_load_keeps_existing_rules_when_not_flushing() {
        let store = store_with_categories(&[1]);
        store.load_rules("||one.example.com^\n", 1, true);
        store.load_rules("||two.example.com^\n", 1, false);

        assert_eq!(
            store.query_url(&ctx("http://one.example.com/", "one.example.com")),
            Verdict::Block(1)
        );
        assert_eq!(
            store.query_url(&ctx("http://two.example.com/", "two.example.com")),
            Verdict::Block(1)
        );
    }

    #[test]
    fn element_selectors_combine_domain_and_global_buckets() {
        let store = store_with_categories(&[1]);
        store.load_rules("##.ad-global\nexample.com##.ad-slot\n", 1, true);

        let selectors = store.query_element_selectors("www.example.com");
        assert!(selectors.contains(&".ad-global".to_string()));
        assert!(selectors.contains(&".ad-slot".to_string()));

        let elsewhere = store.query_element_selectors("other.org");
        assert_eq!(elsewhere, vec![".ad-global".to_string()]);
        assert!(store.has_element_selectors("sub.example.com"));
    }

    #[test]
    fn element_selectors_from_disabled_categories_are_invisible() {
        let store = store_with_categories(&[]);
        store.load_rules("example.com##.ad-slot\n", 1, true);
        assert!(store.query_element_selectors("example.com").is_empty());
        assert!(!store.has_element_selectors("example.com"));
    }

    #[test]
    fn concurrent_identical_queries_agree() {
        let store = Arc::new(store_with_categories(&[1]));
        store.load_rules("||ads.example.com^\n", 1, true);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.query_url(&RequestContext::new(
                    "http://ads.example.com/banner.gif",
                    "ads.example.com",
                ))
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().expect("query thread"), Verdict::Block(1));
        }
    }

    #[test]
    fn hot_reload_under_query_load_never_tears() {
        let store = Arc::new(store_with_categories(&[1]));
        store.load_rules("||ads.example.com^\n||track.example.com^\n", 1, true);

        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            handles.push(std::thread::spawn(move || {
                let ads = RequestContext::new("http://ads.example.com/x", "ads.example.com");
                while !stop.load(Ordering::Relaxed) {
                    // Every published snapshot either contains the rule or is
                    // empty; any other verdict would be a torn index.
                    let verdict = store.query_url(&ads);
                    assert!(
                        verdict == Verdict::Block(1) || verdict == Verdict::Pass,
                        "torn rule set observed: {verdict:?}"
                    );
                }
            }));
        }

        for _ in 0..200 {
            store.load_rules("", 1, true);
            store.load_rules("||ads.example.com^\n||track.example.com^\n", 1, true);
        }
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().expect("query thread");
        }

        store.load_rules("", 1, true);
        assert_eq!(
            store.query_url(&RequestContext::new(
                "http://ads.example.com/x",
                "ads.example.com"
            )),
            Verdict::Pass
        );
    }
}
