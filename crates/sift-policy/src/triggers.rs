use std::sync::{Arc, Mutex};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use arc_swap::ArcSwap;

use crate::options::ProgramOptions;

/// Triggers shorter than this are rejected at load; short fragments match
/// far too much text to be useful.
pub const MIN_TRIGGER_LEN: usize = 4;

#[derive(Default)]
struct TriggerIndex {
    matcher: Option<AhoCorasick>,
    patterns: Vec<String>,
    categories: Vec<u8>,
}

impl TriggerIndex {
    fn build(patterns: Vec<String>, categories: Vec<u8>) -> Option<Self> {
        if patterns.is_empty() {
            return Some(Self::default());
        }
        let matcher = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(&patterns)
            .ok()?;
        Some(Self {
            matcher: Some(matcher),
            patterns,
            categories,
        })
    }
}

/// Newline-delimited text triggers compiled into one multi-pattern matcher.
///
/// The automaton spans every category; enablement is checked per match at
/// query time so category toggles take effect without a rebuild. Rebuilds
/// happen on load/unload and publish a whole new index atomically.
pub struct TextTriggerStore {
    options: Arc<ProgramOptions>,
    index: ArcSwap<TriggerIndex>,
    writer: Mutex<()>,
}

impl TextTriggerStore {
    pub fn new(options: Arc<ProgramOptions>) -> Self {
        Self {
            options,
            index: ArcSwap::from_pointee(TriggerIndex::default()),
            writer: Mutex::new(()),
        }
    }

    /// Load one trigger per line from `source`. Blank lines are skipped, as
    /// are triggers below [`MIN_TRIGGER_LEN`] and duplicates already present
    /// for the same category. Returns the number of triggers installed.
    pub fn load_triggers(&self, source: &str, category: u8, flush_category_first: bool) -> u32 {
        if category == 0 {
            return 0;
        }

        let _writer = self
            .writer
            .lock()
            .expect("trigger store writer lock poisoned");
        let current = self.index.load_full();

        let mut patterns = Vec::new();
        let mut categories = Vec::new();
        for (pattern, &existing_category) in current.patterns.iter().zip(&current.categories) {
            if flush_category_first && existing_category == category {
                continue;
            }
            patterns.push(pattern.clone());
            categories.push(existing_category);
        }

        let mut loaded = 0_u32;
        for raw_line in source.split('\n') {
            let trigger = raw_line.trim_end_matches('\r').trim();
            if trigger.is_empty() || trigger.len() < MIN_TRIGGER_LEN {
                continue;
            }
            let duplicate = patterns
                .iter()
                .zip(&categories)
                .any(|(pattern, &cat)| cat == category && pattern == trigger);
            if duplicate {
                continue;
            }
            patterns.push(trigger.to_string());
            categories.push(category);
            loaded += 1;
        }

        match TriggerIndex::build(patterns, categories) {
            Some(next) => {
                self.index.store(Arc::new(next));
                loaded
            }
            None => 0,
        }
    }

    pub fn unload_triggers(&self, category: u8) {
        if category == 0 {
            return;
        }
        let _writer = self
            .writer
            .lock()
            .expect("trigger store writer lock poisoned");
        let current = self.index.load_full();

        let mut patterns = Vec::new();
        let mut categories = Vec::new();
        for (pattern, &existing_category) in current.patterns.iter().zip(&current.categories) {
            if existing_category == category {
                continue;
            }
            patterns.push(pattern.clone());
            categories.push(existing_category);
        }

        if let Some(next) = TriggerIndex::build(patterns, categories) {
            self.index.store(Arc::new(next));
        }
    }

    /// Scan `body` for any trigger in an enabled category; returns the
    /// lowest matching enabled category.
    pub fn query_text(&self, body: &[u8]) -> Option<u8> {
        let index = self.index.load_full();
        let matcher = index.matcher.as_ref()?;

        let mut lowest: Option<u8> = None;
        for hit in matcher.find_overlapping_iter(body) {
            let category = index.categories[hit.pattern().as_usize()];
            if !self.options.category_enabled(category) {
                continue;
            }
            lowest = Some(match lowest {
                Some(current) => current.min(category),
                None => category,
            });
            if lowest == Some(1) {
                break;
            }
        }
        lowest
    }

    /// Whether any trigger belongs to a currently enabled category; used to
    /// skip body buffering when a scan could never match.
    pub fn has_enabled_triggers(&self) -> bool {
        let index = self.index.load_full();
        index
            .categories
            .iter()
            .any(|&category| self.options.category_enabled(category))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TextTriggerStore;
    use crate::ProgramOptions;

    fn store_with_categories(enabled: &[u8]) -> TextTriggerStore {
        let options = Arc::new(ProgramOptions::new());
        for &category in enabled {
            options.set_category_enabled(category, true);
        }
        TextTriggerStore::new(options)
    }

    #[test]
    fn load_skips_blank_and_too_short_triggers() {
        let store = store_with_categories(&[2]);
        let loaded = store.load_triggers("forbidden-phrase\n\nab\nxyz\nanother trigger\n", 2, true);
        assert_eq!(loaded, 2);
    }

    #[test]
    fn query_matches_case_insensitively() {
        let store = store_with_categories(&[2]);
        store.load_triggers("forbidden-phrase\n", 2, true);

        assert_eq!(
            store.query_text(b"prefix FORBIDDEN-Phrase suffix"),
            Some(2)
        );
        assert_eq!(store.query_text(b"nothing to see"), None);
    }

    #[test]
    fn disabled_category_matches_are_invisible() {
        let store = store_with_categories(&[]);
        store.load_triggers("forbidden-phrase\n", 2, true);
        assert_eq!(store.query_text(b"forbidden-phrase"), None);
        assert!(!store.has_enabled_triggers());
    }

    #[test]
    fn lowest_enabled_category_wins() {
        let store = store_with_categories(&[3, 9]);
        store.load_triggers("zzz-word\n", 9, true);
        store.load_triggers("aaa-word\n", 3, true);

        assert_eq!(store.query_text(b"zzz-word then aaa-word"), Some(3));
    }

    #[test]
    fn flush_replaces_only_the_given_category() {
        let store = store_with_categories(&[1, 2]);
        store.load_triggers("keep-this-one\n", 1, true);
        store.load_triggers("drop-this-one\n", 2, true);
        store.load_triggers("fresh-trigger\n", 2, true);

        assert_eq!(store.query_text(b"keep-this-one"), Some(1));
        assert_eq!(store.query_text(b"drop-this-one"), None);
        assert_eq!(store.query_text(b"fresh-trigger"), Some(2));
    }

    #[test]
    fn unload_clears_one_category() {
        let store = store_with_categories(&[1, 2]);
        store.load_triggers("first-trigger\n", 1, true);
        store.load_triggers("second-trigger\n", 2, true);

        store.unload_triggers(1);
        assert_eq!(store.query_text(b"first-trigger"), None);
        assert_eq!(store.query_text(b"second-trigger"), Some(2));
    }

    #[test]
    fn duplicate_triggers_in_same_category_load_once() {
        let store = store_with_categories(&[1]);
        let loaded = store.load_triggers("same-trigger\nsame-trigger\n", 1, true);
        assert_eq!(loaded, 1);
    }
}
