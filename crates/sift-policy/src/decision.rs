use std::sync::Arc;

use sift_observe::ContentClassifier;

use crate::options::{
    ProgramOptions, OPTION_REMOVE_ELEMENTS, OPTION_SCAN_TEXT_TRIGGERS, OPTION_USE_CLASSIFIER,
};
use crate::store::RuleStore;
use crate::triggers::TextTriggerStore;
use crate::{RequestContext, Verdict};

/// What the response phase has to do with a body before forwarding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInspection {
    pub scan_text: bool,
    pub rewrite_selectors: Vec<String>,
}

impl ResponseInspection {
    pub fn stream_through() -> Self {
        Self {
            scan_text: false,
            rewrite_selectors: Vec::new(),
        }
    }

    pub fn needs_body(&self) -> bool {
        self.scan_text || !self.rewrite_selectors.is_empty()
    }
}

/// Stateless combinator over the rule store, the trigger store, runtime
/// options and the optional embedder classifier. Sessions call it at the
/// request tap and again at the response tap.
pub struct DecisionEngine {
    rules: Arc<RuleStore>,
    triggers: Arc<TextTriggerStore>,
    options: Arc<ProgramOptions>,
    classifier: Option<Arc<dyn ContentClassifier>>,
}

impl DecisionEngine {
    pub fn new(
        rules: Arc<RuleStore>,
        triggers: Arc<TextTriggerStore>,
        options: Arc<ProgramOptions>,
        classifier: Option<Arc<dyn ContentClassifier>>,
    ) -> Self {
        Self {
            rules,
            triggers,
            options,
            classifier,
        }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn triggers(&self) -> &Arc<TextTriggerStore> {
        &self.triggers
    }

    pub fn options(&self) -> &Arc<ProgramOptions> {
        &self.options
    }

    pub fn decide_request(&self, ctx: &RequestContext) -> Verdict {
        self.rules.query_url(ctx)
    }

    /// Decide, from response headers alone, whether the body must be
    /// buffered for inspection. An `Allow` verdict at the request tap
    /// suppresses this entirely; callers skip the response tap in that case.
    pub fn response_inspection(&self, host: &str, content_type: &str) -> ResponseInspection {
        let textual = is_textual_content_type(content_type);
        if !textual {
            return ResponseInspection::stream_through();
        }

        let scan_text = (self.options.option_enabled(OPTION_SCAN_TEXT_TRIGGERS)
            && self.triggers.has_enabled_triggers())
            || (self.options.option_enabled(OPTION_USE_CLASSIFIER) && self.classifier.is_some());

        let rewrite_selectors = if is_html_content_type(content_type)
            && self.options.option_enabled(OPTION_REMOVE_ELEMENTS)
        {
            self.rules.query_element_selectors(host)
        } else {
            Vec::new()
        };

        ResponseInspection {
            scan_text,
            rewrite_selectors,
        }
    }

    /// Body-phase verdict: text triggers first, then the classifier. The
    /// classifier category must be non-zero and enabled to block.
    pub fn decide_response_body(&self, body: &[u8], content_type: &str) -> Verdict {
        if self.options.option_enabled(OPTION_SCAN_TEXT_TRIGGERS) {
            if let Some(category) = self.triggers.query_text(body) {
                return Verdict::Block(category);
            }
        }

        if self.options.option_enabled(OPTION_USE_CLASSIFIER)
            && is_textual_content_type(content_type)
        {
            if let Some(classifier) = &self.classifier {
                let category = classifier.classify(body, content_type);
                if category != 0 && self.options.category_enabled(category) {
                    return Verdict::Block(category);
                }
            }
        }

        Verdict::Pass
    }

    /// Whether a response for `host` could be filtered at all; sessions use
    /// this to force identity encoding on the upstream request.
    pub fn may_filter_response(&self, host: &str) -> bool {
        if self.options.option_enabled(OPTION_SCAN_TEXT_TRIGGERS)
            && self.triggers.has_enabled_triggers()
        {
            return true;
        }
        if self.options.option_enabled(OPTION_USE_CLASSIFIER) && self.classifier.is_some() {
            return true;
        }
        self.options.option_enabled(OPTION_REMOVE_ELEMENTS)
            && self.rules.has_element_selectors(host)
    }
}

pub fn is_textual_content_type(content_type: &str) -> bool {
    let mime = mime_essence(content_type);
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/javascript"
        || mime == "application/xml"
        || mime.ends_with("+xml")
        || mime.ends_with("+json")
}

pub fn is_html_content_type(content_type: &str) -> bool {
    mime_essence(content_type) == "text/html"
}

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sift_observe::ContentClassifier;

    use super::{is_html_content_type, is_textual_content_type, DecisionEngine};
    use crate::{
        ProgramOptions, RequestContext, RuleStore, TextTriggerStore, Verdict,
        OPTION_REMOVE_ELEMENTS, OPTION_SCAN_TEXT_TRIGGERS, OPTION_USE_CLASSIFIER,
    };

    struct FixedClassifier(u8);

    impl ContentClassifier for FixedClassifier {
        fn classify(&self, _body: &[u8], _content_type: &str) -> u8 {
            self.0
        }
    }

    fn engine_with(classifier: Option<Arc<dyn ContentClassifier>>) -> DecisionEngine {
        let options = Arc::new(ProgramOptions::new());
        options.set_category_enabled(1, true);
        options.set_category_enabled(2, true);
        options.set_option_enabled(OPTION_SCAN_TEXT_TRIGGERS, true);
        options.set_option_enabled(OPTION_REMOVE_ELEMENTS, true);
        options.set_option_enabled(OPTION_USE_CLASSIFIER, true);

        let rules = Arc::new(RuleStore::new(Arc::clone(&options)));
        let triggers = Arc::new(TextTriggerStore::new(Arc::clone(&options)));
        DecisionEngine::new(rules, triggers, options, classifier)
    }

    #[test]
    fn request_verdict_comes_from_the_rule_store() {
        let engine = engine_with(None);
        engine.rules().load_rules("||ads.example.com^\n", 1, true);

        let ctx = RequestContext::new("http://ads.example.com/banner.gif", "ads.example.com");
        assert_eq!(engine.decide_request(&ctx), Verdict::Block(1));
    }

    #[test]
    fn binary_responses_stream_without_inspection() {
        let engine = engine_with(Some(Arc::new(FixedClassifier(1))));
        engine.triggers().load_triggers("forbidden-phrase\n", 2, true);

        let inspection = engine.response_inspection("example.com", "application/octet-stream");
        assert!(!inspection.needs_body());
    }

    #[test]
    fn textual_response_with_triggers_needs_a_scan() {
        let engine = engine_with(None);
        engine.triggers().load_triggers("forbidden-phrase\n", 2, true);

        let inspection = engine.response_inspection("example.com", "text/plain; charset=utf-8");
        assert!(inspection.scan_text);
        assert!(inspection.rewrite_selectors.is_empty());
    }

    #[test]
    fn html_response_with_selectors_schedules_rewrite() {
        let engine = engine_with(None);
        engine
            .rules()
            .load_rules("example.com##.ad-slot\n", 1, true);

        let inspection = engine.response_inspection("example.com", "text/html");
        assert_eq!(inspection.rewrite_selectors, vec![".ad-slot".to_string()]);

        let disabled = engine.response_inspection("other.org", "text/html");
        assert!(disabled.rewrite_selectors.is_empty());
    }

    #[test]
    fn trigger_hit_blocks_with_trigger_category() {
        let engine = engine_with(None);
        engine.triggers().load_triggers("forbidden-phrase\n", 2, true);

        assert_eq!(
            engine.decide_response_body(b"... forbidden-phrase ...", "text/plain"),
            Verdict::Block(2)
        );
    }

    #[test]
    fn classifier_blocks_only_enabled_nonzero_categories() {
        let enabled = engine_with(Some(Arc::new(FixedClassifier(2))));
        assert_eq!(
            enabled.decide_response_body(b"text", "text/plain"),
            Verdict::Block(2)
        );

        let zero = engine_with(Some(Arc::new(FixedClassifier(0))));
        assert_eq!(zero.decide_response_body(b"text", "text/plain"), Verdict::Pass);

        let disabled_category = engine_with(Some(Arc::new(FixedClassifier(9))));
        assert_eq!(
            disabled_category.decide_response_body(b"text", "text/plain"),
            Verdict::Pass
        );
    }

    #[test]
    fn classifier_is_ignored_when_its_option_is_off() {
        let engine = engine_with(Some(Arc::new(FixedClassifier(2))));
        engine
            .options()
            .set_option_enabled(OPTION_USE_CLASSIFIER, false);
        assert_eq!(engine.decide_response_body(b"text", "text/plain"), Verdict::Pass);
    }

    #[test]
    fn may_filter_response_reflects_live_configuration() {
        let engine = engine_with(None);
        assert!(!engine.may_filter_response("example.com"));

        engine.triggers().load_triggers("forbidden-phrase\n", 2, true);
        assert!(engine.may_filter_response("example.com"));

        engine
            .options()
            .set_option_enabled(OPTION_SCAN_TEXT_TRIGGERS, false);
        assert!(!engine.may_filter_response("example.com"));
    }

    #[test]
    fn content_type_helpers_cover_parameters_and_suffixes() {
        assert!(is_textual_content_type("text/html; charset=utf-8"));
        assert!(is_textual_content_type("application/xhtml+xml"));
        assert!(is_textual_content_type("application/json"));
        assert!(!is_textual_content_type("image/png"));

        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(!is_html_content_type("text/plain"));
    }
}
