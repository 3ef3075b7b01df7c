mod decision;
mod options;
mod rules;
mod store;
mod triggers;

pub use decision::{
    is_html_content_type, is_textual_content_type, DecisionEngine, ResponseInspection,
};
pub use options::{
    ProgramOptions, CATEGORY_SLOT_COUNT, OPTION_BLOCK_ON_SCAN_OVERFLOW, OPTION_REMOVE_ELEMENTS,
    OPTION_SCAN_TEXT_TRIGGERS, OPTION_SLOT_COUNT, OPTION_USE_CLASSIFIER,
};
pub use rules::{
    infer_request_type, ElementRule, FilterRule, ParsedLine, PartyMask, RequestTypeMask,
    RuleParseError, RulePattern,
};
pub use store::RuleStore;
pub use triggers::{TextTriggerStore, MIN_TRIGGER_LEN};

/// Outcome of a filtering decision at a request or response tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No rule matched; the flow proceeds unfiltered.
    Pass,
    /// An allowlist rule matched; the flow proceeds and later taps are
    /// suppressed for this exchange.
    Allow,
    /// A block rule, trigger or classifier matched in the given category.
    Block(u8),
}

impl Verdict {
    pub fn is_block(self) -> bool {
        matches!(self, Verdict::Block(_))
    }
}

/// Per-request facts the decision engine evaluates rules against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Full request URL, scheme included.
    pub url: String,
    /// Request host, lowercased, no port.
    pub host: String,
    /// Host of the referring page, when the request carried a Referer.
    pub referer_host: Option<String>,
    pub method: String,
    pub request_type: RequestTypeMask,
    /// Set when the request host does not share a registrable suffix with
    /// the referring page.
    pub third_party: bool,
}

impl RequestContext {
    pub fn new(url: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
            referer_host: None,
            method: "GET".to_string(),
            request_type: RequestTypeMask::empty(),
            third_party: false,
        }
    }

    pub fn with_referer_host(mut self, referer_host: impl Into<String>) -> Self {
        self.referer_host = Some(referer_host.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_request_type(mut self, request_type: RequestTypeMask) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_third_party(mut self, third_party: bool) -> Self {
        self.third_party = third_party;
        self
    }
}
