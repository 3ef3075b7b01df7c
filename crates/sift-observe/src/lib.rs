use std::sync::Mutex;

/// Callback surface the engine reports through.
///
/// Implementations must be cheap and non-blocking; every method is invoked
/// from worker tasks while traffic is in flight. All methods default to
/// no-ops so embedders implement only what they consume.
pub trait EventReporter: Send + Sync {
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}

    /// A request or response was suppressed by policy. `payload_size_hint`
    /// is the byte count the client would otherwise have received, when
    /// known (from Content-Length or a buffered body), and zero otherwise.
    fn request_blocked(&self, _category: u8, _payload_size_hint: u64, _url: &str) {}

    /// `removed` HTML subtrees were stripped from the response for `url`.
    fn elements_blocked(&self, _removed: u32, _url: &str) {}
}

/// Optional textual-content classifier.
///
/// Returns the category the payload belongs to, or zero for "no category".
/// Treated as opaque and potentially slow; the engine only invokes it for
/// textual content after header filtering passed, under a byte cap.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, body: &[u8], content_type: &str) -> u8;
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl EventReporter for NoopReporter {}

/// Reporter that records every callback invocation; test support for the
/// engine crates.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<ReportedEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedEvent {
    Info(String),
    Warn(String),
    Error(String),
    RequestBlocked {
        category: u8,
        payload_size_hint: u64,
        url: String,
    },
    ElementsBlocked {
        removed: u32,
        url: String,
    },
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<ReportedEvent> {
        std::mem::take(&mut self.records.lock().expect("reporter lock poisoned"))
    }

    pub fn snapshot(&self) -> Vec<ReportedEvent> {
        self.records.lock().expect("reporter lock poisoned").clone()
    }

    fn push(&self, event: ReportedEvent) {
        self.records
            .lock()
            .expect("reporter lock poisoned")
            .push(event);
    }
}

impl EventReporter for RecordingReporter {
    fn info(&self, message: &str) {
        self.push(ReportedEvent::Info(message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.push(ReportedEvent::Warn(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(ReportedEvent::Error(message.to_string()));
    }

    fn request_blocked(&self, category: u8, payload_size_hint: u64, url: &str) {
        self.push(ReportedEvent::RequestBlocked {
            category,
            payload_size_hint,
            url: url.to_string(),
        });
    }

    fn elements_blocked(&self, removed: u32, url: &str) {
        self.push(ReportedEvent::ElementsBlocked {
            removed,
            url: url.to_string(),
        });
    }
}
