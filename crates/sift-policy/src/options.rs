use std::sync::atomic::{AtomicBool, Ordering};

pub const OPTION_SLOT_COUNT: usize = 64;
pub const CATEGORY_SLOT_COUNT: usize = 256;

/// Body exceeding the scan cap is blocked instead of streamed unfiltered.
pub const OPTION_BLOCK_ON_SCAN_OVERFLOW: u32 = 0;
/// CSS-selector element removal runs on HTML responses.
pub const OPTION_REMOVE_ELEMENTS: u32 = 1;
/// Text trigger scanning runs on textual response bodies.
pub const OPTION_SCAN_TEXT_TRIGGERS: u32 = 2;
/// The embedder classifier callback is consulted for textual content.
pub const OPTION_USE_CLASSIFIER: u32 = 3;

/// Program-wide runtime toggles and per-category enablement.
///
/// Both spaces are flat arrays of atomics; single reads and writes suffice
/// and changes are visible at the next check performed anywhere in the
/// engine. Out-of-range writes are dropped, out-of-range reads return false,
/// and category zero is reserved as "never filter".
#[derive(Debug)]
pub struct ProgramOptions {
    options: [AtomicBool; OPTION_SLOT_COUNT],
    categories: [AtomicBool; CATEGORY_SLOT_COUNT],
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramOptions {
    pub fn new() -> Self {
        Self {
            options: std::array::from_fn(|_| AtomicBool::new(false)),
            categories: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    pub fn set_option_enabled(&self, option: u32, enabled: bool) {
        if let Some(slot) = self.options.get(option as usize) {
            slot.store(enabled, Ordering::Relaxed);
        }
    }

    pub fn option_enabled(&self, option: u32) -> bool {
        self.options
            .get(option as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn set_category_enabled(&self, category: u8, enabled: bool) {
        if category == 0 {
            return;
        }
        self.categories[category as usize].store(enabled, Ordering::Relaxed);
    }

    pub fn category_enabled(&self, category: u8) -> bool {
        if category == 0 {
            return false;
        }
        self.categories[category as usize].load(Ordering::Relaxed)
    }
}
