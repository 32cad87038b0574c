//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline moves from structure analysis to per-booklet
//! extraction and answer extraction.
//!
//! Booklet tasks run concurrently, so every method may be called from
//! several tasks at once.
//!
//! # Example
//!
//! ```rust
//! use edgequake_exam2json::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     booklets_done: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_booklet_complete(&self, label: &str, questions_found: usize, issues: usize) {
//!         let done = self.booklets_done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{label}: {questions_found} questions, {issues} issue(s) [{done} done]");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { booklets_done: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(cb as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline at each stage boundary.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once, before the structure-analysis call is sent.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when structure analysis has succeeded.
    ///
    /// # Arguments
    /// * `booklets`     — number of booklets that will be extracted
    /// * `answer_pages` — number of answer-key pages
    fn on_structure_complete(&self, booklets: usize, answer_pages: usize) {
        let _ = (booklets, answer_pages);
    }

    /// Called just before a booklet's first extraction call.
    fn on_booklet_start(&self, label: &str, page_count: usize) {
        let _ = (label, page_count);
    }

    /// Called when a booklet failed validation and is being retried.
    fn on_booklet_retry(&self, label: &str, attempt: u32, issues: usize) {
        let _ = (label, attempt, issues);
    }

    /// Called when a booklet reaches its final state, valid or not.
    fn on_booklet_complete(&self, label: &str, questions_found: usize, issues: usize) {
        let _ = (label, questions_found, issues);
    }

    /// Called when answer extraction finishes. `problem` is set when the call
    /// failed or the reply could not be read.
    fn on_answers_complete(&self, answers_found: usize, problem: Option<&str>) {
        let _ = (answers_found, problem);
    }

    /// Called once after merging.
    fn on_extraction_complete(&self, questions_found: usize, issues: usize) {
        let _ = (questions_found, issues);
    }
}

/// No-op implementation used when the caller supplies no callback.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience type alias.
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExtractionProgressCallback for Recorder {
        fn on_booklet_start(&self, label: &str, page_count: usize) {
            self.events.lock().unwrap().push(format!("start {label} {page_count}"));
        }
        fn on_booklet_retry(&self, label: &str, attempt: u32, _issues: usize) {
            self.events.lock().unwrap().push(format!("retry {label} {attempt}"));
        }
    }

    #[test]
    fn defaults_are_noops() {
        let cb = NoopProgressCallback;
        cb.on_extraction_start(10);
        cb.on_structure_complete(2, 1);
        cb.on_booklet_start("A", 4);
        cb.on_booklet_retry("A", 1, 2);
        cb.on_booklet_complete("A", 8, 0);
        cb.on_answers_complete(8, None);
        cb.on_extraction_complete(8, 0);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();
        cb.on_booklet_start("Booklet A", 4);
        cb.on_booklet_retry("Booklet A", 1, 1);
        cb.on_booklet_complete("Booklet A", 4, 0);
        let events = rec.events.lock().unwrap();
        assert_eq!(*events, vec!["start Booklet A 4", "retry Booklet A 1"]);
    }
}
