//! Pipeline stages for exam-paper extraction.
//!
//! Each submodule implements exactly one step; [`crate::extract`] sequences
//! them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ encode ──▶ structure ──▶ partition ──┬─▶ questions ×N ─┬─▶ merge
//! (files)   (base64)    (1 call)      (pure)      └─▶ answers ──────┘
//! ```
//!
//! 1. [`input`]     — load page images from files, directories or URLs
//! 2. [`encode`]    — sniff the format, downscale, base64-wrap for the provider
//! 3. [`structure`] — classify pages and find booklets; fatal on failure
//! 4. [`partition`] — booklet page ranges and first question numbers
//! 5. [`questions`] — per-booklet boundaries with validation and bounded retry
//! 6. [`answers`]   — the answer key, concurrently with step 5
//! 7. [`merge`]     — one page list with no page lost, plus the report
//!
//! Supporting modules: [`sanitize`] and [`decode`] turn raw replies into
//! typed values, [`remap`] fixes page-index drift, [`validate`] checks
//! numbering, and [`single`] re-extracts one question or answer.

pub mod answers;
pub mod decode;
pub mod encode;
pub mod input;
pub mod merge;
pub mod partition;
pub mod questions;
pub mod remap;
pub mod sanitize;
pub mod single;
pub mod structure;
pub mod validate;
