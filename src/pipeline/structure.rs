//! Structure analysis: one oracle call over every page.
//!
//! The reply classifies each page (cover / question / answer key) and lists
//! the booklets with their expected question counts. Nothing downstream can
//! run without it, so every failure here is fatal and there is no retry.

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::{ExtractError, OracleError, Stage};
use crate::oracle::{call_oracle, LabeledImage, Oracle, OracleRequest, OracleTask};
use crate::output::{Page, StructureResult};
use crate::pipeline::decode::{decode_structure, StructureDecodeError};
use crate::prompts::STRUCTURE_PROMPT;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on top-level questions per sent page. A booklet claiming more
/// than this times the page count has an unusable count.
pub const MAX_QUESTIONS_PER_PAGE: u32 = 40;

/// Run structure analysis over all page images.
pub async fn analyze_structure(
    oracle: &dyn Oracle,
    images: &[LabeledImage],
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<StructureResult, ExtractError> {
    if images.is_empty() {
        return Err(ExtractError::NoPages);
    }

    let req = OracleRequest::new(OracleTask::Structure, images.to_vec(), STRUCTURE_PROMPT);
    let raw = call_oracle(oracle, &req, Duration::from_secs(config.api_timeout_secs), cancel)
        .await
        .map_err(|e| match e {
            OracleError::Cancelled => ExtractError::Cancelled,
            other => ExtractError::Oracle {
                stage: Stage::Structure,
                source: other,
            },
        })?;

    let indices: Vec<usize> = images.iter().map(|i| i.page_index).collect();
    let structure = parse_structure(&raw, &indices, config)?;

    info!(
        "Structure: {} page(s), {} booklet(s), {} answer page(s), {} cover page(s)",
        structure.pages.len(),
        structure.booklets.len(),
        structure.answer_pages().len(),
        structure.cover_pages().len()
    );
    Ok(structure)
}

/// Decode a structure reply and reconcile it with the pages actually sent.
///
/// The result classifies every index in `sent` exactly once and names at
/// least one booklet whose first page was sent.
pub fn parse_structure(raw: &str, sent: &[usize], config: &ExtractionConfig) -> Result<StructureResult, ExtractError> {
    let mut structure = decode_structure(raw, &config.answer_separator).map_err(|e| match e {
        StructureDecodeError::NotJson(detail) => ExtractError::StructureUnparsable {
            detail,
            excerpt: config.excerpt(raw),
        },
        StructureDecodeError::MissingFields(fields) => ExtractError::StructureFieldsMissing {
            fields,
            excerpt: config.excerpt(raw),
        },
    })?;

    structure.pages = complete_pages(std::mem::take(&mut structure.pages), sent);

    let sent_set: HashSet<usize> = sent.iter().copied().collect();
    let before = structure.booklets.len();
    structure.booklets.retain(|b| {
        let keep = sent_set.contains(&b.first_question_page_index);
        if !keep {
            warn!(
                "Structure: booklet '{}' starts on page {} which was not sent; dropped",
                b.label, b.first_question_page_index
            );
        }
        keep
    });
    for (i, b) in structure.booklets.iter_mut().enumerate() {
        if b.label.trim().is_empty() {
            b.label = format!("Booklet {}", i + 1);
        }
    }
    dedupe_labels(&mut structure);
    bound_question_counts(&mut structure, sent.len());

    if structure.booklets.is_empty() {
        if before > 0 {
            warn!("Structure: all {} booklet(s) were unusable", before);
        }
        return Err(ExtractError::NoBooklets {
            excerpt: config.excerpt(raw),
        });
    }

    Ok(structure)
}

/// One classification per sent page, in ascending index order.
///
/// Entries for unknown pages are dropped, later duplicates are ignored, and
/// pages the oracle skipped are treated as question pages.
fn complete_pages(pages: Vec<Page>, sent: &[usize]) -> Vec<Page> {
    let sent_set: HashSet<usize> = sent.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(sent.len());

    for page in pages {
        if !sent_set.contains(&page.index) {
            warn!("Structure: classification for unknown page {} ignored", page.index);
            continue;
        }
        if !seen.insert(page.index) {
            warn!("Structure: duplicate classification for page {} ignored", page.index);
            continue;
        }
        out.push(page);
    }

    for &index in sent {
        if seen.insert(index) {
            warn!("Structure: page {} was not classified; assuming a question page", index);
            out.push(Page::question(index));
        }
    }

    out.sort_by_key(|p| p.index);
    out
}

/// Reset implausible expected counts to 0 ("unknown").
fn bound_question_counts(structure: &mut StructureResult, sent_pages: usize) {
    let cap = MAX_QUESTIONS_PER_PAGE.saturating_mul(u32::try_from(sent_pages).unwrap_or(u32::MAX));
    for b in &mut structure.booklets {
        if b.expected_question_count > cap {
            warn!(
                "Structure: booklet '{}' claims {} questions over {} page(s); count ignored",
                b.label, b.expected_question_count, sent_pages
            );
            b.expected_question_count = 0;
        }
    }
}

/// Booklet labels key the report and the answer context, so make them unique.
fn dedupe_labels(structure: &mut StructureResult) {
    let mut seen = HashSet::new();
    for b in &mut structure.booklets {
        if !seen.insert(b.label.clone()) {
            let mut n = 2;
            let renamed = loop {
                let candidate = format!("{} ({})", b.label, n);
                if !seen.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            };
            warn!("Structure: duplicate booklet label '{}' renamed to '{}'", b.label, renamed);
            seen.insert(renamed.clone());
            b.label = renamed;
        }
    }
}
