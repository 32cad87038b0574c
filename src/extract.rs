//! Top-level extraction entry points.
//!
//! Structure analysis runs first and blocks everything else. Booklet
//! extraction (bounded by `concurrency`) and answer extraction then run
//! concurrently; each booklet runs in its own spawned task so a panic or
//! failure in one booklet cannot take down its siblings. Results are joined
//! and merged into a single [`ExtractionOutput`].

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::oracle::{resolve_oracle, LabeledImage};
use crate::output::{AnswerEntry, ExtractionOutput, ExtractionStats, Question};
use crate::pipeline::answers::{answer_context, extract_answers, AnswerOutcome};
use crate::pipeline::input::{load_pages, PageImage};
use crate::pipeline::merge::merge;
use crate::pipeline::partition::partition;
use crate::pipeline::questions::{extract_booklet, BookletOutcome};
use crate::pipeline::single::{self, QuestionContext};
use crate::pipeline::{encode, structure};
use edgequake_llm::ImageData;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Extract questions and answers from page images.
///
/// # Returns
/// `Ok(ExtractionOutput)` whenever structure analysis succeeds, even if some
/// booklets came back incomplete (check `output.report`).
///
/// # Errors
/// Returns `Err(ExtractError)` only for fatal errors:
/// - no pages, or a page that is not a supported image
/// - no oracle / provider could be configured
/// - structure analysis failed or found no booklets
pub async fn extract(pages: &[PageImage], config: &ExtractionConfig) -> Result<ExtractionOutput, ExtractError> {
    extract_with_cancel(pages, config, &CancelToken::new()).await
}

/// [`extract`] with a caller-owned cancellation token.
///
/// Cancelling makes every in-flight oracle call return promptly; the run
/// then ends with [`ExtractError::Cancelled`].
pub async fn extract_with_cancel(
    pages: &[PageImage],
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, ExtractError> {
    if pages.is_empty() {
        return Err(ExtractError::NoPages);
    }
    let images = pages
        .iter()
        .map(|p| encode::encode_page(p, config.max_image_pixels))
        .collect::<Result<Vec<_>, _>>()?;
    extract_encoded(images, config, cancel).await
}

/// Run the pipeline over already-encoded images. Page `i` of the document is
/// `images[i]`.
pub async fn extract_encoded(
    images: Vec<ImageData>,
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, ExtractError> {
    let total_start = Instant::now();
    if images.is_empty() {
        return Err(ExtractError::NoPages);
    }
    let total_pages = images.len();
    let oracle = resolve_oracle(config)?;
    info!("Starting extraction: {} page(s) via {}", total_pages, oracle.name());

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_start(total_pages);
    }

    let labeled: Vec<LabeledImage> = images
        .into_iter()
        .enumerate()
        .map(|(page_index, image)| LabeledImage { page_index, image })
        .collect();

    // ── Step 1: Structure analysis (blocking prerequisite) ───────────────
    let structure_start = Instant::now();
    let structure = structure::analyze_structure(oracle.as_ref(), &labeled, config, cancel).await?;
    let structure_duration_ms = structure_start.elapsed().as_millis() as u64;

    // ── Step 2: Partition ────────────────────────────────────────────────
    let partition = partition(&structure);
    let answer_pages = structure.answer_pages();
    if !partition.unassigned.is_empty() {
        warn!(
            "Pages {:?} lie outside every booklet and will have no questions",
            partition.unassigned
        );
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_structure_complete(partition.plans.len(), answer_pages.len());
    }

    let by_index: HashMap<usize, LabeledImage> = labeled.into_iter().map(|l| (l.page_index, l)).collect();
    let pick = |indices: &[usize]| -> Vec<LabeledImage> {
        indices.iter().filter_map(|i| by_index.get(i).cloned()).collect()
    };

    // ── Step 3: Booklets and answers, concurrently ───────────────────────
    let extraction_start = Instant::now();

    let booklets = stream::iter(partition.plans.iter().cloned().map(|plan| {
        let oracle = Arc::clone(&oracle);
        let config = config.clone();
        let cancel = cancel.clone();
        let images = pick(&plan.page_indices);
        async move {
            let label = plan.label().to_string();
            let task = tokio::spawn(async move {
                extract_booklet(oracle.as_ref(), &plan, images, &config, &cancel).await
            });
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Booklet '{}': task failed: {}", label, e);
                    BookletOutcome::failed(&label, format!("booklet task failed: {e}"))
                }
            }
        }
    }))
    .buffer_unordered(config.concurrency)
    .collect::<Vec<BookletOutcome>>();

    let answers = {
        let oracle = Arc::clone(&oracle);
        let config = config.clone();
        let cancel = cancel.clone();
        let images = pick(&answer_pages);
        let context = answer_context(&structure, &partition.plans);
        async move {
            let task = tokio::spawn(async move {
                extract_answers(oracle.as_ref(), images, &context, &config, &cancel).await
            });
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Answers: task failed: {}", e);
                    AnswerOutcome {
                        problem: Some(format!("answer task failed: {e}")),
                        ..Default::default()
                    }
                }
            }
        }
    };

    let (outcomes, answers) = tokio::join!(booklets, answers);
    let extraction_duration_ms = extraction_start.elapsed().as_millis() as u64;

    if cancel.is_cancelled() {
        info!("Extraction cancelled");
        return Err(ExtractError::Cancelled);
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_answers_complete(answers.answers.len(), answers.problem.as_deref());
    }

    // ── Step 4: Merge and report ─────────────────────────────────────────
    let booklet_calls: u32 = outcomes.iter().map(|o| o.attempts).sum();
    let retries: u32 = outcomes.iter().map(|o| o.attempts.saturating_sub(1)).sum();
    let answer_calls = answers.oracle_calls;

    let (result, report) = merge(&structure, &partition, outcomes, answers);

    let stats = ExtractionStats {
        total_pages,
        booklets: partition.plans.len(),
        questions_found: result.question_count(),
        answers_found: result.answers.len(),
        oracle_calls: 1 + booklet_calls + answer_calls,
        retries,
        structure_duration_ms,
        extraction_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    if report.is_clean() {
        info!("Extraction report:\n{}", report.summary());
    } else {
        warn!(
            "Extraction report ({} issue(s)):\n{}",
            report.issue_count(),
            report.summary()
        );
    }
    info!(
        "Extraction complete: {} question(s), {} answer(s), {} oracle call(s), {}ms total",
        stats.questions_found, stats.answers_found, stats.oracle_calls, stats.total_duration_ms
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_complete(stats.questions_found, report.issue_count());
    }

    Ok(ExtractionOutput { result, report, stats })
}

/// Load page images from paths, directories or URLs, then extract.
pub async fn extract_from_paths<S: AsRef<str>>(
    inputs: &[S],
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let pages = load_pages(inputs, config.download_timeout_secs).await?;
    extract(&pages, config).await
}

/// Extract and write the output JSON directly to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file<S: AsRef<str>>(
    inputs: &[S],
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let output = extract_from_paths(inputs, config).await?;
    write_output(&output, output_path.as_ref()).await?;
    Ok(output)
}

/// Serialise `output` as pretty JSON to `path`, atomically.
pub async fn write_output(output: &ExtractionOutput, path: &Path) -> Result<(), ExtractError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| ExtractError::Internal(format!("Failed to serialise output: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExtractError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| ExtractError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ExtractError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    info!("Wrote {}", path.display());
    Ok(())
}

/// Synchronous wrapper around [`extract_from_paths`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync<S: AsRef<str>>(inputs: &[S], config: &ExtractionConfig) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_from_paths(inputs, config))
}

/// Re-locate one question on one page.
///
/// `page_index` is the page's index in the original document.
pub async fn reextract_question(
    page: &PageImage,
    page_index: usize,
    question_num: &str,
    context: &QuestionContext,
    config: &ExtractionConfig,
) -> Result<Question, ExtractError> {
    let oracle = resolve_oracle(config)?;
    let image = LabeledImage {
        page_index,
        image: encode::encode_page(page, config.max_image_pixels)?,
    };
    single::reextract_question(oracle.as_ref(), image, question_num, context, config, &CancelToken::new()).await
}

/// Re-read one answer from one answer page.
pub async fn reextract_answer(
    page: &PageImage,
    page_index: usize,
    question_num: &str,
    config: &ExtractionConfig,
) -> Result<AnswerEntry, ExtractError> {
    let oracle = resolve_oracle(config)?;
    let image = LabeledImage {
        page_index,
        image: encode::encode_page(page, config.max_image_pixels)?,
    };
    single::reextract_answer(oracle.as_ref(), image, question_num, config, &CancelToken::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ExtractionOutput;

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let config = ExtractionConfig::default();
        let err = extract(&[], &config).await.unwrap_err();
        assert!(matches!(err, ExtractError::NoPages));
    }

    #[tokio::test]
    async fn non_image_input_is_rejected_before_any_call() {
        let config = ExtractionConfig::default();
        let err = extract(&[PageImage::new("a.txt", b"plain text".to_vec())], &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotAnImage { .. }));
    }

    #[tokio::test]
    async fn output_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        let output = ExtractionOutput {
            result: Default::default(),
            report: Default::default(),
            stats: Default::default(),
        };
        write_output(&output, &path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: ExtractionOutput = serde_json::from_str(&text).unwrap();
        assert_eq!(back, output);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
