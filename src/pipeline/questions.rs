//! Per-booklet question extraction with validation and bounded retry.
//!
//! ```text
//!  PENDING ─► FIRST_ATTEMPT ─┬─ valid ─────────────────────────► DONE
//!                            └─ invalid ─► RETRY (≤ max_retries) ─► DONE
//! ```
//!
//! One oracle call locates every question of the booklet. The reply is
//! decoded, page indices are remapped, boundaries are normalised and the
//! numbering is validated. An invalid result is retried with the previous
//! reply and a list of problems as follow-up messages; a retry reply that
//! decodes replaces the previous result, one that does not is ignored.
//!
//! [`extract_booklet`] never fails: every problem ends up as a
//! [`ValidationIssue`] on the returned [`BookletOutcome`].

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::OracleError;
use crate::oracle::{call_oracle, LabeledImage, Oracle, OracleRequest, OracleTask};
use crate::output::{IssueKind, PageQuestions, Question, ValidationIssue};
use crate::pipeline::decode::decode_question_pages;
use crate::pipeline::partition::BookletPlan;
use crate::pipeline::remap::PageIndexRemapper;
use crate::pipeline::validate::{numbered_entries, validate_numbering, NumberingExpectation};
use crate::prompts::{question_prompt, retry_feedback, BookletPromptContext};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Final state of one booklet.
#[derive(Debug, Clone, Default)]
pub struct BookletOutcome {
    pub label: String,
    /// Pages the oracle returned, ascending, already remapped and normalised.
    pub pages: Vec<PageQuestions>,
    /// Issues of the adopted result, plus any call or decode failures.
    pub issues: Vec<ValidationIssue>,
    /// Oracle calls issued for this booklet (first attempt plus retries).
    pub attempts: u32,
    pub raw_excerpt: String,
}

impl BookletOutcome {
    /// Distinct questions found; a question running onto the next page
    /// counts once.
    pub fn question_count(&self) -> usize {
        numbered_entries(&self.pages).len()
    }

    pub fn question_nums(&self) -> impl Iterator<Item = &str> {
        numbered_entries(&self.pages).into_iter()
    }

    /// Outcome for a booklet whose task died before producing anything.
    pub fn failed(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            issues: vec![ValidationIssue {
                booklet: label.to_string(),
                kind: IssueKind::OracleFailed,
                detail: detail.into(),
                numbers: Vec::new(),
            }],
            ..Default::default()
        }
    }
}

/// Result of one call: decoded pages, or why there are none.
enum Attempt {
    Parsed(Vec<PageQuestions>),
    Unparsable(String),
    Failed(OracleError),
}

/// Extract, validate and (if needed) retry one booklet.
///
/// `images` must be the booklet's pages, in `plan.page_indices` order.
pub async fn extract_booklet(
    oracle: &dyn Oracle,
    plan: &BookletPlan,
    images: Vec<LabeledImage>,
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> BookletOutcome {
    let label = plan.label().to_string();
    let expect = plan.expectation();

    if images.is_empty() {
        warn!("Booklet '{}': no question pages to extract", label);
        return BookletOutcome {
            issues: vec![issue(&label, IssueKind::NoneFound, "booklet has no question pages")],
            label,
            ..Default::default()
        };
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_booklet_start(&label, images.len());
    }

    let remapper = PageIndexRemapper::new(&images.iter().map(|i| i.page_index).collect::<Vec<_>>());
    let instruction = question_prompt(&BookletPromptContext {
        label: &label,
        prefix: plan.prefix(),
        first_question: plan.first_question_num,
        expected_count: plan.booklet.expected_question_count,
        first_question_y_start_pct: plan.booklet.first_question_y_start_pct,
        sections: &plan.booklet.sections,
    });
    let mut request = OracleRequest::new(OracleTask::Questions { booklet: label.clone() }, images, instruction);
    let timeout = Duration::from_secs(config.api_timeout_secs);

    // ── First attempt ────────────────────────────────────────────────────
    let (mut raw, first) = run_attempt(oracle, &request, timeout, cancel, &remapper, plan, config).await;
    let mut attempts = 1u32;
    let mut adopted: Option<Vec<PageQuestions>> = None;
    let mut extra_issues: Vec<ValidationIssue> = Vec::new();

    let mut issues = match first {
        Attempt::Parsed(pages) => {
            let issues = validate(&label, &expect, &pages);
            adopted = Some(pages);
            issues
        }
        Attempt::Unparsable(detail) => vec![issue(&label, IssueKind::Unparsable, format!("response could not be read: {detail}"))],
        Attempt::Failed(e) => {
            // Transport retries already happened inside the oracle; a second
            // content retry has no reply to correct.
            let outcome = BookletOutcome {
                issues: vec![issue(&label, IssueKind::OracleFailed, format!("oracle call failed: {e}"))],
                attempts,
                raw_excerpt: String::new(),
                label,
                pages: Vec::new(),
            };
            report_complete(config, &outcome);
            return outcome;
        }
    };

    // ── Bounded retry ────────────────────────────────────────────────────
    let max_retries = config.retry_policy.effective_retries();
    let mut retries = 0u32;
    while !issues.is_empty() && retries < max_retries && !cancel.is_cancelled() {
        retries += 1;
        info!(
            "Booklet '{}': {} issue(s), retry {}/{}",
            label,
            issues.len(),
            retries,
            max_retries
        );
        if let Some(ref cb) = config.progress_callback {
            cb.on_booklet_retry(&label, retries, issues.len());
        }
        if config.retry_policy.backoff_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.retry_policy.backoff_ms)).await;
        }

        request = request.with_follow_up(raw.clone(), retry_feedback(&label, &issues));
        let (next_raw, next) = run_attempt(oracle, &request, timeout, cancel, &remapper, plan, config).await;
        attempts += 1;

        match next {
            Attempt::Parsed(pages) => {
                raw = next_raw;
                issues = validate(&label, &expect, &pages);
                adopted = Some(pages);
            }
            Attempt::Unparsable(detail) => {
                warn!("Booklet '{}': retry reply unreadable, keeping previous result", label);
                extra_issues.push(issue(
                    &label,
                    IssueKind::Unparsable,
                    format!("retry response could not be read: {detail}"),
                ));
                break;
            }
            Attempt::Failed(e) => {
                warn!("Booklet '{}': retry call failed, keeping previous result", label);
                extra_issues.push(issue(&label, IssueKind::OracleFailed, format!("retry call failed: {e}")));
                break;
            }
        }
    }

    issues.extend(extra_issues);
    let outcome = BookletOutcome {
        pages: adopted.unwrap_or_default(),
        issues,
        attempts,
        raw_excerpt: config.excerpt(&raw),
        label,
    };
    report_complete(config, &outcome);
    outcome
}

fn report_complete(config: &ExtractionConfig, outcome: &BookletOutcome) {
    if outcome.issues.is_empty() {
        info!(
            "Booklet '{}': {} question(s), valid after {} call(s)",
            outcome.label,
            outcome.question_count(),
            outcome.attempts
        );
    } else {
        warn!(
            "Booklet '{}': {} question(s), {} issue(s) after {} call(s)",
            outcome.label,
            outcome.question_count(),
            outcome.issues.len(),
            outcome.attempts
        );
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_booklet_complete(&outcome.label, outcome.question_count(), outcome.issues.len());
    }
}

async fn run_attempt(
    oracle: &dyn Oracle,
    request: &OracleRequest,
    timeout: Duration,
    cancel: &CancelToken,
    remapper: &PageIndexRemapper,
    plan: &BookletPlan,
    config: &ExtractionConfig,
) -> (String, Attempt) {
    let raw = match call_oracle(oracle, request, timeout, cancel).await {
        Ok(raw) => raw,
        Err(e) => return (String::new(), Attempt::Failed(e)),
    };
    let attempt = match decode_question_pages(&raw, &config.answer_separator) {
        Ok(pages) => {
            let pages = normalise_pages(pages, remapper, plan.prefix(), plan.label());
            debug!(
                "Booklet '{}': {} page(s) with questions decoded",
                plan.label(),
                pages.len()
            );
            Attempt::Parsed(pages)
        }
        Err(e) => {
            warn!("Booklet '{}': {}", plan.label(), e);
            Attempt::Unparsable(e.detail)
        }
    };
    (raw, attempt)
}

fn validate(label: &str, expect: &NumberingExpectation, pages: &[PageQuestions]) -> Vec<ValidationIssue> {
    validate_numbering(label, expect, numbered_entries(pages))
}

fn issue(booklet: &str, kind: IssueKind, detail: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        booklet: booklet.to_string(),
        kind,
        detail: detail.into(),
        numbers: Vec::new(),
    }
}

/// Remap page indices, clamp boundaries, apply the booklet prefix and order
/// questions top to bottom.
///
/// Entries on pages outside the sent set and questions with an empty span
/// are dropped; the numbering check then reports them as gaps.
pub fn normalise_pages(
    pages: Vec<PageQuestions>,
    remapper: &PageIndexRemapper,
    prefix: &str,
    label: &str,
) -> Vec<PageQuestions> {
    let mut by_index: BTreeMap<usize, Vec<Question>> = BTreeMap::new();

    for page in pages {
        let Some(index) = remapper.remap(page.index) else {
            warn!(
                "Booklet '{}': page index {} is outside the {} page(s) sent; {} question(s) dropped",
                label,
                page.index,
                remapper.sent().len(),
                page.questions.len()
            );
            continue;
        };
        if index != page.index {
            debug!("Booklet '{}': page index {} remapped to {}", label, page.index, index);
        }
        let slot = by_index.entry(index).or_default();
        for q in page.questions {
            let num = q.question_num.clone();
            match q.normalised() {
                Some(mut q) => {
                    q.question_num = apply_prefix(&q.question_num, prefix);
                    slot.push(q);
                }
                None => warn!("Booklet '{}': question {} on page {} has an empty span; dropped", label, num, index),
            }
        }
    }

    by_index
        .into_iter()
        .map(|(index, mut questions)| {
            questions.sort_by(|a, b| a.y_start_pct.total_cmp(&b.y_start_pct));
            PageQuestions { index, questions }
        })
        .collect()
}

/// Prepend `prefix` to a bare number such as "7" or "Q7" when it is missing.
pub fn apply_prefix(num: &str, prefix: &str) -> String {
    let trimmed = num.trim();
    if prefix.is_empty()
        || (trimmed.len() >= prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix))
    {
        return trimmed.to_string();
    }
    let bare = trimmed.trim_start_matches(['Q', 'q']).trim_start_matches('.');
    if bare.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{prefix}{bare}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Booklet;
    use async_trait::async_trait;
    use edgequake_llm::ImageData;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replies from a fixed script, one per call; records the feedback it saw.
    struct Scripted {
        replies: Mutex<Vec<Result<String, OracleError>>>,
        calls: AtomicU32,
        feedback: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, OracleError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(|r| r.map(str::to_string)).collect()),
                calls: AtomicU32::new(0),
                feedback: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Oracle for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn infer(&self, req: &OracleRequest) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fu) = req.follow_ups.last() {
                self.feedback.lock().unwrap().push(fu.feedback.clone());
            }
            self.replies.lock().unwrap().pop().unwrap_or(Err(OracleError::EmptyResponse))
        }
    }

    fn plan(prefix: &str, first: u32, count: u32, pages: &[usize]) -> BookletPlan {
        BookletPlan {
            booklet: Booklet {
                label: "Booklet A".into(),
                question_prefix: prefix.into(),
                expected_question_count: count,
                first_question_page_index: pages[0],
                first_question_y_start_pct: 10.0,
                sections: Vec::new(),
            },
            start_page: pages[0],
            end_page: pages.last().copied(),
            page_indices: pages.to_vec(),
            first_question_num: first,
        }
    }

    fn images(pages: &[usize]) -> Vec<LabeledImage> {
        pages
            .iter()
            .map(|&page_index| LabeledImage {
                page_index,
                image: ImageData::new("AAAA".to_string(), "image/png"),
            })
            .collect()
    }

    fn reply(entries: &[(usize, &str)]) -> String {
        let items: Vec<String> = entries
            .iter()
            .enumerate()
            .map(|(i, (page, num))| {
                format!(
                    r#"{{"pageIndex": {page}, "questionNum": "{num}", "yStartPct": {}, "yEndPct": {}}}"#,
                    i * 10,
                    i * 10 + 9
                )
            })
            .collect();
        format!("[{}]", items.join(","))
    }

    async fn run(oracle: &Scripted, plan: &BookletPlan) -> BookletOutcome {
        let config = ExtractionConfig::default();
        extract_booklet(oracle, plan, images(&plan.page_indices), &config, &CancelToken::new()).await
    }

    #[tokio::test]
    async fn valid_first_attempt_needs_no_retry() {
        let r = reply(&[(1, "1"), (1, "2"), (2, "3")]);
        let oracle = Scripted::new(vec![Ok(r.as_str())]);
        let out = run(&oracle, &plan("", 1, 3, &[1, 2])).await;
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.question_count(), 3);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gap_triggers_one_retry_with_feedback() {
        let first = reply(&[(1, "1"), (1, "3"), (2, "4")]);
        let second = reply(&[(1, "1"), (1, "2"), (2, "3"), (2, "4")]);
        let oracle = Scripted::new(vec![Ok(first.as_str()), Ok(second.as_str())]);
        let out = run(&oracle, &plan("", 1, 4, &[1, 2])).await;
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        assert_eq!(out.attempts, 2);
        let feedback = oracle.feedback.lock().unwrap();
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].contains("missing questions: 2"), "{}", feedback[0]);
    }

    #[tokio::test]
    async fn never_more_than_one_retry_by_default() {
        let bad = reply(&[(1, "1"), (1, "3")]);
        let oracle = Scripted::new(vec![Ok(bad.as_str()), Ok(bad.as_str()), Ok(bad.as_str())]);
        let out = run(&oracle, &plan("", 1, 3, &[1])).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.attempts, 2);
        assert!(out.issues.iter().any(|i| i.kind == IssueKind::Gap));
    }

    #[tokio::test]
    async fn unreadable_retry_keeps_first_result() {
        let first = reply(&[(1, "1"), (1, "3")]);
        let oracle = Scripted::new(vec![Ok(first.as_str()), Ok("sorry, I cannot help")]);
        let out = run(&oracle, &plan("", 1, 3, &[1])).await;
        assert_eq!(out.question_count(), 2);
        let kinds: Vec<IssueKind> = out.issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::Gap));
        assert!(kinds.contains(&IssueKind::Unparsable));
    }

    #[tokio::test]
    async fn unreadable_first_reply_is_retried() {
        let good = reply(&[(1, "1"), (1, "2")]);
        let oracle = Scripted::new(vec![Ok("{\"note\": \"no idea\"}"), Ok(good.as_str())]);
        let out = run(&oracle, &plan("", 1, 2, &[1])).await;
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn failed_call_is_reported_not_raised() {
        let oracle = Scripted::new(vec![Err(OracleError::Timeout { secs: 180 })]);
        let out = run(&oracle, &plan("", 1, 2, &[1])).await;
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, IssueKind::OracleFailed);
        assert!(out.pages.is_empty());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn positional_indices_are_remapped() {
        let r = reply(&[(0, "1"), (1, "2")]);
        let oracle = Scripted::new(vec![Ok(r.as_str())]);
        let out = run(&oracle, &plan("", 1, 2, &[5, 6])).await;
        let idx: Vec<usize> = out.pages.iter().map(|p| p.index).collect();
        assert_eq!(idx, vec![5, 6]);
    }

    #[tokio::test]
    async fn booklet_without_pages_skips_the_oracle() {
        let oracle = Scripted::new(vec![]);
        let mut p = plan("", 1, 2, &[1]);
        p.page_indices.clear();
        let config = ExtractionConfig::default();
        let out = extract_booklet(&oracle, &p, Vec::new(), &config, &CancelToken::new()).await;
        assert_eq!(out.issues[0].kind, IssueKind::NoneFound);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn normalisation_clamps_prefixes_and_sorts() {
        let remapper = PageIndexRemapper::new(&[3]);
        let q = |num: &str, a: f64, b: f64| Question {
            question_num: num.into(),
            y_start_pct: a,
            y_end_pct: b,
            boundary_top_label: None,
            boundary_bottom_label: None,
        };
        let pages = vec![
            PageQuestions {
                index: 3,
                questions: vec![q("2", 50.0, 120.0), q("1", -5.0, 40.0), q("x", 60.0, 60.0)],
            },
            PageQuestions {
                index: 9,
                questions: vec![q("3", 0.0, 10.0)],
            },
        ];
        let out = normalise_pages(pages, &remapper, "B", "Booklet B");
        assert_eq!(out.len(), 1);
        let nums: Vec<&str> = out[0].questions.iter().map(|q| q.question_num.as_str()).collect();
        assert_eq!(nums, vec!["B1", "B2"]);
        assert_eq!(out[0].questions[0].y_start_pct, 0.0);
        assert_eq!(out[0].questions[1].y_end_pct, 100.0);
    }

    #[test]
    fn prefix_is_only_added_when_missing() {
        assert_eq!(apply_prefix("7", "P2-"), "P2-7");
        assert_eq!(apply_prefix("Q7", "B"), "B7");
        assert_eq!(apply_prefix("p2-7", "P2-"), "p2-7");
        assert_eq!(apply_prefix(" 12 ", ""), "12");
        assert_eq!(apply_prefix("(a)", "B"), "(a)");
    }
}
