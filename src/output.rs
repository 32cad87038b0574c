//! Value types produced by the extraction pipeline.
//!
//! Every stage returns immutable values that only the orchestrator in
//! [`crate::extract`] consumes. Field names serialise in camelCase because the
//! same JSON shape is spoken on both sides: the oracle is asked to answer in it,
//! and HTTP callers receive [`BatchResult`] in it.

use crate::pipeline::decode::lenient;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

// ── Structure analysis ───────────────────────────────────────────────────

/// Descriptive metadata read from the paper's cover/header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaperHeader {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub school: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub subject: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub level: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub year: Option<String>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub total_marks: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub duration: Option<String>,
}

/// Classification of a single page of the original document.
///
/// `index` is the 0-based position in the document. Exactly one of cover,
/// question or answer applies; see [`Page::kind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(alias = "pageIndex", deserialize_with = "lenient::usize")]
    pub index: usize,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_answer_sheet: bool,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_cover_page: bool,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub paper_label: Option<String>,
}

/// The three mutually exclusive page roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageKind {
    Cover,
    Question,
    Answer,
}

impl Page {
    /// A question page with no label.
    pub fn question(index: usize) -> Self {
        Self {
            index,
            is_answer_sheet: false,
            is_cover_page: false,
            paper_label: None,
        }
    }

    /// Role of this page. An answer flag wins over a cover flag when the
    /// oracle sets both.
    pub fn kind(&self) -> PageKind {
        if self.is_answer_sheet {
            PageKind::Answer
        } else if self.is_cover_page {
            PageKind::Cover
        } else {
            PageKind::Question
        }
    }
}

/// Question format of a section, as printed in the paper header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SectionKind {
    #[serde(rename = "MCQ", alias = "mcq", alias = "Mcq")]
    Mcq,
    #[serde(rename = "structured", alias = "Structured", alias = "STRUCTURED")]
    Structured,
    #[serde(other, rename = "other")]
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(default, alias = "type", deserialize_with = "lenient::null_default")]
    pub kind: SectionKind,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub marks: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub question_count: Option<u32>,
}

/// A booklet (a.k.a. paper): a contiguous run of question pages.
///
/// Booklets that share a `question_prefix` share one continuous numbering
/// sequence; distinct prefixes restart at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booklet {
    #[serde(default, deserialize_with = "lenient::string")]
    pub label: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub question_prefix: String,
    #[serde(default, deserialize_with = "lenient::u32")]
    pub expected_question_count: u32,
    #[serde(deserialize_with = "lenient::usize")]
    pub first_question_page_index: usize,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub first_question_y_start_pct: f64,
    #[serde(default, deserialize_with = "lenient::null_default")]
    pub sections: Vec<Section>,
}

/// Output of the structure analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureResult {
    #[serde(default)]
    pub header: PaperHeader,
    pub pages: Vec<Page>,
    pub booklets: Vec<Booklet>,
}

impl StructureResult {
    /// Indices of answer-key pages, ascending.
    pub fn answer_pages(&self) -> Vec<usize> {
        self.pages_of_kind(PageKind::Answer)
    }

    /// Indices of cover pages, ascending.
    pub fn cover_pages(&self) -> Vec<usize> {
        self.pages_of_kind(PageKind::Cover)
    }

    fn pages_of_kind(&self, kind: PageKind) -> Vec<usize> {
        let mut v: Vec<usize> = self
            .pages
            .iter()
            .filter(|p| p.kind() == kind)
            .map(|p| p.index)
            .collect();
        v.sort_unstable();
        v
    }

    /// Look up a page classification by original index.
    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.index == index)
    }
}

// ── Questions and answers ────────────────────────────────────────────────

/// Vertical crop boundary of one question on one page, in percent of page height.
///
/// Invariant once normalised: `0 <= y_start_pct < y_end_pct <= 100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(alias = "number", alias = "questionNumber", deserialize_with = "lenient::string")]
    pub question_num: String,
    #[serde(deserialize_with = "lenient::f64")]
    pub y_start_pct: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub y_end_pct: f64,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub boundary_top_label: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub boundary_bottom_label: Option<String>,
}

impl Question {
    /// Clamp both boundaries into `[0, 100]`. Returns `None` when the span is
    /// empty or inverted afterwards.
    pub fn normalised(mut self) -> Option<Self> {
        if !self.y_start_pct.is_finite() || !self.y_end_pct.is_finite() {
            return None;
        }
        self.y_start_pct = self.y_start_pct.clamp(0.0, 100.0);
        self.y_end_pct = self.y_end_pct.clamp(0.0, 100.0);
        if self.y_start_pct < self.y_end_pct {
            Some(self)
        } else {
            None
        }
    }
}

/// One answer-key entry: flattened text, or a region of an answer page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AnswerEntry {
    Text {
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    ImageRegion {
        page_index: usize,
        y_start_pct: f64,
        y_end_pct: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

/// Questions found on one original page by a booklet extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuestions {
    pub index: usize,
    pub questions: Vec<Question>,
}

/// One page of the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub index: usize,
    pub is_answer_sheet: bool,
    pub is_cover_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_label: Option<String>,
    pub questions: Vec<Question>,
}

/// The merged pipeline output.
///
/// `pages` is sorted ascending by `index` and holds every original page
/// exactly once. `answers` is keyed by (possibly prefixed) question number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub header: PaperHeader,
    pub pages: Vec<PageResult>,
    pub answers: BTreeMap<String, AnswerEntry>,
}

impl BatchResult {
    /// Total number of question crops across all pages. A question that runs
    /// onto the next page has one crop on each.
    pub fn question_count(&self) -> usize {
        self.pages.iter().map(|p| p.questions.len()).sum()
    }

    /// The number of every crop, in page order.
    pub fn question_nums(&self) -> Vec<&str> {
        self.pages
            .iter()
            .flat_map(|p| p.questions.iter().map(|q| q.question_num.as_str()))
            .collect()
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────────

/// What kind of numbering problem a booklet has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    Gap,
    Duplicate,
    WrongFirst,
    NoneFound,
    /// Numbers past the expected last question.
    Surplus,
    /// Entries whose number is not in this booklet's numbering: another
    /// prefix, or no digits at all.
    Unrecognised,
    /// The response matched none of the accepted shapes.
    Unparsable,
    /// The oracle call failed, timed out, or the task died.
    OracleFailed,
}

/// A diagnostic about one booklet. Never blocks producing a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub booklet: String,
    pub kind: IssueKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numbers: Vec<u32>,
}

/// Expected-vs-found summary for one booklet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookletReport {
    pub label: String,
    pub prefix: String,
    pub page_indices: Vec<usize>,
    pub expected_first: u32,
    /// `None` when the structure stage did not report a question count.
    pub expected_last: Option<u32>,
    pub found_first: Option<u32>,
    pub found_last: Option<u32>,
    pub found_count: usize,
    pub attempts: u32,
    pub issues: Vec<ValidationIssue>,
    pub raw_excerpt: String,
}

/// Informational report emitted alongside every [`BatchResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub booklets: Vec<BookletReport>,
    pub answer_pages: Vec<usize>,
    pub answers_found: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_problem: Option<String>,
    /// Question pages that no booklet range covered.
    pub unassigned_pages: Vec<usize>,
}

impl DiagnosticReport {
    pub fn issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.booklets.iter().flat_map(|b| b.issues.iter())
    }

    pub fn issue_count(&self) -> usize {
        self.booklets.iter().map(|b| b.issues.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0 && self.answer_problem.is_none()
    }

    pub fn booklet(&self, label: &str) -> Option<&BookletReport> {
        self.booklets.iter().find(|b| b.label == label)
    }

    /// Multi-line, human-readable summary for logs and the CLI.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for b in &self.booklets {
            let expected = match b.expected_last {
                Some(last) => format!("{}{}-{}{}", b.prefix, b.expected_first, b.prefix, last),
                None => format!("{}{}-?", b.prefix, b.expected_first),
            };
            let found = match (b.found_first, b.found_last) {
                (Some(f), Some(l)) => format!("{}{}-{}{}", b.prefix, f, b.prefix, l),
                _ => "none".to_string(),
            };
            let _ = writeln!(
                out,
                "[{}] expected {}  found {} ({} questions, {} attempt{})",
                b.label,
                expected,
                found,
                b.found_count,
                b.attempts,
                if b.attempts == 1 { "" } else { "s" }
            );
            for issue in &b.issues {
                let _ = writeln!(out, "    {:?}: {}", issue.kind, issue.detail);
            }
            if !b.issues.is_empty() && !b.raw_excerpt.is_empty() {
                let _ = writeln!(out, "    raw: {}", b.raw_excerpt);
            }
        }
        let _ = writeln!(
            out,
            "answers: {} from {} page(s)",
            self.answers_found,
            self.answer_pages.len()
        );
        if let Some(ref p) = self.answer_problem {
            let _ = writeln!(out, "    {p}");
        }
        if !self.unassigned_pages.is_empty() {
            let _ = writeln!(out, "unassigned pages: {:?}", self.unassigned_pages);
        }
        out
    }
}

/// Counters and timings for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total_pages: usize,
    pub booklets: usize,
    pub questions_found: usize,
    pub answers_found: usize,
    pub oracle_calls: u32,
    pub retries: u32,
    pub structure_duration_ms: u64,
    pub extraction_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Everything one pipeline run returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutput {
    pub result: BatchResult,
    pub report: DiagnosticReport,
    pub stats: ExtractionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_flag_wins_over_cover_flag() {
        let page = Page {
            index: 3,
            is_answer_sheet: true,
            is_cover_page: true,
            paper_label: None,
        };
        assert_eq!(page.kind(), PageKind::Answer);
        assert_eq!(Page::question(1).kind(), PageKind::Question);
    }

    #[test]
    fn question_normalisation_clamps_and_rejects_empty_spans() {
        let q = Question {
            question_num: "1".into(),
            y_start_pct: -4.0,
            y_end_pct: 130.0,
            boundary_top_label: None,
            boundary_bottom_label: None,
        };
        let q = q.normalised().expect("valid after clamping");
        assert_eq!(q.y_start_pct, 0.0);
        assert_eq!(q.y_end_pct, 100.0);

        let inverted = Question {
            y_start_pct: 60.0,
            y_end_pct: 40.0,
            ..q.clone()
        };
        assert!(inverted.normalised().is_none());

        let nan = Question {
            y_start_pct: f64::NAN,
            ..q
        };
        assert!(nan.normalised().is_none());
    }

    #[test]
    fn answer_entry_serialises_with_type_tag() {
        let text = AnswerEntry::Text { value: "B".into() };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["value"], "B");

        let img = AnswerEntry::ImageRegion {
            page_index: 9,
            y_start_pct: 10.0,
            y_end_pct: 20.0,
            value: None,
        };
        let json = serde_json::to_value(&img).unwrap();
        assert_eq!(json["type"], "imageRegion");
        assert_eq!(json["pageIndex"], 9);
        assert!(json.get("value").is_none());
    }

    #[test]
    fn booklet_tolerates_nulls_and_numeric_strings() {
        let b: Booklet = serde_json::from_str(
            r#"{"label":"Paper 1","questionPrefix":null,"expectedQuestionCount":"30",
                "firstQuestionPageIndex":2,"sections":null}"#,
        )
        .unwrap();
        assert_eq!(b.question_prefix, "");
        assert_eq!(b.expected_question_count, 30);
        assert!(b.sections.is_empty());
    }

    #[test]
    fn section_kind_accepts_unknown_values() {
        let s: Section = serde_json::from_str(r#"{"name":"A","kind":"essay"}"#).unwrap();
        assert_eq!(s.kind, SectionKind::Other);
        let s: Section = serde_json::from_str(r#"{"name":"B","kind":"MCQ","marks":20}"#).unwrap();
        assert_eq!(s.kind, SectionKind::Mcq);
        assert_eq!(s.marks, Some(20.0));
    }

    #[test]
    fn report_summary_mentions_issues() {
        let report = DiagnosticReport {
            booklets: vec![BookletReport {
                label: "Booklet A".into(),
                prefix: String::new(),
                page_indices: vec![1, 2],
                expected_first: 1,
                expected_last: Some(4),
                found_first: Some(1),
                found_last: Some(4),
                found_count: 3,
                attempts: 2,
                issues: vec![ValidationIssue {
                    booklet: "Booklet A".into(),
                    kind: IssueKind::Gap,
                    detail: "missing questions: 2".into(),
                    numbers: vec![2],
                }],
                raw_excerpt: "[...]".into(),
            }],
            ..Default::default()
        };
        let s = report.summary();
        assert!(s.contains("Booklet A"), "got: {s}");
        assert!(s.contains("missing questions: 2"), "got: {s}");
        assert_eq!(report.issue_count(), 1);
        assert!(!report.is_clean());
    }
}
