//! Contiguous-numbering checks for one booklet.
//!
//! Only the numeric suffix of each question number is considered: the
//! booklet's prefix (or a bare `Q`) is stripped, then the leading digits are
//! read. A question that runs onto the following page appears there again as
//! the first entry and is counted once. With zero issues reported, the sorted
//! suffixes are exactly `first ..= first + expected - 1`.

use crate::output::{IssueKind, PageQuestions, ValidationIssue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static RE_LEADING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[Qq]?\.?\s*(\d+)").unwrap());

/// Missing numbers listed in one gap issue; the rest are only counted.
pub const MAX_LISTED_GAPS: usize = 50;

/// What a booklet's numbering should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberingExpectation {
    pub prefix: String,
    /// First question number of the booklet (1 unless it continues a prefix group).
    pub first: u32,
    /// 0 when the structure stage gave no count; only start, gaps and
    /// duplicates are checked then.
    pub expected_count: u32,
}

impl NumberingExpectation {
    /// Last expected number, if a count is known.
    pub fn last(&self) -> Option<u32> {
        (self.expected_count > 0).then(|| self.first.saturating_add(self.expected_count - 1))
    }
}

/// Numeric suffix of a question number, ignoring `prefix` (case-insensitive).
///
/// `None` when the number has no leading digits once the prefix is gone,
/// which covers sub-part labels like "(a)" and numbers of another prefix.
pub fn numeric_suffix(question_num: &str, prefix: &str) -> Option<u32> {
    let trimmed = question_num.trim();
    let rest = if !prefix.is_empty()
        && trimmed.len() >= prefix.len()
        && trimmed.is_char_boundary(prefix.len())
        && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        &trimmed[prefix.len()..]
    } else {
        trimmed
    };
    RE_LEADING_NUMBER
        .captures(rest.trim_start())
        .and_then(|c| c[1].parse().ok())
}

/// Question numbers of a booklet in page order, one per question.
///
/// When the first entry of a page repeats the number of the last entry on
/// the previous page, it is the same question continuing and is skipped.
pub fn numbered_entries(pages: &[PageQuestions]) -> Vec<&str> {
    let mut nums = Vec::new();
    let mut carried: Option<&str> = None;
    for page in pages {
        for (i, q) in page.questions.iter().enumerate() {
            let num = q.question_num.trim();
            let continues = i == 0 && carried.is_some_and(|prev| prev.eq_ignore_ascii_case(num));
            if !continues {
                nums.push(num);
            }
        }
        carried = page.questions.last().map(|q| q.question_num.trim());
    }
    nums
}

/// Check one booklet's question numbers against its expectation.
pub fn validate_numbering<'a, I>(booklet: &str, expect: &NumberingExpectation, question_nums: I) -> Vec<ValidationIssue>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut unrecognised: Vec<String> = Vec::new();
    for num in question_nums {
        match numeric_suffix(num, &expect.prefix) {
            Some(n) => *counts.entry(n).or_default() += 1,
            None => unrecognised.push(num.trim().to_string()),
        }
    }

    let issue = |kind: IssueKind, detail: String, numbers: Vec<u32>| ValidationIssue {
        booklet: booklet.to_string(),
        kind,
        detail,
        numbers,
    };

    let mut issues = Vec::new();
    if !unrecognised.is_empty() {
        let expected = if expect.prefix.is_empty() {
            "a plain number".to_string()
        } else {
            format!("\"{}\" followed by a number", expect.prefix)
        };
        issues.push(issue(
            IssueKind::Unrecognised,
            format!(
                "question numbers not in this booklet's numbering (expected {}): {}",
                expected,
                unrecognised.join(", ")
            ),
            Vec::new(),
        ));
    }

    let (Some(&min), Some(&max)) = (counts.keys().next(), counts.keys().next_back()) else {
        issues.push(issue(IssueKind::NoneFound, "no questions were found".to_string(), Vec::new()));
        return issues;
    };

    if min != expect.first {
        issues.push(issue(
            IssueKind::WrongFirst,
            format!("first question should be {} but got {}", expect.first, min),
            vec![min],
        ));
    }

    let hi = expect.last().map_or(max, |last| last.max(min));
    let gap_from = min.max(expect.first);
    if gap_from <= hi {
        let present = counts.range(gap_from..=hi).count() as u64;
        let total_missing = u64::from(hi - gap_from) + 1 - present;
        let missing: Vec<u32> = (gap_from..=hi)
            .filter(|n| !counts.contains_key(n))
            .take(MAX_LISTED_GAPS)
            .collect();
        if !missing.is_empty() {
            let unlisted = total_missing - missing.len() as u64;
            let detail = if unlisted > 0 {
                format!("missing questions: {} and {} more", join(&missing), unlisted)
            } else {
                format!("missing questions: {}", join(&missing))
            };
            issues.push(issue(IssueKind::Gap, detail, missing));
        }
    }

    let duplicates: Vec<u32> = counts.iter().filter(|&(_, &c)| c > 1).map(|(&n, _)| n).collect();
    if !duplicates.is_empty() {
        issues.push(issue(
            IssueKind::Duplicate,
            format!("duplicate questions: {}", join(&duplicates)),
            duplicates,
        ));
    }

    if let Some(last) = expect.last() {
        let surplus: Vec<u32> = counts.keys().copied().filter(|&n| n > last).collect();
        if !surplus.is_empty() {
            issues.push(issue(
                IssueKind::Surplus,
                format!("questions beyond the expected last number {}: {}", last, join(&surplus)),
                surplus,
            ));
        }
    }

    issues
}

fn join(nums: &[u32]) -> String {
    nums.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}
