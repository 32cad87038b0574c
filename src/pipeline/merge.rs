//! Merge per-booklet and answer results into one [`BatchResult`].
//!
//! Every classified page appears exactly once in the output, sorted by
//! index. Booklet pages the oracle never returned, cover pages, answer pages
//! and unassigned question pages all appear with an empty question list.

use crate::output::{BatchResult, BookletReport, DiagnosticReport, PageResult, StructureResult};
use crate::pipeline::answers::AnswerOutcome;
use crate::pipeline::partition::{BookletPlan, Partition};
use crate::pipeline::questions::BookletOutcome;
use crate::pipeline::validate::numeric_suffix;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Assemble the final result and its diagnostic report.
///
/// Outcomes are matched to plans by booklet label; a plan with no outcome
/// is reported as failed.
pub fn merge(
    structure: &StructureResult,
    partition: &Partition,
    outcomes: Vec<BookletOutcome>,
    answers: AnswerOutcome,
) -> (BatchResult, DiagnosticReport) {
    let mut pages: BTreeMap<usize, PageResult> = structure
        .pages
        .iter()
        .map(|p| {
            (
                p.index,
                PageResult {
                    index: p.index,
                    is_answer_sheet: p.is_answer_sheet,
                    is_cover_page: p.is_cover_page && !p.is_answer_sheet,
                    paper_label: p.paper_label.clone(),
                    questions: Vec::new(),
                },
            )
        })
        .collect();

    let mut by_label: HashMap<String, BookletOutcome> =
        outcomes.into_iter().map(|o| (o.label.clone(), o)).collect();
    let mut reports = Vec::with_capacity(partition.plans.len());

    for plan in &partition.plans {
        let outcome = by_label
            .remove(plan.label())
            .unwrap_or_else(|| BookletOutcome::failed(plan.label(), "booklet task produced no result"));

        let owned: HashSet<usize> = plan.page_indices.iter().copied().collect();
        let mut returned = HashSet::new();
        for pq in &outcome.pages {
            if !owned.contains(&pq.index) {
                warn!(
                    "Merge: booklet '{}' returned page {} it does not own; ignored",
                    plan.label(),
                    pq.index
                );
                continue;
            }
            returned.insert(pq.index);
            if let Some(slot) = pages.get_mut(&pq.index) {
                if slot.paper_label.is_none() {
                    slot.paper_label = Some(plan.label().to_string());
                }
                slot.questions.extend(pq.questions.iter().cloned());
            }
        }
        for &index in &plan.page_indices {
            if !returned.contains(&index) {
                debug!("Merge: booklet '{}' page {} not returned; kept empty", plan.label(), index);
            }
        }

        reports.push(booklet_report(plan, &outcome));
    }

    let answer_pages = structure.answer_pages();
    let report = DiagnosticReport {
        booklets: reports,
        answer_pages,
        answers_found: answers.answers.len(),
        answer_problem: answers.problem,
        unassigned_pages: partition.unassigned.clone(),
    };

    let result = BatchResult {
        header: structure.header.clone(),
        pages: pages.into_values().collect(),
        answers: answers.answers,
    };

    (result, report)
}

fn booklet_report(plan: &BookletPlan, outcome: &BookletOutcome) -> BookletReport {
    let expect = plan.expectation();
    let suffixes: Vec<u32> = outcome
        .question_nums()
        .filter_map(|n| numeric_suffix(n, plan.prefix()))
        .collect();
    BookletReport {
        label: plan.label().to_string(),
        prefix: plan.prefix().to_string(),
        page_indices: plan.page_indices.clone(),
        expected_first: expect.first,
        expected_last: expect.last(),
        found_first: suffixes.iter().copied().min(),
        found_last: suffixes.iter().copied().max(),
        found_count: outcome.question_count(),
        attempts: outcome.attempts,
        issues: outcome.issues.clone(),
        raw_excerpt: outcome.raw_excerpt.clone(),
    }
}
