//! Booklet partitioning: pure computation over a [`StructureResult`].
//!
//! Booklets are ordered by their first question page. Each one owns the
//! pages from its (cover-skipping) start up to the page before the next
//! booklet's start; the last booklet runs to the last non-answer page. Cover
//! and answer pages are never part of a booklet's page list.

use crate::output::{Booklet, PageKind, StructureResult};
use crate::pipeline::validate::NumberingExpectation;
use std::collections::{BTreeSet, HashMap};

/// One booklet's share of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct BookletPlan {
    pub booklet: Booklet,
    pub start_page: usize,
    /// Inclusive. Smaller than `start_page` when the booklet owns no page.
    pub end_page: Option<usize>,
    /// Question pages in `[start_page, end_page]`, ascending.
    pub page_indices: Vec<usize>,
    /// Numeric suffix the booklet's first question must carry.
    pub first_question_num: u32,
}

impl BookletPlan {
    pub fn label(&self) -> &str {
        &self.booklet.label
    }

    pub fn prefix(&self) -> &str {
        &self.booklet.question_prefix
    }

    pub fn expectation(&self) -> NumberingExpectation {
        NumberingExpectation {
            prefix: self.booklet.question_prefix.clone(),
            first: self.first_question_num,
            expected_count: self.booklet.expected_question_count,
        }
    }
}

/// All booklet plans plus the question pages no booklet claimed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub plans: Vec<BookletPlan>,
    pub unassigned: Vec<usize>,
}

/// Split the document into booklet page ranges.
pub fn partition(structure: &StructureResult) -> Partition {
    let mut booklets: Vec<&Booklet> = structure.booklets.iter().collect();
    booklets.sort_by_key(|b| b.first_question_page_index);

    let kind_of = |index: usize| structure.page(index).map(|p| p.kind());
    let mut all_indices: Vec<usize> = structure.pages.iter().map(|p| p.index).collect();
    all_indices.sort_unstable();
    let last_non_answer = all_indices
        .iter()
        .rev()
        .copied()
        .find(|&i| kind_of(i) != Some(PageKind::Answer));

    let mut counters: HashMap<&str, u32> = HashMap::new();
    let mut claimed = BTreeSet::new();
    let mut plans = Vec::with_capacity(booklets.len());

    for (i, booklet) in booklets.iter().enumerate() {
        let next_start = booklets.get(i + 1).map(|b| b.first_question_page_index);
        let end_page = match next_start {
            Some(next) => next.checked_sub(1),
            None => last_non_answer,
        };

        let mut start_page = booklet.first_question_page_index;
        while kind_of(start_page) == Some(PageKind::Cover) && end_page.is_some_and(|end| start_page < end) {
            start_page += 1;
        }

        let page_indices: Vec<usize> = match end_page {
            Some(end) if end >= start_page => all_indices
                .iter()
                .copied()
                .filter(|&p| p >= start_page && p <= end && kind_of(p) == Some(PageKind::Question))
                .collect(),
            _ => Vec::new(),
        };
        claimed.extend(page_indices.iter().copied());

        let counter = counters.entry(booklet.question_prefix.as_str()).or_insert(0);
        let first_question_num = counter.saturating_add(1);
        *counter = counter.saturating_add(booklet.expected_question_count);

        plans.push(BookletPlan {
            booklet: (*booklet).clone(),
            start_page,
            end_page,
            page_indices,
            first_question_num,
        });
    }

    let unassigned = all_indices
        .into_iter()
        .filter(|&p| kind_of(p) == Some(PageKind::Question) && !claimed.contains(&p))
        .collect();

    Partition { plans, unassigned }
}
