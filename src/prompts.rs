//! Instruction templates for every oracle call.
//!
//! All prompt text lives here so the pipeline stages only deal with
//! requests and replies. Every template asks for JSON only; the decoders in
//! [`crate::pipeline::decode`] still accept a range of shapes because models
//! do not always comply.

use crate::output::{Section, SectionKind, ValidationIssue};

/// Structure analysis over every page of the document.
pub const STRUCTURE_PROMPT: &str = r#"You are analysing a scanned school examination paper. Each attached image is one page; the user message tells you which ORIGINAL page index each image has. Always use those original indices.

Classify EVERY page exactly once:
- cover page: instructions or header text, no numbered questions
- answer sheet: an answer key or marking scheme
- question page: anything else that contains numbered questions

Then identify the booklets (papers). A booklet is a run of question pages with its own numbering. Booklets that continue one numbering sequence share the same question prefix; booklets that restart at 1 must use different prefixes (use "" for the first group, then e.g. "B", "P2-").

Return ONLY JSON of this shape, no commentary:
{
  "header": {"school": "", "subject": "", "level": "", "title": "", "year": "", "totalMarks": 0, "duration": ""},
  "pages": [
    {"pageIndex": 0, "isAnswerSheet": false, "isCoverPage": true, "paperLabel": "Booklet A"}
  ],
  "booklets": [
    {
      "label": "Booklet A",
      "questionPrefix": "",
      "expectedQuestionCount": 30,
      "firstQuestionPageIndex": 1,
      "firstQuestionYStartPct": 12.5,
      "sections": [{"name": "Section A", "type": "MCQ", "marks": 30, "questionCount": 30}]
    }
  ]
}

Rules:
- "pages" must contain one entry per attached image.
- "expectedQuestionCount" counts top-level questions only; sub-parts (a), (b), (i) do not count.
- "firstQuestionYStartPct" is the vertical position of the booklet's first question label, in percent of page height (0 = top, 100 = bottom)."#;

/// Context handed to [`question_prompt`] for one booklet.
#[derive(Debug, Clone)]
pub struct BookletPromptContext<'a> {
    pub label: &'a str,
    pub prefix: &'a str,
    pub first_question: u32,
    pub expected_count: u32,
    pub first_question_y_start_pct: f64,
    pub sections: &'a [Section],
}

/// Question-boundary extraction for one booklet.
pub fn question_prompt(ctx: &BookletPromptContext<'_>) -> String {
    let first = format!("{}{}", ctx.prefix, ctx.first_question);
    let range = if ctx.expected_count > 0 {
        let last = ctx.first_question.saturating_add(ctx.expected_count - 1);
        format!(
            "This booklet should contain {} questions, numbered {} to {}{}.",
            ctx.expected_count, first, ctx.prefix, last
        )
    } else {
        format!("Numbering in this booklet starts at {}.", first)
    };

    let sections = if ctx.sections.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = ctx.sections.iter().map(describe_section).collect();
        format!("\nSections:\n{}\n", lines.join("\n"))
    };

    let prefix_rule = if ctx.prefix.is_empty() {
        "Write question numbers as plain numbers, e.g. \"7\".".to_string()
    } else {
        format!(
            "Write every question number with the prefix \"{}\", e.g. \"{}\".",
            ctx.prefix, first
        )
    };

    format!(
        r#"You are locating every question in "{label}" of a scanned examination paper. The user message tells you the ORIGINAL page index of each attached image; use those indices in "pageIndex".

{range}
The first question starts at about {y:.0}% of the height of its page.
{sections}
Boundary rule:
- A question's crop starts at its own number label and ends at the next question's number label (or the bottom of the content on that page).
- Sub-part labels such as (a), (b), (i), (ii) are NEVER boundaries.
- A question that continues onto the next page gets a second entry with the same number, as the FIRST entry of that page. Any other repeated number is an error.
- Percentages run from 0 (top of the page) to 100 (bottom), and yStartPct must be smaller than yEndPct.

{prefix_rule}

Return ONLY JSON, no commentary:
{{"pages": [{{"pageIndex": 3, "questions": [{{"questionNum": "{first}", "yStartPct": 10.0, "yEndPct": 42.5, "boundaryTopLabel": "{first}", "boundaryBottomLabel": "next question label"}}]}}]}}
Include every attached page, with an empty "questions" list when a page has none."#,
        label = ctx.label,
        range = range,
        y = ctx.first_question_y_start_pct,
        sections = sections,
        prefix_rule = prefix_rule,
        first = first,
    )
}

fn describe_section(s: &Section) -> String {
    let kind = match s.kind {
        SectionKind::Mcq => "multiple choice",
        SectionKind::Structured => "structured",
        SectionKind::Other => "other",
    };
    let mut line = format!("- {} ({})", s.name, kind);
    if let Some(n) = s.question_count {
        line.push_str(&format!(", {} questions", n));
    }
    if let Some(m) = s.marks {
        line.push_str(&format!(", {} marks", m));
    }
    line
}

/// Feedback for a booklet retry, listing each problem found.
pub fn retry_feedback(label: &str, issues: &[ValidationIssue]) -> String {
    let problems: Vec<String> = issues.iter().map(|i| format!("- {}", i.detail)).collect();
    format!(
        "Your answer for \"{label}\" has these numbering problems:\n{}\n\n\
        Look at the pages again and return the COMPLETE corrected JSON for every page, \
        in the same shape as before. Keep the boundaries of questions you already located \
        exactly as they were unless they were wrong; only add the missing questions and \
        fix the numbering. Boundary quality matters as much as coverage.",
        problems.join("\n")
    )
}

/// One line of answer-page context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerPageContext {
    pub page_index: usize,
    pub booklet: Option<String>,
    pub prefix: Option<String>,
}

/// Answer-key extraction over all answer pages.
pub fn answer_prompt(context: &[AnswerPageContext], separator: &str) -> String {
    let lines: Vec<String> = context
        .iter()
        .map(|c| match (&c.booklet, &c.prefix) {
            (Some(b), Some(p)) if !p.is_empty() => format!(
                "- original page {}: answers for \"{}\"; write question numbers with the prefix \"{}\"",
                c.page_index, b, p
            ),
            (Some(b), _) => format!("- original page {}: answers for \"{}\"", c.page_index, b),
            (None, _) => format!("- original page {}: booklet unknown", c.page_index),
        })
        .collect();

    format!(
        r#"You are reading the answer key of a scanned examination paper.

Answer pages:
{context}

For every answer, decide how to represent it:
- as text when it is a value, word, option letter or short working. Join multiple lines with "{sep}"; never use raw line breaks.
- as an image region when it is a diagram, graph, table or drawing. Give the ORIGINAL page index and the vertical span in percent of page height.

Return ONLY JSON keyed by question number, no commentary:
{{"answers": {{"1": {{"type": "text", "value": "B"}}, "2": {{"type": "imageRegion", "pageIndex": 9, "yStartPct": 20.0, "yEndPct": 35.0, "value": "graph of y = 2x"}}}}}}"#,
        context = lines.join("\n"),
        sep = separator,
    )
}

/// Re-locate a single question on one page.
pub fn single_question_prompt(question_num: &str, previous: Option<&str>, next: Option<&str>) -> String {
    let mut ctx = Vec::new();
    if let Some(p) = previous {
        ctx.push(format!("The question before it is \"{p}\"; its region ends where \"{question_num}\" starts."));
    }
    if let Some(n) = next {
        ctx.push(format!("The question after it is \"{n}\"; \"{question_num}\" ends where \"{n}\" starts."));
    }
    format!(
        r#"Locate question "{question_num}" on the attached page of a scanned examination paper.
{ctx}
The region starts at the question's own number label. Sub-part labels such as (a) or (i) are never boundaries.

Return ONLY JSON, no commentary:
{{"questionNum": "{question_num}", "yStartPct": 10.0, "yEndPct": 40.0, "boundaryTopLabel": "{question_num}", "boundaryBottomLabel": "next label"}}"#,
        ctx = ctx.join("\n"),
    )
}

/// Re-read a single answer from one answer page.
pub fn single_answer_prompt(question_num: &str, separator: &str) -> String {
    format!(
        r#"Read the answer to question "{question_num}" from the attached answer-key page.

Use text for values, words, option letters or short working, joining lines with "{separator}"; never use raw line breaks. Use an image region for diagrams, graphs or tables.

Return ONLY JSON, no commentary, either
{{"type": "text", "value": "..."}}
or
{{"type": "imageRegion", "pageIndex": 9, "yStartPct": 20.0, "yEndPct": 35.0, "value": "short description"}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::IssueKind;

    fn ctx<'a>(prefix: &'a str, first: u32, count: u32, sections: &'a [Section]) -> BookletPromptContext<'a> {
        BookletPromptContext {
            label: "Booklet B",
            prefix,
            first_question: first,
            expected_count: count,
            first_question_y_start_pct: 15.0,
            sections,
        }
    }

    #[test]
    fn question_prompt_states_range_and_rule() {
        let p = question_prompt(&ctx("", 31, 14, &[]));
        assert!(p.contains("14 questions, numbered 31 to 44"), "{p}");
        assert!(p.contains("Sub-part labels"));
        assert!(p.contains("Booklet B"));
    }

    #[test]
    fn question_prompt_mentions_prefix() {
        let p = question_prompt(&ctx("P2-", 1, 5, &[]));
        assert!(p.contains("numbered P2-1 to P2-5"), "{p}");
        assert!(p.contains("prefix \"P2-\""));
    }

    #[test]
    fn question_prompt_lists_sections() {
        let sections = vec![Section {
            name: "Section A".into(),
            kind: SectionKind::Mcq,
            marks: Some(20.0),
            question_count: Some(10),
        }];
        let p = question_prompt(&ctx("", 1, 10, &sections));
        assert!(p.contains("- Section A (multiple choice), 10 questions, 20 marks"), "{p}");
    }

    #[test]
    fn question_prompt_survives_an_absurd_count() {
        let p = question_prompt(&ctx("", 2, u32::MAX, &[]));
        assert!(p.contains(&format!("numbered 2 to {}", u32::MAX)), "{p}");
        assert!(p.contains("FIRST entry of that page"));
    }

    #[test]
    fn unknown_count_only_gives_the_start() {
        let p = question_prompt(&ctx("", 1, 0, &[]));
        assert!(p.contains("starts at 1"));
    }

    #[test]
    fn feedback_lists_every_issue() {
        let issues = vec![
            ValidationIssue {
                booklet: "Booklet A".into(),
                kind: IssueKind::Gap,
                detail: "missing questions: 5, 6".into(),
                numbers: vec![5, 6],
            },
            ValidationIssue {
                booklet: "Booklet A".into(),
                kind: IssueKind::WrongFirst,
                detail: "first question should be 31 but got 32".into(),
                numbers: vec![32],
            },
        ];
        let f = retry_feedback("Booklet A", &issues);
        assert!(f.contains("- missing questions: 5, 6"));
        assert!(f.contains("- first question should be 31 but got 32"));
        assert!(f.contains("Boundary quality"));
    }

    #[test]
    fn answer_prompt_carries_context_and_separator() {
        let p = answer_prompt(
            &[
                AnswerPageContext {
                    page_index: 9,
                    booklet: Some("Paper 2".into()),
                    prefix: Some("P2-".into()),
                },
                AnswerPageContext {
                    page_index: 10,
                    booklet: None,
                    prefix: None,
                },
            ],
            " | ",
        );
        assert!(p.contains("original page 9: answers for \"Paper 2\""));
        assert!(p.contains("prefix \"P2-\""));
        assert!(p.contains("original page 10: booklet unknown"));
        assert!(p.contains("\" | \""));
    }

    #[test]
    fn single_question_prompt_uses_neighbours() {
        let p = single_question_prompt("7", Some("6"), Some("8"));
        assert!(p.contains("question before it is \"6\""));
        assert!(p.contains("question after it is \"8\""));
        let p = single_question_prompt("1", None, None);
        assert!(!p.contains("before it"));
    }
}
