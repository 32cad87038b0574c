//! Answer-key extraction: one oracle call over every answer page.
//!
//! Whether an answer comes back as text or as an image region is the
//! oracle's call and is accepted as given. Locally the entries are only
//! tidied: text is flattened onto one line, image regions get their page
//! index remapped and their span clamped. There is no retry and no
//! completeness check against the question count.

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::oracle::{call_oracle, LabeledImage, Oracle, OracleRequest, OracleTask};
use crate::output::{AnswerEntry, PageKind, StructureResult};
use crate::pipeline::decode::decode_answers;
use crate::pipeline::partition::BookletPlan;
use crate::pipeline::remap::PageIndexRemapper;
use crate::pipeline::sanitize::flatten_lines;
use crate::prompts::{answer_prompt, AnswerPageContext};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the answer task produced.
#[derive(Debug, Clone, Default)]
pub struct AnswerOutcome {
    pub answers: BTreeMap<String, AnswerEntry>,
    /// Set when the call failed or the reply could not be read.
    pub problem: Option<String>,
    pub raw_excerpt: String,
    pub oracle_calls: u32,
}

/// Describe each answer page by the booklet its label points at.
pub fn answer_context(structure: &StructureResult, plans: &[BookletPlan]) -> Vec<AnswerPageContext> {
    structure
        .pages
        .iter()
        .filter(|p| p.kind() == PageKind::Answer)
        .map(|p| {
            let label = p.paper_label.as_deref().map(str::trim).filter(|l| !l.is_empty());
            let plan = label.and_then(|l| find_plan(plans, l));
            AnswerPageContext {
                page_index: p.index,
                booklet: plan.map(|pl| pl.label().to_string()).or_else(|| label.map(str::to_string)),
                prefix: plan.map(|pl| pl.prefix().to_string()),
            }
        })
        .collect()
}

fn find_plan<'a>(plans: &'a [BookletPlan], label: &str) -> Option<&'a BookletPlan> {
    let wanted = label.to_lowercase();
    plans
        .iter()
        .find(|pl| pl.label().to_lowercase() == wanted)
        .or_else(|| {
            plans.iter().find(|pl| {
                let have = pl.label().to_lowercase();
                !have.is_empty() && (wanted.contains(&have) || have.contains(&wanted))
            })
        })
}

/// Extract the answer key from the answer pages.
pub async fn extract_answers(
    oracle: &dyn Oracle,
    images: Vec<LabeledImage>,
    context: &[AnswerPageContext],
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> AnswerOutcome {
    if images.is_empty() {
        info!("Answers: no answer pages");
        return AnswerOutcome::default();
    }

    let remapper = PageIndexRemapper::new(&images.iter().map(|i| i.page_index).collect::<Vec<_>>());
    let request = OracleRequest::new(
        OracleTask::Answers,
        images,
        answer_prompt(context, &config.answer_separator),
    );

    let raw = match call_oracle(oracle, &request, Duration::from_secs(config.api_timeout_secs), cancel).await {
        Ok(raw) => raw,
        Err(e) => {
            return AnswerOutcome {
                problem: Some(format!("answer extraction failed: {e}")),
                oracle_calls: 1,
                ..Default::default()
            }
        }
    };

    match decode_answers(&raw, &config.answer_separator) {
        Ok(entries) => {
            let answers = normalise_answers(entries, &remapper, &config.answer_separator);
            info!("Answers: {} entr(ies) extracted", answers.len());
            AnswerOutcome {
                answers,
                problem: None,
                raw_excerpt: config.excerpt(&raw),
                oracle_calls: 1,
            }
        }
        Err(e) => {
            warn!("Answers: {}", e);
            AnswerOutcome {
                problem: Some(format!("answer response could not be read: {}", e.detail)),
                raw_excerpt: config.excerpt(&raw),
                oracle_calls: 1,
                ..Default::default()
            }
        }
    }
}

/// Tidy decoded entries into the final answer map.
///
/// The first entry for a question number wins.
pub fn normalise_answers(
    entries: Vec<(String, AnswerEntry)>,
    remapper: &PageIndexRemapper,
    separator: &str,
) -> BTreeMap<String, AnswerEntry> {
    let mut out = BTreeMap::new();
    for (key, entry) in entries {
        let key = key.trim().to_string();
        if key.is_empty() {
            warn!("Answers: entry without a question number dropped");
            continue;
        }
        let Some(entry) = normalise_entry(&key, entry, remapper, separator) else {
            continue;
        };
        if out.contains_key(&key) {
            warn!("Answers: duplicate answer for {} ignored", key);
            continue;
        }
        out.insert(key, entry);
    }
    out
}

fn normalise_entry(
    key: &str,
    entry: AnswerEntry,
    remapper: &PageIndexRemapper,
    separator: &str,
) -> Option<AnswerEntry> {
    match entry {
        AnswerEntry::Text { value } => {
            let value = flatten_lines(&value, separator);
            if value.is_empty() {
                warn!("Answers: empty text for {} dropped", key);
                None
            } else {
                Some(AnswerEntry::Text { value })
            }
        }
        AnswerEntry::ImageRegion {
            page_index,
            y_start_pct,
            y_end_pct,
            value,
        } => {
            let value = value.map(|v| flatten_lines(&v, separator)).filter(|v| !v.is_empty());
            let start = y_start_pct.clamp(0.0, 100.0);
            let end = y_end_pct.clamp(0.0, 100.0);
            let span_ok = y_start_pct.is_finite() && y_end_pct.is_finite() && start < end;

            match (remapper.remap(page_index), span_ok) {
                (Some(index), true) => {
                    if index != page_index {
                        debug!("Answers: {} page index {} remapped to {}", key, page_index, index);
                    }
                    Some(AnswerEntry::ImageRegion {
                        page_index: index,
                        y_start_pct: start,
                        y_end_pct: end,
                        value,
                    })
                }
                (index, _) => {
                    let why = if index.is_none() {
                        format!("page {} was not an answer page", page_index)
                    } else {
                        format!("span {}–{} is empty", y_start_pct, y_end_pct)
                    };
                    match value {
                        Some(value) => {
                            warn!("Answers: image region for {} unusable ({}); kept as text", key, why);
                            Some(AnswerEntry::Text { value })
                        }
                        None => {
                            warn!("Answers: image region for {} unusable ({}); dropped", key, why);
                            None
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::output::{Booklet, Page, PaperHeader};
    use async_trait::async_trait;
    use edgequake_llm::ImageData;

    fn region(page_index: usize, a: f64, b: f64, value: Option<&str>) -> AnswerEntry {
        AnswerEntry::ImageRegion {
            page_index,
            y_start_pct: a,
            y_end_pct: b,
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn text_is_flattened_and_regions_remapped() {
        let remapper = PageIndexRemapper::new(&[9, 10]);
        let out = normalise_answers(
            vec![
                ("1".into(), AnswerEntry::Text { value: "x = 2\ny = 3".into() }),
                ("2".into(), region(1, 20.0, 35.0, None)),
                ("3".into(), region(9, -3.0, 140.0, Some("graph"))),
            ],
            &remapper,
            " | ",
        );
        assert_eq!(out["1"], AnswerEntry::Text { value: "x = 2 | y = 3".into() });
        assert_eq!(out["2"], region(10, 20.0, 35.0, None));
        assert_eq!(out["3"], region(9, 0.0, 100.0, Some("graph")));
    }

    #[test]
    fn unusable_regions_degrade_or_drop() {
        let remapper = PageIndexRemapper::new(&[9]);
        let out = normalise_answers(
            vec![
                ("1".into(), region(9, 50.0, 40.0, Some("a triangle"))),
                ("2".into(), region(42, 10.0, 20.0, None)),
                ("3".into(), AnswerEntry::Text { value: " \n ".into() }),
            ],
            &remapper,
            " | ",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out["1"], AnswerEntry::Text { value: "a triangle".into() });
    }

    #[test]
    fn first_duplicate_wins() {
        let remapper = PageIndexRemapper::new(&[0]);
        let out = normalise_answers(
            vec![
                ("4".into(), AnswerEntry::Text { value: "A".into() }),
                (" 4 ".into(), AnswerEntry::Text { value: "B".into() }),
            ],
            &remapper,
            " | ",
        );
        assert_eq!(out["4"], AnswerEntry::Text { value: "A".into() });
    }

    fn plan(label: &str, prefix: &str) -> BookletPlan {
        BookletPlan {
            booklet: Booklet {
                label: label.into(),
                question_prefix: prefix.into(),
                expected_question_count: 5,
                first_question_page_index: 0,
                first_question_y_start_pct: 0.0,
                sections: Vec::new(),
            },
            start_page: 0,
            end_page: Some(0),
            page_indices: vec![0],
            first_question_num: 1,
        }
    }

    #[test]
    fn context_matches_page_labels_to_booklets() {
        let structure = StructureResult {
            header: PaperHeader::default(),
            pages: vec![
                Page {
                    index: 8,
                    is_answer_sheet: true,
                    is_cover_page: false,
                    paper_label: Some("paper 2".into()),
                },
                Page {
                    index: 9,
                    is_answer_sheet: true,
                    is_cover_page: false,
                    paper_label: None,
                },
                Page::question(1),
            ],
            booklets: Vec::new(),
        };
        let ctx = answer_context(&structure, &[plan("Paper 1", ""), plan("Paper 2", "P2-")]);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].booklet.as_deref(), Some("Paper 2"));
        assert_eq!(ctx[0].prefix.as_deref(), Some("P2-"));
        assert_eq!(ctx[1].booklet, None);
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Oracle for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn infer(&self, req: &OracleRequest) -> Result<String, OracleError> {
            assert_eq!(req.task, OracleTask::Answers);
            Ok(self.0.to_string())
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

    #[tokio::test]
    async fn unreadable_reply_is_a_problem_not_an_error() {
        let config = ExtractionConfig::default();
        let out = extract_answers(&Fixed("no answers here"), images(&[9]), &[], &config, &CancelToken::new()).await;
        assert!(out.answers.is_empty());
        assert!(out.problem.is_some());
    }

    #[tokio::test]
    async fn reply_is_decoded() {
        let config = ExtractionConfig::default();
        let out = extract_answers(
            &Fixed(r#"{"answers": {"1": "B", "2": {"type": "imageRegion", "pageIndex": 0, "yStartPct": 5, "yEndPct": 25}}}"#),
            images(&[9]),
            &[],
            &config,
            &CancelToken::new(),
        )
        .await;
        assert_eq!(out.problem, None);
        assert_eq!(out.answers.len(), 2);
        assert_eq!(out.answers["2"], region(9, 5.0, 25.0, None));
    }

    #[tokio::test]
    async fn no_answer_pages_skips_the_call() {
        let config = ExtractionConfig::default();
        let out = extract_answers(&Fixed("unused"), Vec::new(), &[], &config, &CancelToken::new()).await;
        assert_eq!(out.oracle_calls, 0);
    }
}
