//! Single-question and single-answer re-extraction.
//!
//! Used after a run when the report shows one question with a bad crop or a
//! missing answer: the caller sends one page and the question number (plus
//! its neighbours for context) instead of re-running the whole document.
//! Unlike the batch stages these calls return `Err` on failure, since there
//! is nothing else to fall back on.

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::{ExtractError, OracleError, Stage};
use crate::oracle::{call_oracle, LabeledImage, Oracle, OracleRequest, OracleTask};
use crate::output::{AnswerEntry, Question};
use crate::pipeline::answers::normalise_answers;
use crate::pipeline::decode::{answer_from_value, decode_answers, decode_question_pages, parse_json};
use crate::pipeline::remap::PageIndexRemapper;
use crate::prompts::{single_answer_prompt, single_question_prompt};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Neighbouring question numbers that bound the one being re-extracted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionContext {
    pub previous: Option<String>,
    pub next: Option<String>,
}

/// Locate one question on one page.
pub async fn reextract_question(
    oracle: &dyn Oracle,
    page: LabeledImage,
    question_num: &str,
    context: &QuestionContext,
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<Question, ExtractError> {
    let instruction = single_question_prompt(question_num, context.previous.as_deref(), context.next.as_deref());
    let req = OracleRequest::new(
        OracleTask::SingleQuestion {
            question_num: question_num.to_string(),
        },
        vec![page],
        instruction,
    );
    let raw = call(oracle, &req, config, cancel, Stage::SingleQuestion).await?;

    let unreadable = |detail: String| ExtractError::ResponseUnreadable {
        stage: Stage::SingleQuestion,
        detail,
        excerpt: config.excerpt(&raw),
    };

    let mut question = decode_single_question(&raw, question_num, config).map_err(unreadable)?;
    question.question_num = question_num.to_string();
    let question = question
        .normalised()
        .ok_or_else(|| ExtractError::ResponseUnreadable {
            stage: Stage::SingleQuestion,
            detail: "question span is empty".to_string(),
            excerpt: config.excerpt(&raw),
        })?;

    info!(
        "Question {}: {:.1}%–{:.1}%",
        question_num, question.y_start_pct, question.y_end_pct
    );
    Ok(question)
}

/// A bare question object, a single-element page list, or a list in which
/// one entry carries the requested number.
fn decode_single_question(raw: &str, question_num: &str, config: &ExtractionConfig) -> Result<Question, String> {
    let value = parse_json(raw, &config.answer_separator).map_err(|e| format!("not valid JSON: {e}"))?;

    let candidate = match &value {
        Value::Object(obj) if obj.contains_key("yStartPct") => Some(value.clone()),
        Value::Object(obj) => obj.get("question").filter(|v| v.is_object()).cloned(),
        _ => None,
    };
    if let Some(v) = candidate {
        return serde_json::from_value::<Question>(v).map_err(|e| e.to_string());
    }

    let pages = decode_question_pages(raw, &config.answer_separator).map_err(|e| e.detail)?;
    let all: Vec<Question> = pages.into_iter().flat_map(|p| p.questions).collect();
    let wanted = question_num.trim();
    match all.iter().position(|q| q.question_num.trim().eq_ignore_ascii_case(wanted)) {
        Some(i) => Ok(all[i].clone()),
        None if all.len() == 1 => Ok(all[0].clone()),
        None => Err(format!("no entry for question {wanted} among {} returned", all.len())),
    }
}

/// Read one answer from one answer page.
pub async fn reextract_answer(
    oracle: &dyn Oracle,
    page: LabeledImage,
    question_num: &str,
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<AnswerEntry, ExtractError> {
    let remapper = PageIndexRemapper::new(&[page.page_index]);
    let req = OracleRequest::new(
        OracleTask::SingleAnswer {
            question_num: question_num.to_string(),
        },
        vec![page],
        single_answer_prompt(question_num, &config.answer_separator),
    );
    let raw = call(oracle, &req, config, cancel, Stage::SingleAnswer).await?;

    let unreadable = |detail: String| ExtractError::ResponseUnreadable {
        stage: Stage::SingleAnswer,
        detail,
        excerpt: config.excerpt(&raw),
    };

    let entry = decode_single_answer(&raw, question_num, config).map_err(unreadable)?;
    normalise_answers(vec![(question_num.to_string(), entry)], &remapper, &config.answer_separator)
        .into_values()
        .next()
        .ok_or_else(|| unreadable("answer entry was empty or pointed outside the page".to_string()))
}

fn decode_single_answer(raw: &str, question_num: &str, config: &ExtractionConfig) -> Result<AnswerEntry, String> {
    let value = parse_json(raw, &config.answer_separator).map_err(|e| format!("not valid JSON: {e}"))?;
    if let Value::Object(obj) = &value {
        if obj.contains_key("type") || obj.contains_key("yStartPct") {
            return answer_from_value(&value).ok_or_else(|| "answer object is incomplete".to_string());
        }
    }

    let entries = decode_answers(raw, &config.answer_separator).map_err(|e| e.detail)?;
    let wanted = question_num.trim();
    let found = entries
        .iter()
        .position(|(k, _)| k.eq_ignore_ascii_case(wanted))
        .or_else(|| (entries.len() == 1).then_some(0));
    match found {
        Some(i) => Ok(entries[i].1.clone()),
        None => Err(format!("no answer for question {wanted} among {} returned", entries.len())),
    }
}

async fn call(
    oracle: &dyn Oracle,
    req: &OracleRequest,
    config: &ExtractionConfig,
    cancel: &CancelToken,
    stage: Stage,
) -> Result<String, ExtractError> {
    call_oracle(oracle, req, Duration::from_secs(config.api_timeout_secs), cancel)
        .await
        .map_err(|e| match e {
            OracleError::Cancelled => ExtractError::Cancelled,
            source => ExtractError::Oracle { stage, source },
        })
}
