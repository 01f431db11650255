use serde::{Deserialize, Serialize};

use crate::error::ReviewError;

const REVIEW_INSTRUCTION: &str = "You are an expert software engineer and code reviewer. \
Provide a comprehensive, constructive review of the provided code. \
Focus on:\n\
1. Code correctness and potential bugs\n\
2. Code style and readability\n\
3. Performance considerations\n\
4. Security concerns\n\
5. Best practices and improvements\n\
6. Documentation and comments\n\n\
Format your response in clear, structured markdown.";

const FOLLOWUP_INSTRUCTION: &str = "You are continuing a code review conversation. \
Use the previous review as context and answer the user's follow-up question \
in a helpful and detailed manner.";

/// Appended to code that was cut to fit the conversation budget.
pub const CODE_TRUNCATION_MARKER: &str = "\n\n# ... (truncated for length) ...";

/// Prepended to a prior review that was cut to its most recent part.
pub const REVIEW_TRUNCATION_MARKER: &str = "...\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of one chat request. Always streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestPayload {
    pub model: String,
    pub stream: bool,
    pub messages: Vec<Message>,
}

impl RequestPayload {
    fn new(model: &str, messages: Vec<Message>) -> Self {
        Self {
            model: model.to_string(),
            stream: true,
            messages,
        }
    }
}

/// Builds review and follow-up conversations for one model, capping the
/// variable parts at half the conversation budget each.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    model: String,
    max_conversation_length: usize,
}

impl PromptBuilder {
    pub fn new(model: impl Into<String>, max_conversation_length: usize) -> Self {
        Self {
            model: model.into(),
            max_conversation_length,
        }
    }

    /// Character cap applied to the code, or to the prior review.
    pub fn part_budget(&self) -> usize {
        self.max_conversation_length / 2
    }

    pub fn review(&self, code: &str) -> Result<RequestPayload, ReviewError> {
        if code.trim().is_empty() {
            return Err(ReviewError::Validation(
                "No code provided for review".to_string(),
            ));
        }

        let budget = self.part_budget();
        let code = match keep_head(code, budget) {
            Some(head) => {
                tracing::warn!(budget, "code truncated to fit conversation budget");
                format!("{head}{CODE_TRUNCATION_MARKER}")
            }
            None => code.to_string(),
        };

        Ok(RequestPayload::new(
            &self.model,
            vec![
                Message::system(REVIEW_INSTRUCTION),
                Message::user(format!(
                    "Please review the following code:\n\n```\n{code}\n```"
                )),
            ],
        ))
    }

    pub fn followup(
        &self,
        original_review: &str,
        question: &str,
    ) -> Result<RequestPayload, ReviewError> {
        if question.trim().is_empty() {
            return Err(ReviewError::Validation(
                "No question provided for follow-up".to_string(),
            ));
        }

        let budget = self.part_budget();
        let review = match keep_tail(original_review, budget) {
            Some(tail) => {
                tracing::warn!(budget, "review truncated to its most recent part");
                format!("{REVIEW_TRUNCATION_MARKER}{tail}")
            }
            None => original_review.to_string(),
        };

        Ok(RequestPayload::new(
            &self.model,
            vec![
                Message::system(FOLLOWUP_INSTRUCTION),
                Message::user(format!("Previous review:\n\n{review}")),
                Message::user(format!("Follow-up question: {question}")),
            ],
        ))
    }
}

/// First `max_chars` characters of `text`, or `None` if it already fits.
fn keep_head(text: &str, max_chars: usize) -> Option<&str> {
    let (cut, _) = text.char_indices().nth(max_chars)?;
    Some(&text[..cut])
}

/// Last `max_chars` characters of `text`, or `None` if it already fits.
fn keep_tail(text: &str, max_chars: usize) -> Option<&str> {
    let total = text.chars().count();
    if total <= max_chars {
        return None;
    }
    if max_chars == 0 {
        return Some("");
    }
    let (start, _) = text.char_indices().nth(total - max_chars)?;
    Some(&text[start..])
}
