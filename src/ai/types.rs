use serde::{Deserialize, Serialize};

use super::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Falls back to the provider's default model
    pub model: Option<String>,
    pub turns: Vec<ChatTurn>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// Wire formats. Only the OpenAI-compatible shapes are accepted.

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionBody<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatTurn],
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextCompletionBody<'a> {
    pub model: &'a str,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextCompletionResponse {
    model: Option<String>,
    choices: Vec<TextChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

fn non_empty(content: Option<String>) -> Result<String, AiError> {
    match content.map(|c| c.trim().to_string()) {
        Some(c) if !c.is_empty() => Ok(c),
        _ => Err(AiError::EmptyContent),
    }
}

/// Parses `choices[0].message.content` from a chat completion body.
pub fn parse_chat_completion(body: &str, requested_model: &str) -> Result<Completion, AiError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| AiError::Parse(e.to_string()))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AiError::Parse("response contained no choices".to_string()))?;

    Ok(Completion {
        content: non_empty(choice.message.content)?,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        usage: parsed.usage,
    })
}

/// Parses `choices[0].text` from a legacy text completion body.
pub fn parse_text_completion(body: &str, requested_model: &str) -> Result<Completion, AiError> {
    let parsed: TextCompletionResponse =
        serde_json::from_str(body).map_err(|e| AiError::Parse(e.to_string()))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AiError::Parse("response contained no choices".to_string()))?;

    Ok(Completion {
        content: non_empty(Some(choice.text))?,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        usage: parsed.usage,
    })
}

pub fn parse_model_list(body: &str) -> Result<Vec<String>, AiError> {
    let parsed: ModelList = serde_json::from_str(body).map_err(|e| AiError::Parse(e.to_string()))?;
    Ok(parsed.data.into_iter().map(|m| m.id).collect())
}

/// Flattens chat turns into a single prompt for text-completion endpoints.
pub fn flatten_turns(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        let label = match turn.role {
            ChatRole::System => "System",
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Assistant:");
    prompt
}
