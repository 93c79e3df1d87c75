//! Response generation: prompt construction and chat-completion backends.
//!
//! Plain turns are primed with a persona instruction and two few-shot
//! exemplars; augmented turns use a single grounded prompt that forces the
//! model to answer only from the retrieved context. The orchestrator maps
//! any backend failure to a fixed apology, so nothing here needs to be
//! fault-tolerant beyond returning an error.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One chat-completion message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

const SYSTEM_INSTRUCTION: &str = "\
You are Sotto, a calm, intelligent voice assistant.

Your goals:
- Answer questions clearly and briefly when possible.
- Reason normally about abstract, philosophical, or opinion-based questions.
- Use common sense and general knowledge freely.

Be brief. Be natural. You are speaking out loud, so avoid lists and markup.";

/// Few-shot exemplars: (user input, ideal reply). The first one doubles as
/// the primer attached to the system instruction.
const FEW_SHOT_EXAMPLES: [(&str, &str); 2] = [
    ("What is the capital of France?", "Paris."),
    (
        "Does consciousness come from the brain?",
        "This is a debated topic. Many scientists believe consciousness emerges from brain \
         activity, but there is no single accepted explanation.",
    ),
];

/// Build the primed message list for a plain (non-augmented) turn. The
/// system instruction is merged into the first user message so
/// instruction-tuned models without a system role still see it.
pub fn construct_messages(user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(FEW_SHOT_EXAMPLES.len() * 2 + 1);

    let (first_user, first_reply) = FEW_SHOT_EXAMPLES[0];
    messages.push(ChatMessage::user(format!(
        "{SYSTEM_INSTRUCTION}\n\nUser: {first_user}"
    )));
    messages.push(ChatMessage::assistant(first_reply));

    for (example_user, example_reply) in &FEW_SHOT_EXAMPLES[1..] {
        messages.push(ChatMessage::user(format!("User: {example_user}")));
        messages.push(ChatMessage::assistant(*example_reply));
    }

    messages.push(ChatMessage::user(format!("User: {user_text}")));
    messages
}

/// Build the grounded prompt for an augmented turn: the context is the only
/// information the model may use.
pub fn grounded_prompt(question: &str, context: &str) -> String {
    format!(
        "Context from web search:\n{context}\n\nUser question: {question}\n\n\
         Answer the question using ONLY the context above. Be brief (1-2 sentences). \
         If the context doesn't have the answer, say 'The search results don't contain \
         that information.'"
    )
}

/// Backend for generating replies.
pub trait LlmBackend: Send + Sync {
    /// Generate a reply for a primed message list.
    fn generate(&self, messages: &[ChatMessage]) -> VoiceResult<String>;

    /// Answer `question` using only `context`.
    fn generate_with_context(&self, question: &str, context: &str) -> VoiceResult<String> {
        self.generate(&[ChatMessage::user(grounded_prompt(question, context))])
    }
}

// OpenAI-compatible request/response types.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Remote generation backend: OpenAI-compatible chat completions.
/// Uses `LLM_API_URL` (default https://api.openai.com/v1), `LLM_API_KEY`,
/// and `LLM_MODEL`.
pub struct RemoteLlm {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Chat model name.
    pub model: String,
    client: reqwest::blocking::Client,
}

impl RemoteLlm {
    const MAX_TOKENS: u32 = 512;

    /// Build from environment: LLM_API_URL, LLM_API_KEY, LLM_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("LLM_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| VoiceError::Config("remote LLM requires LLM_API_KEY".to_string()))?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Self::new(base_url, api_key, model)
    }

    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    fn complete(&self, messages: &[ChatMessage], temperature: f32) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens: Self::MAX_TOKENS,
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Llm(format!("LLM API error {status}: {body}")));
        }
        let parsed: ChatResponse = res.json().map_err(|e| VoiceError::Llm(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| VoiceError::Llm("empty choices in LLM response".to_string()))?;
        Ok(content)
    }
}

impl LlmBackend for RemoteLlm {
    fn generate(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        self.complete(messages, 0.6)
    }

    fn generate_with_context(&self, question: &str, context: &str) -> VoiceResult<String> {
        // Lower temperature: grounded answers should stay factual.
        let messages = [ChatMessage::user(grounded_prompt(question, context))];
        self.complete(&messages, 0.3)
    }
}

/// Placeholder LLM for wiring tests: echoes the last user message.
#[derive(Debug, Default)]
pub struct PlaceholderLlm {
    /// If set, returned for every call.
    pub response: Option<String>,
}

impl PlaceholderLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl LlmBackend for PlaceholderLlm {
    fn generate(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let last = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("[generation placeholder] {last}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_messages_end_with_the_user_turn() {
        let messages = construct_messages("what's the weather like");
        assert_eq!(messages.len(), FEW_SHOT_EXAMPLES.len() * 2 + 1);
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.contains("what's the weather like"));
    }

    #[test]
    fn system_instruction_is_merged_into_first_message() {
        let messages = construct_messages("hello");
        assert!(messages[0].content.contains("You are Sotto"));
        assert!(messages[0].content.contains("What is the capital of France?"));
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Paris.");
    }

    #[test]
    fn grounded_prompt_forbids_outside_knowledge() {
        let prompt = grounded_prompt("who won?", "SOURCE 1: ...");
        assert!(prompt.contains("ONLY the context above"));
        assert!(prompt.contains("who won?"));
        assert!(prompt.contains("SOURCE 1"));
    }

    #[test]
    fn placeholder_echoes_last_message() {
        let llm = PlaceholderLlm::new();
        let reply = llm.generate(&construct_messages("ping")).unwrap();
        assert!(reply.contains("ping"));
    }
}
