//! LLM fallback matching over an OpenAI-compatible chat completions API.

use anyhow::Context;

use crate::evaluate::{ExpectedFinding, Finding};

pub const DEFAULT_MODEL: &str = "mistral-small-latest";
const DEFAULT_BASE_URL: &str = "https://api.mistral.ai";

/// The matcher's verdict: one entry per submitted finding, in order.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MatchDecision {
    #[serde(default)]
    pub reasoning: String,
    pub matches: Vec<Option<usize>>,
}

/// Seam for the match exchange. Tests substitute scripted clients.
#[async_trait::async_trait]
pub trait MatchClient: Send + Sync {
    async fn request_matches(&self, model: &str, prompt: &str) -> anyhow::Result<MatchDecision>;
}

/// Builds the matching prompt from residual findings and unclaimed expected
/// entries. Expected keywords are deliberately left out so the model reasons
/// about the descriptions instead of pattern-matching on hints.
pub fn build_match_prompt(findings: &[&Finding], expected: &[(usize, &ExpectedFinding)]) -> String {
    let actual: Vec<serde_json::Value> = findings
        .iter()
        .map(|f| {
            serde_json::json!({
                "category": f.category,
                "severity": f.severity,
                "file": f.file,
                "line_range": [f.line_range.0, f.line_range.1],
                "description": f.description,
            })
        })
        .collect();
    let expected: Vec<serde_json::Value> = expected
        .iter()
        .map(|(index, e)| {
            serde_json::json!({
                "index": index,
                "category": e.category,
                "severity": e.severity,
                "file": e.file,
                "line_range": [e.line_range.0, e.line_range.1],
                "description": e.description,
            })
        })
        .collect();

    format!(
        "You are evaluating a code review tool. Match each actual finding to the \
         expected finding it corresponds to.\n\n\
         Expected findings:\n{expected}\n\n\
         Actual findings:\n{actual}\n\n\
         For each actual finding (in order), output the `index` of the matching \
         expected finding, or null if it does not match any of them.\n\
         Respond with JSON: {{\"reasoning\": \"<brief justification>\", \
         \"matches\": [0, null, ...]}}",
        expected = serde_json::to_string_pretty(&expected).unwrap_or_default(),
        actual = serde_json::to_string_pretty(&actual).unwrap_or_default(),
    )
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(serde::Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Chat-completions client for the Mistral API.
pub struct MistralClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl MistralClient {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, api_key, base_url: DEFAULT_BASE_URL.to_owned() })
    }

    #[allow(unused)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait::async_trait]
impl MatchClient for MistralClient {
    async fn request_matches(&self, model: &str, prompt: &str) -> anyhow::Result<MatchDecision> {
        if self.api_key.is_empty() {
            anyhow::bail!("MISTRAL_API_KEY not set in environment or env file");
        }

        let request = ChatRequest {
            model,
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("matcher request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("matcher request failed with {status}: {body}");
        }

        let chat: ChatResponse =
            response.json().await.context("invalid matcher response body")?;
        let content = &chat
            .choices
            .first()
            .ok_or_else(|| anyhow::format_err!("matcher response has no choices"))?
            .message
            .content;
        serde_json::from_str(content)
            .with_context(|| format!("matcher returned malformed JSON: {content}"))
    }
}
