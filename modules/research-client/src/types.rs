use serde::{Deserialize, Serialize};

use crate::job::JobHandle;

// --- Submission ---

/// Body of `POST /interactions`.
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRequest<'a> {
    pub agent: &'a str,
    pub input: InteractionInput<'a>,
    /// Required for long-running agents; the call returns as soon as the job is queued.
    pub background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<AgentConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionInput<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: &'a str,
}

/// Optional structured-output request for the research agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub schema: serde_json::Value,
}

impl AgentConfig {
    pub fn json_output(schema: serde_json::Value) -> Self {
        Self {
            kind: "deep-research",
            output_format: OutputFormat {
                kind: "json",
                schema,
            },
        }
    }
}

// --- Interaction resource ---

/// An interaction as returned by both the submit and the get endpoints.
///
/// Every field is optional on the wire; the client validates what it needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interaction {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<InteractionOutput>,
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Either a plain string or an object with a `message` field.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractionOutput {
    #[serde(default)]
    pub parts: Vec<OutputPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(rename = "inputTokenCount", default)]
    pub input_token_count: u64,
    #[serde(rename = "outputTokenCount", default)]
    pub output_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: u64,
}

impl Interaction {
    /// Concatenated text of every output part.
    pub fn output_text(&self) -> String {
        self.output
            .as_ref()
            .map(|o| {
                o.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Object(map)) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
            Some(other) if !other.is_null() => other.to_string(),
            _ => "Unknown error".to_string(),
        }
    }
}

/// Error envelope returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

// --- Results ---

/// Token accounting reported by the agent. Recorded verbatim; zero counts are
/// not interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<&Usage> for TokenUsage {
    fn from(u: &Usage) -> Self {
        Self {
            input_tokens: u.input_token_count,
            output_tokens: u.output_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

/// The output of a completed research job.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub handle: JobHandle,
    pub text: String,
    /// `text` parsed as JSON when it is JSON (code fences tolerated).
    pub json: Option<serde_json::Value>,
    pub usage: TokenUsage,
}

impl RawResult {
    pub fn from_interaction(handle: JobHandle, interaction: &Interaction) -> Self {
        let text = interaction.output_text();
        let json = serde_json::from_str(strip_code_blocks(&text)).ok();
        Self {
            handle,
            json,
            usage: interaction
                .usage
                .as_ref()
                .map(TokenUsage::from)
                .unwrap_or_default(),
            text,
        }
    }
}

fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
