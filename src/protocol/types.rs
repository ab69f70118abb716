use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result subtype reported when the subprocess exits without emitting a `result` line.
pub const ABNORMAL_TERMINATION: &str = "error_abnormal_termination";

/// Top-level event from claude's stream-json output.
///
/// Unknown `type` tags land in `Unrecognized`; the CLI adds new event kinds
/// between releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "user")]
    ToolResult(UserToolResult),
    #[serde(rename = "result")]
    Result(SessionResult),
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype")]
pub enum SystemEvent {
    #[serde(rename = "init")]
    Init(InitEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitEvent {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Tool names the session may call.
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantMessageBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessageBody {
    #[serde(default)]
    pub content: Vec<AssistantContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserToolResult {
    /// Tool result: can be an object (regular tools), array (MCP tools), or string (errors).
    #[serde(default)]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl SessionResult {
    /// Synthetic terminal result for a process that exited before reporting one.
    pub fn abnormal_termination(code: Option<i32>, signal: Option<i32>) -> Self {
        let detail = match (code, signal) {
            (_, Some(sig)) => format!("claude was killed by signal {sig}"),
            (Some(code), None) => format!("claude exited with code {code}"),
            (None, None) => "claude exited".to_string(),
        };
        Self {
            subtype: ABNORMAL_TERMINATION.to_string(),
            is_error: true,
            total_cost_usd: 0.0,
            num_turns: 0,
            duration_ms: 0,
            result: detail,
            session_id: String::new(),
            usage: None,
        }
    }

    pub fn is_abnormal_termination(&self) -> bool {
        self.subtype == ABNORMAL_TERMINATION
    }
}

/// A user turn written to claude's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub r#type: String,
    pub message: OutboundMessageBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessageBody {
    pub role: String,
    pub content: OutboundContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundContent {
    Text(String),
    Blocks(Vec<OutboundContentBlock>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundContentBlock {
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// Control channel request (stream-json input mode).
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    pub r#type: String,
    pub request_id: String,
    pub request: ControlRequestBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlRequestBody {
    pub subtype: String,
}
