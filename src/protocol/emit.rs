use super::types::{
    ControlRequest, ControlRequestBody, OutboundContent, OutboundContentBlock, OutboundMessage,
    OutboundMessageBody,
};

/// Format a user message as NDJSON for writing to claude's stdin.
///
/// # Errors
///
/// Returns an error if JSON serialization fails (should not happen in practice).
pub fn format_user_message(text: &str) -> serde_json::Result<String> {
    let msg = OutboundMessage {
        r#type: "user".to_string(),
        message: OutboundMessageBody {
            role: "user".to_string(),
            content: OutboundContent::Text(text.to_string()),
        },
    };
    serde_json::to_string(&msg)
}

/// Format the reply to a pending tool invocation (e.g. an answered question).
pub fn format_tool_result(
    tool_use_id: &str,
    content: &str,
    is_error: bool,
) -> serde_json::Result<String> {
    let msg = OutboundMessage {
        r#type: "user".to_string(),
        message: OutboundMessageBody {
            role: "user".to_string(),
            content: OutboundContent::Blocks(vec![OutboundContentBlock::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: content.to_string(),
                is_error,
            }]),
        },
    };
    serde_json::to_string(&msg)
}

/// Format a request asking claude to stop the turn in progress.
pub fn format_interrupt(request_id: &str) -> serde_json::Result<String> {
    let req = ControlRequest {
        r#type: "control_request".to_string(),
        request_id: request_id.to_string(),
        request: ControlRequestBody {
            subtype: "interrupt".to_string(),
        },
    };
    serde_json::to_string(&req)
}
