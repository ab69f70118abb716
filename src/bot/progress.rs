//! Text posted into a thread while claude works.

use serde_json::Value;

use crate::protocol::types::SessionResult;

/// Longest chunk of assistant text per message, in chars.
pub const MAX_MESSAGE_CHARS: usize = 3000;

/// One-line progress note for a tool call.
pub fn tool_line(name: &str, input: &Value) -> String {
    let detail = tool_detail(name, input);
    if detail.is_empty() {
        format!("`{name}`")
    } else {
        format!("`{name}` {detail}")
    }
}

/// Compact detail for a tool call, dispatching on tool name.
pub fn tool_detail(name: &str, input: &Value) -> String {
    match name {
        "Read" => get_str(input, "file_path").unwrap_or_default().to_string(),
        "Edit" => {
            let path = get_str(input, "file_path").unwrap_or_default();
            let old_lines = get_str(input, "old_string").map_or(0, |s| s.lines().count());
            let new_lines = get_str(input, "new_string").map_or(0, |s| s.lines().count());
            if old_lines > 0 || new_lines > 0 {
                format!("(+{new_lines}/-{old_lines})  {path}")
            } else {
                path.to_string()
            }
        }
        "Write" => {
            let path = get_str(input, "file_path").unwrap_or_default();
            match get_str(input, "content").map(|c| c.lines().count()) {
                Some(count) => format!("(+{count})  {path}"),
                None => path.to_string(),
            }
        }
        "Glob" => get_str(input, "pattern").unwrap_or_default().to_string(),
        "Grep" => {
            let pattern = get_str(input, "pattern").unwrap_or_default();
            match get_str(input, "path") {
                Some(path) if !path.is_empty() => format!("{pattern}  {path}"),
                _ => pattern.to_string(),
            }
        }
        "Bash" => first_line(get_str(input, "command").unwrap_or_default()).to_string(),
        "Task" => get_str(input, "description")
            .unwrap_or_default()
            .to_string(),
        "WebFetch" => get_str(input, "url").unwrap_or_default().to_string(),
        "WebSearch" => get_str(input, "query").unwrap_or_default().to_string(),
        _ => match input {
            // MCP and other tools: first string field.
            Value::Object(map) => map
                .values()
                .find_map(Value::as_str)
                .map(|s| first_line(s).to_string())
                .unwrap_or_default(),
            _ => String::new(),
        },
    }
}

/// Completion line for a turn, e.g. `Done  $0.12 · 3.4s · 2 turns · 15k tokens`.
pub fn result_line(result: &SessionResult) -> String {
    if result.is_abnormal_termination() {
        return format!("Claude stopped unexpectedly: {}", result.result);
    }
    let rounded = result.duration_ms + 50;
    let whole_secs = rounded / 1000;
    let tenths = (rounded % 1000) / 100;
    let label = if result.subtype == "success" && !result.is_error {
        "Done"
    } else {
        "Error"
    };
    let tokens = match &result.usage {
        Some(usage) => format!(" · {}k tokens", usage.total() / 1000),
        None => String::new(),
    };
    let turn_word = if result.num_turns == 1 { "turn" } else { "turns" };
    let stats = format!(
        "${:.2} · {whole_secs}.{tenths}s · {} {turn_word}{tokens}",
        result.total_cost_usd, result.num_turns
    );
    if label == "Error" {
        format!("{label} ({})  {stats}", result.subtype)
    } else {
        format!("{label}  {stats}")
    }
}

/// Split `text` into chunks of at most `max` chars, preferring line breaks.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let len = line.chars().count();
        if current_len + len > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if len > max {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += len;
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
        .into_iter()
        .map(|c| c.trim_end().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
