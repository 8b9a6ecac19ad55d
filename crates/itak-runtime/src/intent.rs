//! Structured intent parsing.
//!
//! The model is instructed to answer with one JSON object per iteration:
//! `{"tool": "<name>", "args": {...}}`. The terminal `response` tool
//! carries the final text. Parsing is a sum type, not an exception: the
//! scheduler acts on the tag.

use serde_json::Value;

/// What the model asked for this iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    /// Terminal response for the user.
    Response {
        /// Final text.
        text: String,
    },
    /// A tool invocation.
    Tool {
        /// Registered tool name.
        name: String,
        /// Raw arguments.
        args: Value,
    },
    /// The output held no usable intent.
    ParseError {
        /// What went wrong, fed back as a correction.
        reason: String,
    },
}

/// Extract the intent from raw model output.
///
/// Robust to prose and code fences around the JSON object: the first
/// balanced `{...}` block that parses and carries a `tool` key wins.
#[must_use]
pub fn parse_intent(output: &str) -> IntentOutcome {
    for candidate in balanced_objects(output) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(tool) = value.get("tool").and_then(Value::as_str) else {
            continue;
        };
        let args = value.get("args").cloned().unwrap_or(Value::Object(serde_json::Map::new()));

        if tool == itak_tools::RESPONSE_TOOL {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| args.to_string());
            return IntentOutcome::Response { text };
        }
        return IntentOutcome::Tool {
            name: tool.to_string(),
            args,
        };
    }
    IntentOutcome::ParseError {
        reason: "no JSON object with a \"tool\" key found in the output".into(),
    }
}

/// All balanced top-level `{...}` slices, left to right. String-aware so
/// braces inside JSON strings do not break the balance.
fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut objects = Vec::new();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth = depth.saturating_add(1);
            },
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0
                    && let Some(s) = start.take()
                {
                    objects.push(&text[s..=i]);
                }
            },
            _ => {},
        }
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tool_call() {
        let intent = parse_intent(r#"{"tool": "memory_load", "args": {"query": "vps port"}}"#);
        assert_eq!(
            intent,
            IntentOutcome::Tool {
                name: "memory_load".into(),
                args: serde_json::json!({"query": "vps port"}),
            }
        );
    }

    #[test]
    fn response_tool_becomes_terminal() {
        let intent = parse_intent(r#"{"tool": "response", "args": {"text": "port is 48920"}}"#);
        assert_eq!(
            intent,
            IntentOutcome::Response {
                text: "port is 48920".into()
            }
        );
    }

    #[test]
    fn json_inside_prose_and_fences_is_found() {
        let output = "Thinking...\n```json\n{\"tool\": \"web_search\", \"args\": {\"query\": \"a {b}\"}}\n```\ndone";
        let intent = parse_intent(output);
        assert!(matches!(intent, IntentOutcome::Tool { name, .. } if name == "web_search"));
    }

    #[test]
    fn earlier_non_tool_objects_are_skipped() {
        let output = r#"{"note": "scratch"} then {"tool": "response", "args": {"text": "ok"}}"#;
        assert!(matches!(parse_intent(output), IntentOutcome::Response { .. }));
    }

    #[test]
    fn prose_is_a_parse_error() {
        assert!(matches!(
            parse_intent("I think the answer is probably 42."),
            IntentOutcome::ParseError { .. }
        ));
    }

    #[test]
    fn braces_inside_strings_do_not_break_balance() {
        let output = r#"{"tool": "code_exec", "args": {"command": "echo '}{'"}}"#;
        assert!(matches!(parse_intent(output), IntentOutcome::Tool { .. }));
    }
}
