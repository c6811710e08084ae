use serde::Deserialize;
use serde_json::Value;
use turn_relay_error::RelayError;

/// Separates the instruction block from the user block in the relayed prompt.
pub const INSTRUCTION_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    /// Text forwarded to the agent.
    pub prompt: String,
    /// Caller input, echoed back in the response object.
    pub input: Value,
    pub instructions: Option<String>,
    pub model: Option<String>,
    pub metadata: Value,
    pub stream: bool,
    pub new_chat: bool,
}

#[derive(Debug, Deserialize)]
struct ResponsesRequestBody {
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

pub fn parse_turn_request(body: &[u8]) -> Result<TurnRequest, RelayError> {
    let body: ResponsesRequestBody = serde_json::from_slice(body)
        .map_err(|err| RelayError::invalid_request(format!("body must be a JSON object: {err}")))?;
    let input = body
        .input
        .ok_or_else(|| RelayError::invalid_request("missing input"))?;
    let prompt = extract_prompt(&input, body.instructions.as_deref())?;

    Ok(TurnRequest {
        prompt,
        input,
        instructions: body.instructions,
        model: body.model,
        metadata: body.metadata.unwrap_or_else(|| Value::Object(Default::default())),
        stream: body.stream,
        new_chat: false,
    })
}

/// Flattens the caller input into one prompt: non-user messages (and any
/// top-level instructions) become an instruction block ahead of the user text.
pub fn extract_prompt(input: &Value, instructions: Option<&str>) -> Result<String, RelayError> {
    let mut instruction_parts: Vec<String> = instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| vec![text.to_string()])
        .unwrap_or_default();
    let mut user_parts: Vec<String> = Vec::new();

    match input {
        Value::String(text) => user_parts.push(text.trim().to_string()),
        Value::Array(messages) => {
            for message in messages {
                let (role, text) = match message {
                    Value::String(text) => ("user", text.trim().to_string()),
                    Value::Object(_) => (
                        message.get("role").and_then(Value::as_str).unwrap_or("user"),
                        message
                            .get("content")
                            .map(content_text)
                            .unwrap_or_default(),
                    ),
                    _ => continue,
                };
                if text.is_empty() {
                    continue;
                }
                if role == "user" {
                    user_parts.push(text);
                } else {
                    instruction_parts.push(text);
                }
            }
        }
        _ => {
            return Err(RelayError::invalid_request(
                "input must be a string or a list of messages",
            ))
        }
    }

    let user = user_parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if user.is_empty() {
        return Err(RelayError::invalid_request("input contains no user text"));
    }

    if instruction_parts.is_empty() {
        Ok(user)
    } else {
        Ok(format!(
            "{}{INSTRUCTION_SEPARATOR}{user}",
            instruction_parts.join("\n\n")
        ))
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(_) => part.get("text").and_then(Value::as_str),
                _ => None,
            })
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => content
            .get("text")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}
