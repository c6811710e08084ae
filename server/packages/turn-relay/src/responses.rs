//! The subset of the OpenAI Responses object this relay produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sanitize::ToolCall;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Cancelled,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

impl ResponseError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    OutputText {
        text: String,
        #[serde(default)]
        annotations: Vec<Value>,
    },
}

impl ContentPart {
    pub fn output_text(text: impl Into<String>) -> Self {
        Self::OutputText {
            text: text.into(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        status: ItemStatus,
        role: String,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        arguments: String,
        status: ItemStatus,
    },
}

impl OutputItem {
    pub fn assistant_message(id: impl Into<String>) -> Self {
        Self::Message {
            id: id.into(),
            status: ItemStatus::InProgress,
            role: "assistant".to_string(),
            content: Vec::new(),
        }
    }

    pub fn function_call(call: &ToolCall) -> Self {
        Self::FunctionCall {
            id: format!("fc_{}", call.id.trim_start_matches("call_")),
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ItemStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseObject {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub status: ResponseStatus,
    pub completed_at: Option<i64>,
    pub model: String,
    pub instructions: Option<String>,
    pub input: Value,
    #[serde(default)]
    pub metadata: Value,
    pub output: Vec<OutputItem>,
    pub output_text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<ResponseError>,
    pub usage: Option<Value>,
}

impl ResponseObject {
    pub fn in_progress(
        id: String,
        created_at: i64,
        model: String,
        instructions: Option<String>,
        input: Value,
        metadata: Value,
    ) -> Self {
        Self {
            id,
            object: "response".to_string(),
            created_at,
            status: ResponseStatus::InProgress,
            completed_at: None,
            model,
            instructions,
            input,
            metadata,
            output: Vec::new(),
            output_text: String::new(),
            tool_calls: Vec::new(),
            error: None,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_tagged_items_and_null_fields() {
        let mut response = ResponseObject::in_progress(
            "resp_1".to_string(),
            10,
            "chat-relay".to_string(),
            None,
            json!("hi"),
            json!({}),
        );
        let mut item = OutputItem::assistant_message("msg_1");
        if let OutputItem::Message { content, .. } = &mut item {
            content.push(ContentPart::output_text("hello"));
        }
        response.output.push(item);

        let value = serde_json::to_value(&response).expect("serialize response");
        assert_eq!(value["status"], "in_progress");
        assert_eq!(value["completed_at"], Value::Null);
        assert_eq!(value["output"][0]["type"], "message");
        assert_eq!(value["output"][0]["content"][0]["type"], "output_text");
        assert_eq!(value["output"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn function_call_item_reuses_call_id() {
        let call = ToolCall {
            id: "call_abc".to_string(),
            name: "get_weather".to_string(),
            arguments: "{}".to_string(),
        };
        let value = serde_json::to_value(OutputItem::function_call(&call)).expect("serialize");
        assert_eq!(value["type"], "function_call");
        assert_eq!(value["id"], "fc_abc");
        assert_eq!(value["call_id"], "call_abc");
    }
}
