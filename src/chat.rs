use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OpenAI chat-completions request body. Fields the proxy does not inspect
/// (model, temperature, ...) ride along in `extra_body` and are forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl CompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Tools are opt-out: a request without tool definitions gets the
    /// default set and `tool_choice = "auto"`. Returns whether it injected.
    pub fn inject_default_tools(&mut self, definitions: Vec<Value>) -> bool {
        let has_tools = self.tools.as_ref().is_some_and(|t| !t.is_empty());
        if has_tools {
            return false;
        }
        self.tools = Some(definitions);
        self.tool_choice = Some(Value::String("auto".to_string()));
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl Message {
    pub fn assistant_with_tool_calls(
        content: String,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: Value::String(content),
            reasoning_content: reasoning.filter(|r| !r.is_empty()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            extra_body: Map::new(),
        }
    }

    pub fn tool_result(tool_call_id: String, content: String) -> Self {
        Self {
            role: Role::Tool,
            content: Value::String(content),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id),
            extra_body: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl ToolCall {
    pub fn function(id: String, name: String, arguments: String) -> Self {
        Self {
            id,
            call_type: default_tool_call_type(),
            function: FunctionCall { name, arguments },
            extra_body: Map::new(),
        }
    }

    /// Arguments arrive as a JSON string; anything that does not parse to a
    /// value is replaced by an empty object.
    pub fn parsed_arguments(&self) -> Value {
        parse_arguments(&self.function.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "tool arguments are not valid JSON, using {{}}");
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_top_level_fields_are_forwarded() {
        let req: CompletionRequest = serde_json::from_value(json!({
            "model": "deepseek-chat",
            "temperature": 0.2,
            "messages": [{ "role": "user", "content": "hi", "name": "me" }],
            "stream": true
        }))
        .unwrap();
        assert!(req.is_stream());
        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["model"], "deepseek-chat");
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["messages"][0]["name"], "me");
        assert!(out.get("tools").is_none());
    }

    #[test]
    fn default_tools_injected_only_when_absent_or_empty() {
        let mut req: CompletionRequest =
            serde_json::from_value(json!({ "messages": [], "tools": [] })).unwrap();
        assert!(req.inject_default_tools(vec![json!({"type": "function"})]));
        assert_eq!(req.tool_choice, Some(json!("auto")));

        let mut req: CompletionRequest = serde_json::from_value(json!({
            "messages": [],
            "tools": [{"type": "function", "function": {"name": "mine"}}],
            "tool_choice": "none"
        }))
        .unwrap();
        assert!(!req.inject_default_tools(vec![json!({"type": "function"})]));
        assert_eq!(req.tool_choice, Some(json!("none")));
        assert_eq!(req.tools.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        let call = ToolCall::function("c1".into(), "x".into(), "{\"command\": ".into());
        assert_eq!(call.parsed_arguments(), json!({}));
        let call = ToolCall::function("c1".into(), "x".into(), String::new());
        assert_eq!(call.parsed_arguments(), json!({}));
    }
}
