//! Built-in tools offered in the turn's tool round.

use async_trait::async_trait;
use localapi_core::error::ToolError;
use localapi_core::message::ChatMessage;
use localapi_core::provider::{Provider, ProviderRequest};
use localapi_core::tool::{Tool, ToolRegistry};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

const VISION_INSTRUCTION: &str = "You are a vision assistant. Analyze the provided image and reply ONLY with compact JSON \
having keys: summary (string), objects (array of strings), detected_text (array of strings), tags (array of strings).";

const VISION_TASKS: [&str; 3] = ["general", "ocr", "layout"];

/// Describes an image by URL with the multimodal model.
///
/// Always answers with `{summary, objects, detected_text, tags}`, whatever
/// shape the model's reply takes.
pub struct VisionDescribeTool {
    provider: Arc<dyn Provider>,
    model: String,
}

impl VisionDescribeTool {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    fn instruction(task: &str) -> String {
        let mut instruction = VISION_INSTRUCTION.to_string();
        match task {
            "ocr" => instruction.push_str(" Focus on extracting visible text into detected_text and short summary."),
            "layout" => instruction.push_str(" Focus on layout/objects list; detected_text only if clearly visible."),
            _ => {}
        }
        instruction
    }
}

/// Validated `vision_describe` arguments.
#[derive(Debug, PartialEq)]
struct VisionArgs {
    image_url: String,
    task: String,
}

fn parse_vision_args(arguments: &Value) -> Result<VisionArgs, ToolError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments("arguments must be an object".into()))?;

    if let Some(unknown) = object.keys().find(|k| !matches!(k.as_str(), "image_url" | "task")) {
        return Err(ToolError::InvalidArguments(format!("Unknown parameter: {unknown}")));
    }

    let image_url = match object.get("image_url") {
        Some(Value::String(url)) => url.trim().to_string(),
        Some(_) => return Err(ToolError::InvalidArguments("Parameter image_url must be string".into())),
        None => return Err(ToolError::InvalidArguments("Missing required parameter: image_url".into())),
    };

    let task = match object.get("task") {
        None => "general".to_string(),
        Some(Value::String(task)) if VISION_TASKS.contains(&task.as_str()) => task.clone(),
        Some(_) => {
            return Err(ToolError::InvalidArguments(format!(
                "Parameter task must be one of {VISION_TASKS:?}"
            )));
        }
    };

    Ok(VisionArgs { image_url, task })
}

/// Strict JSON, then the outermost `{...}` span, then the raw text as the summary.
fn normalize_description(text: &str) -> Value {
    let parsed = serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
        .or_else(|| {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            (start < end)
                .then(|| serde_json::from_str::<Value>(&text[start..=end]).ok())
                .flatten()
                .filter(Value::is_object)
        })
        .unwrap_or_else(|| json!({ "summary": text.trim() }));

    let summary = match &parsed["summary"] {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };

    json!({
        "summary": summary,
        "objects": as_string_list(&parsed["objects"]),
        "detected_text": as_string_list(&parsed["detected_text"]),
        "tags": as_string_list(&parsed["tags"]),
    })
}

fn as_string_list(value: &Value) -> Vec<String> {
    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(text).collect(),
        other => vec![text(other)],
    }
}

#[async_trait]
impl Tool for VisionDescribeTool {
    fn name(&self) -> &str {
        "vision_describe"
    }

    fn description(&self) -> &str {
        "Describe an image given its URL: summary, objects, visible text and tags."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "image_url": { "type": "string", "description": "Publicly reachable image URL" },
                "task": {
                    "type": "string",
                    "enum": VISION_TASKS,
                    "default": "general",
                    "description": "Description mode: general, OCR text extraction, or layout analysis"
                }
            },
            "required": ["image_url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let args = parse_vision_args(&arguments)?;
        debug!(model = %self.model, task = %args.task, "Describing image");

        let message = ChatMessage::user(Self::instruction(&args.task)).with_image(args.image_url);
        let mut request = ProviderRequest::new(self.model.clone(), vec![message]);
        request.temperature = 0.0;
        request.max_tokens = Some(512);

        let response = self.provider.complete(request).await?;
        info!(tool = self.name(), model = %response.model, "Image described");
        Ok(normalize_description(&response.content))
    }
}

/// The tools a turn may call.
pub fn default_tools(provider: Arc<dyn Provider>, vision_model: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(VisionDescribeTool::new(provider, vision_model)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FoldScript, ScriptedProvider};
    use localapi_core::tool::ToolCall;

    #[test]
    fn args_default_to_general_task() {
        let args = parse_vision_args(&json!({ "image_url": " https://example.com/a.png " })).unwrap();
        assert_eq!(
            args,
            VisionArgs {
                image_url: "https://example.com/a.png".into(),
                task: "general".into()
            }
        );
    }

    #[test]
    fn bad_args_are_rejected() {
        for bad in [
            json!({}),
            json!({ "image_url": 7 }),
            json!({ "image_url": "https://x/y.png", "task": "poetry" }),
            json!({ "image_url": "https://x/y.png", "zoom": 2 }),
            json!("https://x/y.png"),
        ] {
            assert!(
                matches!(parse_vision_args(&bad), Err(ToolError::InvalidArguments(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn description_accepts_embedded_json() {
        let reply = "Sure! {\"summary\": \" A cat \", \"objects\": \"cat\", \"tags\": [\"pet\", 3]} Hope that helps.";
        assert_eq!(
            normalize_description(reply),
            json!({
                "summary": "A cat",
                "objects": ["cat"],
                "detected_text": [],
                "tags": ["pet", "3"],
            })
        );
    }

    #[test]
    fn plain_text_reply_becomes_the_summary() {
        let described = normalize_description("  a red bicycle against a wall ");
        assert_eq!(described["summary"], "a red bicycle against a wall");
        assert_eq!(described["objects"], json!([]));
    }

    #[tokio::test]
    async fn vision_call_sends_image_to_vision_model() {
        let provider = Arc::new(ScriptedProvider::new().with_folds(vec![FoldScript::Reply(
            r#"{"summary":"Invoice","detected_text":["TOTAL 42"]}"#.into(),
        )]));
        let registry = default_tools(provider.clone(), "qwen/qwen2.5-vl-7b");

        let call = ToolCall {
            id: "call_1".into(),
            name: "vision_describe".into(),
            arguments: json!({ "image_url": "https://example.com/invoice.png", "task": "ocr" }),
        };
        let result = registry.execute(&call).await.unwrap();
        assert_eq!(result["detected_text"], json!(["TOTAL 42"]));

        let sent = &provider.fold_requests()[0];
        assert_eq!(sent.model, "qwen/qwen2.5-vl-7b");
        assert_eq!(sent.max_tokens, Some(512));
        assert_eq!(sent.messages[0].image_urls, ["https://example.com/invoice.png"]);
        assert!(sent.messages[0].content.contains("extracting visible text"));
    }

    #[tokio::test]
    async fn backend_error_is_an_execution_failure() {
        let provider = Arc::new(ScriptedProvider::new());
        let tool = VisionDescribeTool::new(provider, "vl");
        let err = tool
            .execute(json!({ "image_url": "https://example.com/a.png" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }
}
