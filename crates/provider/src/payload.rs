//! Provider request envelopes
//!
//! The chat endpoint expects one user message per call, wrapped in an
//! envelope that names the conversation, the parent message the reply should
//! hang off, and a feature-flag block that depends on the generation kind.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Generation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// Text to text
    #[default]
    T2t,
    /// Text to image
    T2i,
    /// Text to video (asynchronous task)
    T2v,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::T2t => "t2t",
            ChatType::T2i => "t2i",
            ChatType::T2v => "t2v",
        }
    }

    /// Long-running kinds answer with a task reference instead of a stream.
    pub fn is_task(&self) -> bool {
        matches!(self, ChatType::T2v)
    }
}

/// One typed part of a composite message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { image: String },
    File { file: String },
}

/// Validated message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Short description for logs; never the full text.
    pub fn summary(&self) -> String {
        match self {
            MessageContent::Text(text) => {
                let preview: String = text.chars().take(50).collect();
                if text.chars().count() > 50 {
                    format!("{preview}...")
                } else {
                    preview
                }
            }
            MessageContent::Parts(parts) => format!("composite message ({} parts)", parts.len()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureConfig {
    pub thinking_enabled: bool,
    pub output_schema: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_search: Option<bool>,
}

impl FeatureConfig {
    pub fn for_chat_type(chat_type: ChatType) -> Self {
        let long_running = chat_type.is_task();
        Self {
            thinking_enabled: long_running,
            output_schema: "phase",
            research_mode: long_running.then_some("normal"),
            auto_thinking: long_running.then_some(true),
            thinking_format: long_running.then_some("summary"),
            auto_search: long_running.then_some(true),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub fid: String,
    #[serde(rename = "parentId")]
    pub parent_id_legacy: Option<String>,
    pub parent_id: Option<String>,
    pub role: &'static str,
    pub content: MessageContent,
    pub chat_type: ChatType,
    pub sub_chat_type: ChatType,
    pub timestamp: i64,
    pub user_action: &'static str,
    pub models: Vec<String>,
    pub files: Vec<Value>,
    #[serde(rename = "childrenIds")]
    pub children_ids: Vec<String>,
    pub extra: Value,
    pub feature_config: FeatureConfig,
}

/// Complete chat envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    pub stream: bool,
    pub version: &'static str,
    pub incremental_output: bool,
    pub chat_id: String,
    pub chat_mode: &'static str,
    pub messages: Vec<OutgoingMessage>,
    pub model: String,
    pub parent_id: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Inputs for `ChatPayload::build`.
#[derive(Debug, Clone)]
pub struct PayloadParams {
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub model: String,
    pub content: MessageContent,
    pub chat_type: ChatType,
    pub system_message: Option<String>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub size: Option<String>,
    pub files: Vec<Value>,
}

impl ChatPayload {
    /// Assemble the envelope with fresh ids for the user message and its
    /// prospective reply.
    pub fn build(params: PayloadParams) -> Self {
        let now = chrono::Utc::now().timestamp();
        let chat_type = params.chat_type;

        let message = OutgoingMessage {
            fid: uuid::Uuid::new_v4().to_string(),
            parent_id_legacy: params.parent_id.clone(),
            parent_id: params.parent_id.clone(),
            role: "user",
            content: params.content,
            chat_type,
            sub_chat_type: chat_type,
            timestamp: now,
            user_action: "chat",
            models: vec![params.model.clone()],
            files: params.files,
            children_ids: vec![uuid::Uuid::new_v4().to_string()],
            extra: json!({ "meta": { "subChatType": chat_type.as_str() } }),
            feature_config: FeatureConfig::for_chat_type(chat_type),
        };

        let tools = params.tools.filter(|t| !t.is_empty());
        let tool_choice = tools
            .as_ref()
            .map(|_| params.tool_choice.unwrap_or_else(|| json!("auto")));
        let size = match chat_type {
            ChatType::T2i | ChatType::T2v => params.size,
            ChatType::T2t => None,
        };

        Self {
            stream: !chat_type.is_task(),
            version: "2.1",
            incremental_output: true,
            chat_id: params.chat_id,
            chat_mode: "normal",
            messages: vec![message],
            model: params.model,
            parent_id: params.parent_id,
            timestamp: now,
            system_message: params.system_message.filter(|s| !s.is_empty()),
            tools,
            tool_choice,
            size,
        }
    }
}

/// Body for the conversation-creation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NewConversation {
    pub title: String,
    pub models: Vec<String>,
    pub chat_mode: &'static str,
    pub chat_type: ChatType,
    pub timestamp: i64,
}

impl NewConversation {
    pub fn new(title: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            models: vec![model.into()],
            chat_mode: "normal",
            chat_type: ChatType::T2t,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(chat_type: ChatType) -> PayloadParams {
        PayloadParams {
            chat_id: "chat-1".into(),
            parent_id: Some("resp-0".into()),
            model: "qwen-max-latest".into(),
            content: MessageContent::Text("hello".into()),
            chat_type,
            system_message: None,
            tools: None,
            tool_choice: None,
            size: Some("1280x720".into()),
            files: vec![],
        }
    }

    #[test]
    fn plain_chat_streams_without_extra_flags() {
        let payload = ChatPayload::build(params(ChatType::T2t));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["stream"], true);
        assert_eq!(json["chat_id"], "chat-1");
        assert_eq!(json["parent_id"], "resp-0");
        let message = &json["messages"][0];
        assert_eq!(message["parentId"], "resp-0");
        assert_eq!(message["content"], "hello");
        assert_eq!(message["chat_type"], "t2t");
        assert_eq!(message["feature_config"]["thinking_enabled"], false);
        assert!(message["feature_config"].get("auto_search").is_none());
        assert!(json.get("size").is_none(), "size only applies to media kinds");
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn video_generation_is_a_task_with_thinking_flags() {
        let payload = ChatPayload::build(params(ChatType::T2v));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["stream"], false);
        assert_eq!(json["size"], "1280x720");
        let flags = &json["messages"][0]["feature_config"];
        assert_eq!(flags["thinking_enabled"], true);
        assert_eq!(flags["auto_search"], true);
        assert_eq!(flags["research_mode"], "normal");
        assert_eq!(json["messages"][0]["extra"]["meta"]["subChatType"], "t2v");
    }

    #[test]
    fn message_and_reply_ids_are_fresh() {
        let a = ChatPayload::build(params(ChatType::T2t));
        let b = ChatPayload::build(params(ChatType::T2t));
        assert_ne!(a.messages[0].fid, b.messages[0].fid);
        assert_ne!(a.messages[0].fid, a.messages[0].children_ids[0]);
    }

    #[test]
    fn tools_default_to_auto_choice() {
        let mut p = params(ChatType::T2t);
        p.tools = Some(vec![json!({"type": "function", "function": {"name": "lookup"}})]);
        let json = serde_json::to_value(ChatPayload::build(p)).unwrap();
        assert_eq!(json["tool_choice"], "auto");

        let mut p = params(ChatType::T2t);
        p.tools = Some(vec![]);
        p.tool_choice = Some(json!("required"));
        let json = serde_json::to_value(ChatPayload::build(p)).unwrap();
        assert!(json.get("tools").is_none(), "empty tool list is dropped");
        assert!(json.get("tool_choice").is_none());
    }

    #[test]
    fn system_preamble_is_attached() {
        let mut p = params(ChatType::T2t);
        p.system_message = Some("You are terse.".into());
        let json = serde_json::to_value(ChatPayload::build(p)).unwrap();
        assert_eq!(json["system_message"], "You are terse.");
    }

    #[test]
    fn composite_parts_serialize_tagged() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "describe".into(),
            },
            ContentPart::Image {
                image: "https://cdn.example/cat.png".into(),
            },
        ]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[1]["type"], "image");
        assert_eq!(json[1]["image"], "https://cdn.example/cat.png");
    }

    #[test]
    fn content_part_rejects_mismatched_shape() {
        let bad = json!({"type": "image", "text": "not an image"});
        assert!(serde_json::from_value::<ContentPart>(bad).is_err());
        let unknown = json!({"type": "audio", "audio": "x"});
        assert!(serde_json::from_value::<ContentPart>(unknown).is_err());
    }

    #[test]
    fn summary_truncates_long_text() {
        let content = MessageContent::Text("x".repeat(80));
        assert_eq!(content.summary().len(), 53);
    }
}
