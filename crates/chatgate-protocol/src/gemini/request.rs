use serde::{Deserialize, Serialize};

use crate::gemini::types::{Content, GenerationConfig, ThinkingConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequestBody {
    /// The conversation so far, oldest first.
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerateContentRequestBody {
    /// Text of the last message, all text parts joined by newline.
    pub fn last_message_text(&self) -> Option<String> {
        let content = self.contents.last()?;
        let text = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() { None } else { Some(text) }
    }

    pub fn include_thoughts(&self) -> bool {
        self.thinking_config
            .map(|config| config.include_thoughts)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateContentRequest {
    /// Public model name from the path, `models/` prefix not yet stripped.
    pub model: String,
    pub body: GenerateContentRequestBody,
}
