use serde::{Deserialize, Serialize};

use crate::gemini::types::{Blob, FinishReason, SafetyRating, UsageMetadata};

/// One part of a model reply. Exactly one variant per emitted part; the
/// untagged encoding matches the public wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePart {
    #[serde(rename_all = "camelCase")]
    Thought { thought: bool, text: String },
    #[serde(rename_all = "camelCase")]
    InlineData { inline_data: Blob },
    #[serde(rename_all = "camelCase")]
    Text { text: String },
}

impl ResponsePart {
    pub fn thought(text: impl Into<String>) -> Self {
        ResponsePart::Thought {
            thought: true,
            text: text.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ResponsePart::Text { text: text.into() }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        ResponsePart::InlineData {
            inline_data: Blob {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateContent {
    pub role: String,
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: CandidateContent,
    /// Explicitly null on non-terminal streaming chunks.
    pub finish_reason: Option<FinishReason>,
    pub safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    pub model_version: String,
}

impl GenerateContentResponse {
    pub fn chunk(
        model: impl Into<String>,
        parts: Vec<ResponsePart>,
        finish_reason: Option<FinishReason>,
        usage_metadata: Option<UsageMetadata>,
    ) -> Self {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: CandidateContent {
                    role: "model".to_string(),
                    parts,
                },
                finish_reason,
                safety_ratings: crate::gemini::types::negligible_safety_ratings(),
            }],
            usage_metadata,
            model_version: model.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_part_wire_shapes() {
        let thought = serde_json::to_value(ResponsePart::thought("hmm")).unwrap();
        assert_eq!(thought["thought"], true);
        assert_eq!(thought["text"], "hmm");

        let text = serde_json::to_value(ResponsePart::text("hi")).unwrap();
        assert_eq!(text["text"], "hi");
        assert!(text.get("thought").is_none());

        let media = serde_json::to_value(ResponsePart::inline_data("image/png", "QUJD")).unwrap();
        assert_eq!(media["inlineData"]["mimeType"], "image/png");
        assert_eq!(media["inlineData"]["data"], "QUJD");
    }

    #[test]
    fn non_terminal_chunk_serializes_null_finish_reason() {
        let chunk = GenerateContentResponse::chunk(
            "gemini-2.0-flash-exp",
            vec![ResponsePart::text("partial")],
            None,
            None,
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value["candidates"][0]["finishReason"].is_null());
        assert!(value.get("usageMetadata").is_none());
        assert_eq!(value["candidates"][0]["safetyRatings"].as_array().unwrap().len(), 4);
    }
}
