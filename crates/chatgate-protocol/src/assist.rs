//! Wire shapes of the upstream assist backend.
//!
//! Every object in the streamed array carries a `streamAssistResponse`
//! envelope; unknown fields are ignored so upstream additions do not break
//! parsing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistFrame {
    pub stream_assist_response: Option<StreamAssistResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAssistResponse {
    pub answer: Option<AssistAnswer>,
    pub session_info: Option<SessionInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistAnswer {
    /// Upstream answer state; `SUCCEEDED` is the normal terminal value.
    pub state: Option<String>,
    #[serde(default)]
    pub replies: Vec<AssistReply>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistReply {
    pub grounded_content: Option<GroundedContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundedContent {
    pub content: Option<AssistContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistContent {
    pub text: Option<String>,
    pub thought: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Opaque upstream session name.
    pub session: Option<String>,
    pub query_id: Option<String>,
}

pub const ANSWER_STATE_SUCCEEDED: &str = "SUCCEEDED";

/// One text piece extracted from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistPiece {
    pub text: String,
    pub thought: bool,
}

impl AssistFrame {
    /// Non-empty text pieces of this frame, reply order preserved.
    pub fn pieces(&self) -> Vec<AssistPiece> {
        let Some(answer) = self
            .stream_assist_response
            .as_ref()
            .and_then(|resp| resp.answer.as_ref())
        else {
            return Vec::new();
        };
        answer
            .replies
            .iter()
            .filter_map(|reply| {
                let content = reply.grounded_content.as_ref()?.content.as_ref()?;
                let text = content.text.clone()?;
                if text.is_empty() {
                    return None;
                }
                Some(AssistPiece {
                    text,
                    thought: content.thought == Some(true),
                })
            })
            .collect()
    }

    pub fn answer_state(&self) -> Option<&str> {
        self.stream_assist_response
            .as_ref()?
            .answer
            .as_ref()?
            .state
            .as_deref()
    }

    pub fn session_name(&self) -> Option<&str> {
        self.stream_assist_response
            .as_ref()?
            .session_info
            .as_ref()?
            .session
            .as_deref()
    }
}

/// Request body for the streaming assist call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAssistRequest {
    pub query: AssistQuery,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assist_skipping_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_generation_spec: Option<AnswerGenerationSpec>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistQuery {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerGenerationSpec {
    pub model_id: String,
}
