use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use chatgate_protocol::gemini::types::{Content, ContentRole};
use chatgate_storage::{NewSession, SessionRecord, Storage};

use crate::error::GatewayError;

/// How many user messages anchor each end of the fingerprint.
const FINGERPRINT_SPAN: usize = 5;
const FINGERPRINT_JOINER: &str = "|||";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub head_hash: String,
    pub tail_hash: String,
}

/// Content-addressed fingerprints of a conversation: MD5 over the first
/// and last five user messages. A conversation with no user message gets
/// hashes of a fresh random string, guaranteeing a miss.
pub fn fingerprints(contents: &[Content]) -> Fingerprints {
    let user_texts: Vec<String> = contents
        .iter()
        .filter(|content| content.role == Some(ContentRole::User))
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();

    if user_texts.is_empty() {
        let nonce: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let hash = md5_hex(&nonce);
        return Fingerprints {
            head_hash: hash.clone(),
            tail_hash: hash,
        };
    }

    let span = user_texts.len().min(FINGERPRINT_SPAN);
    let head_text = user_texts[..span].join(FINGERPRINT_JOINER);
    let tail_text = user_texts[user_texts.len() - span..].join(FINGERPRINT_JOINER);
    Fingerprints {
        head_hash: md5_hex(&head_text),
        tail_hash: md5_hex(&tail_text),
    }
}

fn md5_hex(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Head,
    Created,
}

#[derive(Debug, Clone)]
pub struct MatchedSession {
    pub session: SessionRecord,
    pub kind: MatchKind,
}

/// Binds conversations to upstream sessions.
pub struct SessionMatcher {
    storage: Arc<dyn Storage>,
    ttl: Duration,
    max_per_user: u64,
}

impl SessionMatcher {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration, max_per_user: u64) -> Self {
        Self {
            storage,
            ttl,
            max_per_user,
        }
    }

    /// Find the session this conversation continues, or create one bound
    /// to the given provider. Lookup order: exact fingerprint match, then
    /// head-only (which adopts the new tail), then create.
    pub async fn match_or_create(
        &self,
        user_id: i64,
        provider_id: i64,
        contents: &[Content],
    ) -> Result<MatchedSession, GatewayError> {
        let prints = fingerprints(contents);

        if let Some(session) = self
            .storage
            .find_exact_session(user_id, &prints.head_hash, &prints.tail_hash)
            .await?
        {
            debug!(session_id = session.id, "exact session match");
            return Ok(MatchedSession {
                session,
                kind: MatchKind::Exact,
            });
        }

        if let Some(mut session) = self
            .storage
            .find_head_session(user_id, &prints.head_hash)
            .await?
        {
            // The conversation grew past the tail anchor; adopt the new one.
            self.storage
                .update_session_tail(session.id, &prints.tail_hash)
                .await?;
            session.tail_hash = prints.tail_hash;
            debug!(session_id = session.id, "head session match");
            return Ok(MatchedSession {
                session,
                kind: MatchKind::Head,
            });
        }

        if self.storage.count_active_sessions(user_id).await? >= self.max_per_user {
            self.storage.delete_oldest_session(user_id).await?;
        }
        let session = self
            .storage
            .insert_session(NewSession {
                user_id,
                provider_id,
                head_hash: prints.head_hash,
                tail_hash: prints.tail_hash,
                ttl: self.ttl,
            })
            .await?;
        debug!(session_id = session.id, "session created");
        Ok(MatchedSession {
            session,
            kind: MatchKind::Created,
        })
    }

    /// Re-bind a conversation after provider substitution: the old row is
    /// marked migrated, a fresh one carries the same fingerprints. The
    /// upstream session handle is not carried over; upstream sessions are
    /// provider-scoped.
    pub async fn migrate_to(
        &self,
        session: &SessionRecord,
        new_provider_id: i64,
    ) -> Result<SessionRecord, GatewayError> {
        self.storage.mark_session_migrated(session.id).await?;
        let replacement = self
            .storage
            .insert_session(NewSession {
                user_id: session.user_id,
                provider_id: new_provider_id,
                head_hash: session.head_hash.clone(),
                tail_hash: session.tail_hash.clone(),
                ttl: self.ttl,
            })
            .await?;
        debug!(
            old_session_id = session.id,
            new_session_id = replacement.id,
            new_provider_id,
            "session migrated"
        );
        Ok(replacement)
    }

    /// One successful exchange: message_count + 1 and a fresh expiry.
    pub async fn record_message(&self, session_id: i64) -> Result<(), GatewayError> {
        self.storage.touch_session(session_id, self.ttl).await?;
        Ok(())
    }

    pub async fn set_upstream_session(
        &self,
        session_id: i64,
        upstream_session_id: &str,
    ) -> Result<(), GatewayError> {
        self.storage
            .set_upstream_session(session_id, upstream_session_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_protocol::gemini::types::Part;

    fn user(text: &str) -> Content {
        Content {
            role: Some(ContentRole::User),
            parts: vec![Part {
                text: Some(text.to_string()),
                ..Part::default()
            }],
        }
    }

    fn model(text: &str) -> Content {
        Content {
            role: Some(ContentRole::Model),
            parts: vec![Part {
                text: Some(text.to_string()),
                ..Part::default()
            }],
        }
    }

    #[test]
    fn fingerprints_are_deterministic() {
        let contents = vec![user("hello"), model("hi"), user("how are you")];
        assert_eq!(fingerprints(&contents), fingerprints(&contents));
        // Known digest: md5("hello|||how are you").
        assert_eq!(
            fingerprints(&contents).head_hash,
            format!("{:x}", md5::compute("hello|||how are you"))
        );
    }

    #[test]
    fn model_turns_do_not_change_fingerprints() {
        let a = vec![user("q1"), user("q2")];
        let b = vec![user("q1"), model("a1"), user("q2"), model("a2")];
        assert_eq!(fingerprints(&a), fingerprints(&b));
    }

    #[test]
    fn five_user_messages_make_head_equal_tail() {
        let contents: Vec<Content> = (0..5).map(|i| user(&format!("m{i}"))).collect();
        let prints = fingerprints(&contents);
        assert_eq!(prints.head_hash, prints.tail_hash);
    }

    #[test]
    fn six_user_messages_shift_the_tail_only() {
        let five: Vec<Content> = (0..5).map(|i| user(&format!("m{i}"))).collect();
        let mut six = five.clone();
        six.push(user("m5"));
        let a = fingerprints(&five);
        let b = fingerprints(&six);
        assert_eq!(a.head_hash, b.head_hash);
        assert_ne!(a.tail_hash, b.tail_hash);
    }

    #[test]
    fn growth_within_the_window_moves_both_anchors() {
        let two = vec![user("a"), user("b")];
        let three = vec![user("a"), user("b"), user("c")];
        let a = fingerprints(&two);
        let b = fingerprints(&three);
        assert_ne!(a.head_hash, b.head_hash);
        assert_ne!(a.tail_hash, b.tail_hash);
    }

    #[test]
    fn empty_contents_get_random_fingerprints() {
        let a = fingerprints(&[]);
        let b = fingerprints(&[]);
        assert_eq!(a.head_hash, a.tail_hash);
        assert_ne!(a.head_hash, b.head_hash);
    }

    #[test]
    fn multi_part_text_joins_with_newline() {
        let content = Content {
            role: Some(ContentRole::User),
            parts: vec![
                Part {
                    text: Some("line one".to_string()),
                    ..Part::default()
                },
                Part {
                    text: Some("line two".to_string()),
                    ..Part::default()
                },
            ],
        };
        let prints = fingerprints(std::slice::from_ref(&content));
        assert_eq!(
            prints.head_hash,
            format!("{:x}", md5::compute("line one\nline two"))
        );
    }
}
