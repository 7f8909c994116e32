//! Interaction responder
//!
//! A short-lived helper constructed per inbound request-like event. It owns
//! the event's response token and enforces the response contract: exactly one
//! initial acknowledgment, any number of follow-ups, and edits addressed to
//! messages that were actually sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tracing::debug;

use perch_directory::{Directory, DirectoryError, MessageTarget};

/// Wire value for a "respond with a message" initial acknowledgment.
const RESPONSE_TYPE_MESSAGE: u8 = 4;

/// Message flag marking a response visible only to the invoking user.
const FLAG_PRIVATE: u64 = 64;

/// Contract violations and transport failures while responding.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("this interaction has already received its initial response")]
    AlreadyResponded,
    #[error("cannot edit: no message has been sent for this interaction")]
    NothingSent,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Content for a response: plain text becomes a minimal message body, a
/// structured value is used as-is.
#[derive(Debug, Clone)]
pub enum ResponseContent {
    Text(String),
    Structured(Value),
}

impl From<&str> for ResponseContent {
    fn from(s: &str) -> Self {
        ResponseContent::Text(s.to_string())
    }
}

impl From<String> for ResponseContent {
    fn from(s: String) -> Self {
        ResponseContent::Text(s)
    }
}

impl From<Value> for ResponseContent {
    fn from(v: Value) -> Self {
        ResponseContent::Structured(v)
    }
}

impl ResponseContent {
    /// Normalize into a message body, applying the private flag.
    fn into_body(self, private: bool) -> Value {
        let mut body = match self {
            ResponseContent::Text(text) => json!({ "content": text }),
            ResponseContent::Structured(value) => value,
        };
        if private
            && let Some(obj) = body.as_object_mut()
        {
            obj.entry("flags").or_insert(json!(FLAG_PRIVATE));
        }
        body
    }
}

fn empty_body(private: bool) -> Value {
    ResponseContent::Text(String::new()).into_body(private)
}

/// Responds to one inbound interaction through the directory.
pub struct InteractionResponder {
    interaction_id: String,
    token: String,
    directory: Arc<dyn Directory>,
    responded: AtomicBool,
}

impl InteractionResponder {
    pub fn new(
        interaction_id: impl Into<String>,
        token: impl Into<String>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            token: token.into(),
            directory,
            responded: AtomicBool::new(false),
        }
    }

    /// Send the initial acknowledgment. Permitted exactly once per
    /// interaction; a second call fails with [`ResponderError::AlreadyResponded`].
    ///
    /// With `silent`, the acknowledgment goes out as an empty placeholder and
    /// the real content arrives as an edit of that same message, so clients
    /// that notify on new messages only ever see the edit.
    pub async fn respond(
        &self,
        content: impl Into<ResponseContent>,
        private: bool,
        silent: bool,
    ) -> Result<(), ResponderError> {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(ResponderError::AlreadyResponded);
        }
        let body = content.into().into_body(private);
        if silent {
            self.post_initial(empty_body(private)).await?;
            self.directory
                .patch_message(&self.token, &MessageTarget::Original, &body)
                .await?;
        } else {
            self.post_initial(body).await?;
        }
        Ok(())
    }

    /// Send a follow-up message. May be called any number of times, before
    /// or after the initial acknowledgment. `silent` follows the same
    /// placeholder-then-edit scheme as [`respond`](Self::respond), targeting
    /// the new follow-up message.
    pub async fn followup(
        &self,
        content: impl Into<ResponseContent>,
        private: bool,
        silent: bool,
    ) -> Result<(), ResponderError> {
        let body = content.into().into_body(private);
        if !silent {
            self.directory.post_followup(&self.token, &body).await?;
            return Ok(());
        }
        let created = self
            .directory
            .post_followup(&self.token, &empty_body(private))
            .await?;
        let target = created
            .as_ref()
            .and_then(|msg| msg.get("id"))
            .and_then(Value::as_str)
            .map(|id| MessageTarget::Id(id.to_string()))
            // The remote side did not echo the created message; the best
            // remaining address is the original acknowledgment.
            .unwrap_or(MessageTarget::Original);
        self.directory
            .patch_message(&self.token, &target, &body)
            .await?;
        Ok(())
    }

    /// Edit a previously sent message. Without an explicit `target` this
    /// addresses the initial acknowledgment, which must exist.
    pub async fn edit(
        &self,
        content: impl Into<ResponseContent>,
        target: Option<String>,
    ) -> Result<(), ResponderError> {
        let target = match target {
            Some(id) => MessageTarget::Id(id),
            None => {
                if !self.responded.load(Ordering::SeqCst) {
                    return Err(ResponderError::NothingSent);
                }
                MessageTarget::Original
            }
        };
        let body = content.into().into_body(false);
        self.directory
            .patch_message(&self.token, &target, &body)
            .await?;
        Ok(())
    }

    async fn post_initial(&self, data: Value) -> Result<(), ResponderError> {
        debug!("posting initial response for interaction {}", self.interaction_id);
        let callback = json!({ "type": RESPONSE_TYPE_MESSAGE, "data": data });
        self.directory
            .post_initial_response(&self.interaction_id, &self.token, &callback)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Initial(Value),
        Followup(Value),
        Patch(MessageTarget, Value),
    }

    #[derive(Default)]
    struct RecordingDirectory {
        calls: Mutex<Vec<Call>>,
        followup_id: Option<String>,
    }

    impl RecordingDirectory {
        fn with_followup_id(id: &str) -> Self {
            Self {
                calls: Mutex::default(),
                followup_id: Some(id.to_string()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Directory for RecordingDirectory {
        async fn list_global_definitions(&self) -> Result<Vec<Value>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn list_scoped_definitions(&self, _: &str) -> Result<Vec<Value>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn create_definition(
            &self,
            _: Option<&str>,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            Ok(def.clone())
        }

        async fn patch_definition(
            &self,
            _: Option<&str>,
            _: &str,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            Ok(def.clone())
        }

        async fn delete_definition(&self, _: Option<&str>, _: &str) -> Result<(), DirectoryError> {
            Ok(())
        }

        async fn post_initial_response(
            &self,
            _: &str,
            _: &str,
            body: &Value,
        ) -> Result<(), DirectoryError> {
            self.calls.lock().unwrap().push(Call::Initial(body.clone()));
            Ok(())
        }

        async fn post_followup(
            &self,
            _: &str,
            body: &Value,
        ) -> Result<Option<Value>, DirectoryError> {
            self.calls.lock().unwrap().push(Call::Followup(body.clone()));
            Ok(self.followup_id.as_ref().map(|id| json!({ "id": id })))
        }

        async fn patch_message(
            &self,
            _: &str,
            target: &MessageTarget,
            body: &Value,
        ) -> Result<(), DirectoryError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Patch(target.clone(), body.clone()));
            Ok(())
        }
    }

    fn responder(dir: &Arc<RecordingDirectory>) -> InteractionResponder {
        InteractionResponder::new("ixn1", "tok1", Arc::clone(dir) as Arc<dyn Directory>)
    }

    #[tokio::test]
    async fn respond_visible_is_single_initial_call() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond("ok", false, false).await.unwrap();

        let calls = dir.calls();
        assert_eq!(calls.len(), 1);
        let Call::Initial(body) = &calls[0] else {
            panic!("expected initial response, got {calls:?}");
        };
        assert_eq!(body["type"], 4);
        assert_eq!(body["data"]["content"], "ok");
    }

    #[tokio::test]
    async fn respond_silent_is_empty_ack_then_edit() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond("ok", false, true).await.unwrap();

        let calls = dir.calls();
        assert_eq!(calls.len(), 2);
        let Call::Initial(ack) = &calls[0] else {
            panic!("expected initial response first");
        };
        assert_eq!(ack["data"]["content"], "");
        assert_eq!(
            calls[1],
            Call::Patch(MessageTarget::Original, json!({ "content": "ok" }))
        );
    }

    #[tokio::test]
    async fn second_respond_is_a_contract_violation() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond("first", false, false).await.unwrap();
        let err = rsp.respond("second", false, false).await.unwrap_err();
        assert!(matches!(err, ResponderError::AlreadyResponded));
        assert_eq!(dir.calls().len(), 1);
    }

    #[tokio::test]
    async fn private_sets_the_ephemeral_flag() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond("secret", true, false).await.unwrap();

        let Call::Initial(body) = &dir.calls()[0] else {
            panic!("expected initial response");
        };
        assert_eq!(body["data"]["flags"], 64);
    }

    #[tokio::test]
    async fn structured_content_passes_through() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond(json!({ "embeds": [{ "title": "hi" }] }), false, false)
            .await
            .unwrap();

        let Call::Initial(body) = &dir.calls()[0] else {
            panic!("expected initial response");
        };
        assert_eq!(body["data"]["embeds"][0]["title"], "hi");
    }

    #[tokio::test]
    async fn followup_silent_edits_the_created_message() {
        let dir = Arc::new(RecordingDirectory::with_followup_id("m42"));
        let rsp = responder(&dir);
        rsp.followup("later", false, true).await.unwrap();

        let calls = dir.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Followup(body) if body["content"] == ""));
        assert_eq!(
            calls[1],
            Call::Patch(
                MessageTarget::Id("m42".to_string()),
                json!({ "content": "later" })
            )
        );
    }

    #[tokio::test]
    async fn followup_silent_without_echo_falls_back_to_original() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.followup("later", false, true).await.unwrap();

        let calls = dir.calls();
        assert_eq!(
            calls[1],
            Call::Patch(MessageTarget::Original, json!({ "content": "later" }))
        );
    }

    #[tokio::test]
    async fn followup_may_repeat() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.respond("ok", false, false).await.unwrap();
        rsp.followup("one", false, false).await.unwrap();
        rsp.followup("two", false, false).await.unwrap();
        assert_eq!(dir.calls().len(), 3);
    }

    #[tokio::test]
    async fn edit_before_any_send_is_rejected() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        let err = rsp.edit("oops", None).await.unwrap_err();
        assert!(matches!(err, ResponderError::NothingSent));
        assert!(dir.calls().is_empty());
    }

    #[tokio::test]
    async fn edit_with_explicit_target() {
        let dir = Arc::new(RecordingDirectory::default());
        let rsp = responder(&dir);
        rsp.edit("fixed", Some("m7".to_string())).await.unwrap();
        assert_eq!(
            dir.calls(),
            vec![Call::Patch(
                MessageTarget::Id("m7".to_string()),
                json!({ "content": "fixed" })
            )]
        );
    }
}
