//! Directory client: the outbound HTTP surface of the framework
//!
//! The gateway only pushes events; everything the bot writes back (command
//! definitions, interaction responses, follow-up messages) goes through the
//! [`Directory`] trait. Production code uses [`HttpDirectory`]; tests swap in
//! recording fakes.

pub mod http;

use async_trait::async_trait;
use serde_json::Value;

pub use http::HttpDirectory;

/// Errors from directory calls. All verbs are remote and may fail.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Http(String),
    #[error("directory returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("failed to decode directory response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        DirectoryError::Http(err.to_string())
    }
}

/// Which previously sent message an edit targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// The initial acknowledgment of the interaction.
    Original,
    /// An explicit follow-up message id.
    Id(String),
}

/// Typed verbs against the remote directory. Definition bodies travel as
/// raw JSON; their schema belongs to the caller, not to this crate.
#[async_trait]
pub trait Directory: Send + Sync {
    /// All globally registered command definitions.
    async fn list_global_definitions(&self) -> Result<Vec<Value>, DirectoryError>;

    /// All definitions registered for one group scope.
    async fn list_scoped_definitions(&self, scope_id: &str) -> Result<Vec<Value>, DirectoryError>;

    /// Register a new definition; `scope` of `None` means global.
    async fn create_definition(
        &self,
        scope: Option<&str>,
        def: &Value,
    ) -> Result<Value, DirectoryError>;

    /// Overwrite an existing definition by remote id.
    async fn patch_definition(
        &self,
        scope: Option<&str>,
        id: &str,
        def: &Value,
    ) -> Result<Value, DirectoryError>;

    /// Remove a definition by remote id.
    async fn delete_definition(&self, scope: Option<&str>, id: &str) -> Result<(), DirectoryError>;

    /// Post the single initial acknowledgment for an interaction.
    async fn post_initial_response(
        &self,
        interaction_id: &str,
        token: &str,
        body: &Value,
    ) -> Result<(), DirectoryError>;

    /// Post a follow-up message; returns the created message (carrying its
    /// id) when the remote side provides one.
    async fn post_followup(&self, token: &str, body: &Value)
    -> Result<Option<Value>, DirectoryError>;

    /// Edit a previously sent message addressed by `target`.
    async fn patch_message(
        &self,
        token: &str,
        target: &MessageTarget,
        body: &Value,
    ) -> Result<(), DirectoryError>;
}
