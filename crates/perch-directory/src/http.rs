//! reqwest implementation of the [`Directory`] trait

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::{Directory, DirectoryError, MessageTarget};

const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// HTTP directory client. Holds the application id (definitions and webhook
/// routes are addressed by it) and the bot token for auth.
#[derive(Clone)]
pub struct HttpDirectory {
    http: Client,
    base_url: String,
    application_id: String,
    token: String,
}

impl HttpDirectory {
    pub fn new(application_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, application_id, token)
    }

    /// Point the client at a non-default API root, mainly for tests against
    /// a local server.
    pub fn with_base_url(
        base_url: impl Into<String>,
        application_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            application_id: application_id.into(),
            token: token.into(),
        }
    }

    fn definitions_url(&self, scope: Option<&str>) -> String {
        match scope {
            None => format!(
                "{}/applications/{}/commands",
                self.base_url, self.application_id
            ),
            Some(scope_id) => format!(
                "{}/applications/{}/guilds/{}/commands",
                self.base_url, self.application_id, scope_id
            ),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        debug!("{} {}", method, url);
        self.http
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token))
    }

    async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, DirectoryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DirectoryError::Status {
            code: status.as_u16(),
            body,
        })
    }

    async fn json_body(resp: reqwest::Response) -> Result<Value, DirectoryError> {
        resp.json::<Value>()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn list_global_definitions(&self) -> Result<Vec<Value>, DirectoryError> {
        let resp = self
            .request(Method::GET, &self.definitions_url(None))
            .send()
            .await?;
        let body = Self::json_body(Self::expect_success(resp).await?).await?;
        match body {
            Value::Array(defs) => Ok(defs),
            other => Err(DirectoryError::Decode(format!(
                "expected definition list, got {other}"
            ))),
        }
    }

    async fn list_scoped_definitions(&self, scope_id: &str) -> Result<Vec<Value>, DirectoryError> {
        let resp = self
            .request(Method::GET, &self.definitions_url(Some(scope_id)))
            .send()
            .await?;
        let body = Self::json_body(Self::expect_success(resp).await?).await?;
        match body {
            Value::Array(defs) => Ok(defs),
            other => Err(DirectoryError::Decode(format!(
                "expected definition list, got {other}"
            ))),
        }
    }

    async fn create_definition(
        &self,
        scope: Option<&str>,
        def: &Value,
    ) -> Result<Value, DirectoryError> {
        let resp = self
            .request(Method::POST, &self.definitions_url(scope))
            .json(def)
            .send()
            .await?;
        Self::json_body(Self::expect_success(resp).await?).await
    }

    async fn patch_definition(
        &self,
        scope: Option<&str>,
        id: &str,
        def: &Value,
    ) -> Result<Value, DirectoryError> {
        let url = format!("{}/{}", self.definitions_url(scope), id);
        let resp = self.request(Method::PATCH, &url).json(def).send().await?;
        Self::json_body(Self::expect_success(resp).await?).await
    }

    async fn delete_definition(&self, scope: Option<&str>, id: &str) -> Result<(), DirectoryError> {
        let url = format!("{}/{}", self.definitions_url(scope), id);
        let resp = self.request(Method::DELETE, &url).send().await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn post_initial_response(
        &self,
        interaction_id: &str,
        token: &str,
        body: &Value,
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/interactions/{}/{}/callback",
            self.base_url, interaction_id, token
        );
        let resp = self.request(Method::POST, &url).json(body).send().await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn post_followup(
        &self,
        token: &str,
        body: &Value,
    ) -> Result<Option<Value>, DirectoryError> {
        let url = format!(
            "{}/webhooks/{}/{}",
            self.base_url, self.application_id, token
        );
        let resp = self.request(Method::POST, &url).json(body).send().await?;
        let resp = Self::expect_success(resp).await?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(Self::json_body(resp).await?))
    }

    async fn patch_message(
        &self,
        token: &str,
        target: &MessageTarget,
        body: &Value,
    ) -> Result<(), DirectoryError> {
        let message_ref = match target {
            MessageTarget::Original => "@original",
            MessageTarget::Id(id) => id.as_str(),
        };
        let url = format!(
            "{}/webhooks/{}/{}/messages/{}",
            self.base_url, self.application_id, token, message_ref
        );
        let resp = self.request(Method::PATCH, &url).json(body).send().await?;
        Self::expect_success(resp).await?;
        Ok(())
    }
}
