//! Collaborator clients: entity registry, user directory, email service.
//!
//! Each collaborator is addressed by a base URL from configuration and
//! consumed through a trait so tests can substitute mocks. Failures are
//! surfaced as [`CollabError`] and recorded at the step level by the
//! executor; a collaborator outage never turns into a 5xx on the
//! dispatching request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use domo_core::Role;

/// Errors from collaborator calls.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    #[error("collaborator returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collaborator response malformed: {0}")]
    Malformed(String),
}

/// Resolves selectors (`tag:kitchen`) to device id sets.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn resolve(&self, selector: &str) -> Result<Vec<String>, CollabError>;
}

/// Expands a role to the user ids holding it.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, CollabError>;
}

/// Delivers one email to one user.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, user_id: &str, subject: &str, message: &str) -> Result<(), CollabError>;
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CollabError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollabError::Status {
        status: status.as_u16(),
        body,
    })
}

/// HTTP entity registry client.
pub struct HttpEntityRegistry {
    http: reqwest::Client,
    base: String,
}

impl HttpEntityRegistry {
    #[must_use]
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[derive(Deserialize)]
struct ResolveResponse {
    device_ids: Vec<String>,
}

#[async_trait]
impl EntityRegistry for HttpEntityRegistry {
    async fn resolve(&self, selector: &str) -> Result<Vec<String>, CollabError> {
        let response = self
            .http
            .get(format!("{}/api/registry/resolve", self.base))
            .query(&[("selector", selector)])
            .send()
            .await
            .map_err(|e| CollabError::Unreachable(e.to_string()))?;
        let body: ResolveResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| CollabError::Malformed(e.to_string()))?;
        Ok(body.device_ids)
    }
}

/// HTTP user directory client.
pub struct HttpUserDirectory {
    http: reqwest::Client,
    base: String,
}

impl HttpUserDirectory {
    #[must_use]
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[derive(Deserialize)]
struct UsersResponse {
    user_ids: Vec<String>,
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, CollabError> {
        let response = self
            .http
            .get(format!("{}/api/users/roles/{role}/users", self.base))
            .send()
            .await
            .map_err(|e| CollabError::Unreachable(e.to_string()))?;
        let body: UsersResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| CollabError::Malformed(e.to_string()))?;
        Ok(body.user_ids)
    }
}

/// HTTP email service client.
pub struct HttpEmailSender {
    http: reqwest::Client,
    base: String,
}

impl HttpEmailSender {
    #[must_use]
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, user_id: &str, subject: &str, message: &str) -> Result<(), CollabError> {
        let response = self
            .http
            .post(format!("{}/api/email/send", self.base))
            .json(&serde_json::json!({
                "user_id": user_id,
                "subject": subject,
                "message": message,
            }))
            .send()
            .await
            .map_err(|e| CollabError::Unreachable(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}

/// Per-run selector resolution cache.
///
/// Lives inside one run's executor frame: selector results are snapshotted
/// at first use so repeated fan-out within the run neither hammers the
/// registry nor observes membership changes mid-run. A fresh cache is built
/// for every run.
pub struct SelectorCache {
    entries: HashMap<String, (Instant, Vec<String>)>,
    ttl: Duration,
}

impl SelectorCache {
    /// Create a cache with the given entry TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Resolve through the cache, consulting the registry on miss or
    /// expiry. Results are deduplicated preserving first occurrence.
    pub async fn resolve(
        &mut self,
        registry: &dyn EntityRegistry,
        selector: &str,
    ) -> Result<Vec<String>, CollabError> {
        if let Some((at, ids)) = self.entries.get(selector) {
            if at.elapsed() < self.ttl {
                return Ok(ids.clone());
            }
        }
        let mut ids = registry.resolve(selector).await?;
        dedup_preserving_order(&mut ids);
        self.entries
            .insert(selector.to_owned(), (Instant::now(), ids.clone()));
        Ok(ids)
    }
}

/// Remove duplicates keeping the first occurrence of each id.
pub fn dedup_preserving_order(ids: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}
