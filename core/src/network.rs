//! Network layer for SkillSwap - session REST API client

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use crate::error::{Error, Result};
use crate::models::*;
use crate::ClientConfig;

/// Remote operations the scheduling layer depends on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_request(&self, request: &NewSessionRequest) -> Result<SessionRequest>;

    /// Most recent pending request between the caller and `peer`.
    async fn latest_request(&self, peer: &str) -> Result<Option<SessionRequest>>;

    async fn accept_request(&self, request_id: i64) -> Result<Meeting>;

    async fn reject_request(&self, request_id: i64) -> Result<()>;

    async fn meetings_with(&self, peer: &str) -> Result<Vec<Meeting>>;

    /// Every meeting of the caller.
    async fn meetings(&self) -> Result<Vec<Meeting>>;

    async fn delete_meeting(&self, meeting_id: i64) -> Result<()>;
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    base_url: Url,
    prefix: Vec<String>,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(&config.http_url(), &config.api_prefix)
    }

    pub fn with_base_url(base_url: &str, api_prefix: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            prefix: api_prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    pub fn clear_token(&self) {
        *self.token.lock() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.lock().is_some()
    }

    fn auth_header(&self) -> Option<String> {
        self.token.lock().as_ref().map(|t| format!("Bearer {}", t))
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Http(format!("Base URL cannot carry a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn session_url(&self, segments: &[&str]) -> Result<Url> {
        let mut all: Vec<&str> = self.prefix.iter().map(String::as_str).collect();
        all.extend_from_slice(segments);
        self.url(&all)
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let auth = self.auth_header().ok_or(Error::NotLoggedIn)?;
        Ok(self.client.request(method, url).header("Authorization", auth))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::NotLoggedIn);
        }

        let text = resp.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            message: remote_message(&text).unwrap_or_else(|| status.to_string()),
        })
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self.send(req).await?;
        Ok(resp.json::<T>().await?)
    }

    pub async fn login(&self, email: &str, access_key: &str) -> Result<AuthSession> {
        let resp = self
            .client
            .post(self.url(&["api", "v1", "auth", "login"])?)
            .json(&json!({
                "email": email,
                "accessKey": access_key,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Remote {
                status,
                message: remote_message(&text).unwrap_or_else(|| "Invalid credentials".to_string()),
            });
        }

        let data: serde_json::Value = resp.json().await?;

        let session = AuthSession {
            token: data["token"].as_str().unwrap_or_default().to_string(),
            email: email.to_string(),
            expires_at: data["expiresAt"].as_i64().unwrap_or(0),
        };

        if session.token.is_empty() {
            return Err(Error::Http("Login response carried no token".to_string()));
        }

        self.set_token(&session.token);
        log::info!("Logged in as {}", email);

        Ok(session)
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self.client.get(self.url(&["health"])?).send().await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Pulls a human-readable message out of an error body.
fn remote_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => value["error"]["message"]
            .as_str()
            .or_else(|| value["message"].as_str())
            .or_else(|| value["error"].as_str())
            .map(str::to_string)
            .or_else(|| Some(trimmed.to_string())),
        Err(_) => Some(trimmed.to_string()),
    }
}

#[async_trait]
impl SessionApi for ApiClient {
    async fn create_request(&self, request: &NewSessionRequest) -> Result<SessionRequest> {
        let req = self
            .request(Method::POST, self.session_url(&["request"])?)?
            .json(request);
        self.json(req).await
    }

    async fn latest_request(&self, peer: &str) -> Result<Option<SessionRequest>> {
        let req = self.request(
            Method::GET,
            self.session_url(&["requests", peer, "latest"])?,
        )?;

        let resp = match self.send(req).await {
            Ok(resp) => resp,
            Err(Error::Remote { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = resp.text().await?;
        let body = body.trim();
        if body.is_empty() || body == "null" {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(body)?))
    }

    async fn accept_request(&self, request_id: i64) -> Result<Meeting> {
        let id = request_id.to_string();
        let req = self.request(Method::POST, self.session_url(&["accept", &id])?)?;
        self.json(req).await
    }

    async fn reject_request(&self, request_id: i64) -> Result<()> {
        let id = request_id.to_string();
        let req = self.request(Method::POST, self.session_url(&["reject", &id])?)?;
        self.send(req).await?;
        Ok(())
    }

    async fn meetings_with(&self, peer: &str) -> Result<Vec<Meeting>> {
        let req = self.request(Method::GET, self.session_url(&["meetings", peer])?)?;
        let meetings: Option<Vec<Meeting>> = self.json(req).await?;
        Ok(meetings.unwrap_or_default())
    }

    async fn meetings(&self) -> Result<Vec<Meeting>> {
        let req = self.request(Method::GET, self.session_url(&["meetings"])?)?;
        let meetings: Option<Vec<Meeting>> = self.json(req).await?;
        Ok(meetings.unwrap_or_default())
    }

    async fn delete_meeting(&self, meeting_id: i64) -> Result<()> {
        let id = meeting_id.to_string();
        let req = self.request(Method::DELETE, self.session_url(&["meeting", &id])?)?;
        self.send(req).await?;
        Ok(())
    }
}
