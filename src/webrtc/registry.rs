//! Client for the backend session registry that issues and ends stream sessions.

use crate::errors::RegistryError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Boundary to the REST session registry.
///
/// `stop_session` must tolerate sessions that have already ended.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn start_session(
        &self,
        client_id: &str,
        camera_id: &str,
        site_id: &str,
    ) -> Result<String, RegistryError>;

    async fn stop_session(&self, session_id: &str) -> Result<(), RegistryError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest<'a> {
    client_id: &'a str,
    camera_id: &'a str,
    site_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopSessionRequest<'a> {
    session_id: &'a str,
}

/// reqwest-backed registry client
pub struct HttpSessionRegistry {
    client: reqwest::Client,
    base: Url,
    auth_token: Option<String>,
}

impl HttpSessionRegistry {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| RegistryError::Request(format!("invalid registry url {}: {}", base_url, e)))?;
        // join() drops the last path segment unless the base ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base,
            auth_token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RegistryError> {
        self.base
            .join(path)
            .map_err(|e| RegistryError::Request(e.to_string()))
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SessionRegistry for HttpSessionRegistry {
    async fn start_session(
        &self,
        client_id: &str,
        camera_id: &str,
        site_id: &str,
    ) -> Result<String, RegistryError> {
        log::info!("Requesting stream session for camera {} at site {}", camera_id, site_id);
        let response = self
            .post(self.endpoint("streams/start")?)
            .json(&StartSessionRequest {
                client_id,
                camera_id,
                site_id,
            })
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: StartSessionResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        log::info!("Registry issued session {}", body.session_id);
        Ok(body.session_id)
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), RegistryError> {
        log::info!("Ending stream session {}", session_id);
        let response = self
            .post(self.endpoint("streams/stop")?)
            .json(&StopSessionRequest { session_id })
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                log::debug!("Session {} already ended", session_id);
                Ok(())
            }
            status => Err(RegistryError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
