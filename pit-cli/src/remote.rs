//! HTTP remote channel for the pit CLI.
//!
//! Speaks to a pit server's /repos endpoints: JSON for control requests,
//! compressed binary frames for object payloads. Implements `RemoteChannel`
//! so the sync engine in pit-core drives it without knowing about HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use pit_core::sync::{RemoteChannel, RepoId, SyncError};
use pit_core::{wire, ObjectId};
use std::collections::HashSet;

pub struct HttpChannel {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChannel {
    /// Create a channel targeting `base_url` (e.g. `http://server:8080`).
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { base_url: url, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into the matching `SyncError`.
    async fn error_for(&self, repo_name: &str, resp: reqwest::Response) -> SyncError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        match status {
            404 => SyncError::NotFound(repo_name.to_string()),
            409 => SyncError::NonFastForward,
            422 => SyncError::Conflict,
            _ => SyncError::Transport(format!("server returned {}: {}", status, body)),
        }
    }

    async fn send(
        &self,
        repo_name: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SyncError> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(self.error_for(repo_name, resp).await)
        }
    }
}

#[derive(serde::Serialize)]
struct IdsRequest {
    ids: Vec<String>,
}

impl IdsRequest {
    fn new(ids: &[ObjectId]) -> Self {
        Self { ids: ids.iter().map(|id| id.to_hex()).collect() }
    }
}

#[derive(serde::Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(serde::Deserialize)]
struct HeadResponse {
    head: Option<String>,
}

#[derive(serde::Deserialize)]
struct HasResponse {
    present: Vec<String>,
}

fn parse_id(hex: &str) -> Result<ObjectId, SyncError> {
    ObjectId::from_hex(hex)
        .map_err(|_| SyncError::Transport(format!("server sent invalid object id: {}", hex)))
}

#[async_trait]
impl RemoteChannel for HttpChannel {
    async fn create(&self, repo_name: &str) -> Result<RepoId, SyncError> {
        let req = self
            .http
            .post(self.url("/repos/create"))
            .json(&serde_json::json!({ "name": repo_name }));
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;
        // 409 on create means the name is taken, not a head conflict.
        if resp.status().as_u16() == 409 {
            return Err(SyncError::AlreadyExists(repo_name.to_string()));
        }
        if !resp.status().is_success() {
            return Err(self.error_for(repo_name, resp).await);
        }
        let body: CreateResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("bad create response: {}", e)))?;
        Ok(body.id)
    }

    async fn get_head(&self, repo_name: &str) -> Result<Option<ObjectId>, SyncError> {
        let req = self.http.get(self.url(&format!("/repos/{}/head", repo_name)));
        let resp = self.send(repo_name, req).await?;
        let body: HeadResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("bad head response: {}", e)))?;
        body.head.as_deref().map(parse_id).transpose()
    }

    async fn has_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<HashSet<ObjectId>, SyncError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/has", repo_name)))
            .json(&IdsRequest::new(ids));
        let resp = self.send(repo_name, req).await?;
        let body: HasResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("bad has response: {}", e)))?;
        body.present.iter().map(|hex| parse_id(hex)).collect()
    }

    async fn fetch_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<(ObjectId, Option<Bytes>)>, SyncError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/fetch", repo_name)))
            .json(&IdsRequest::new(ids));
        let resp = self.send(repo_name, req).await?;
        let frame = resp
            .bytes()
            .await
            .map_err(|e| SyncError::Transport(format!("failed to read object frame: {}", e)))?;
        wire::open_objects(&frame)
            .map_err(|e| SyncError::Transport(format!("bad object frame: {}", e)))
    }

    async fn push_objects(
        &self,
        repo_name: &str,
        objects: Vec<(ObjectId, Bytes)>,
    ) -> Result<(), SyncError> {
        if objects.is_empty() {
            return Ok(());
        }
        let framed: Vec<(ObjectId, Option<Bytes>)> =
            objects.into_iter().map(|(id, data)| (id, Some(data))).collect();
        let frame = wire::seal_objects(&framed)
            .map_err(|e| SyncError::Transport(format!("failed to encode objects: {}", e)))?;
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/objects", repo_name)))
            .header("Content-Type", "application/octet-stream")
            .body(frame);
        self.send(repo_name, req).await?;
        Ok(())
    }

    async fn advance_head(
        &self,
        repo_name: &str,
        expected: Option<ObjectId>,
        new_head: ObjectId,
    ) -> Result<(), SyncError> {
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/head/advance", repo_name)))
            .json(&serde_json::json!({
                "expected": expected.map(|id| id.to_hex()),
                "new_head": new_head.to_hex(),
            }));
        self.send(repo_name, req).await?;
        Ok(())
    }
}
