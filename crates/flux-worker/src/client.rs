//! HTTP client for the worker↔server channel

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use flux_core::{ServerFrame, WorkerFrame};

const FRAME_POST_ATTEMPTS: u32 = 3;
const FRAME_POST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Worker-side transport errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server rejected frame: {0}")]
    Rejected(reqwest::StatusCode),

    #[error("malformed server frame: {0}")]
    Decode(String),
}

/// One worker session's view of the orchestrator
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    session_id: Uuid,
    bootstrap_token: Option<String>,
}

impl ServerClient {
    pub fn new(base_url: &str, session_id: Uuid, bootstrap_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id,
            bootstrap_token,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Open the server→worker frame stream
    pub async fn connect(
        &self,
    ) -> Result<impl Stream<Item = Result<ServerFrame, WorkerClientError>>, WorkerClientError>
    {
        let url = format!(
            "{}/workers/connect?session_id={}",
            self.base_url, self.session_id
        );

        let mut request = self.http.get(&url);
        if let Some(token) = &self.bootstrap_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        debug!(%url, "worker channel connected");

        let frames = response.bytes_stream().eventsource().filter_map(|item| async {
            match item {
                Ok(event) if event.event == "frame" => Some(
                    serde_json::from_str::<ServerFrame>(&event.data)
                        .map_err(|e| WorkerClientError::Decode(e.to_string())),
                ),
                // Keepalive comments and unrelated events are dropped
                Ok(_) => None,
                Err(e) => Some(Err(WorkerClientError::Decode(e.to_string()))),
            }
        });

        Ok(frames)
    }

    /// Post one worker→server frame
    ///
    /// Retried a few times on transport loss; a 4xx rejection is final.
    pub async fn post_frame(&self, frame: &WorkerFrame) -> Result<(), WorkerClientError> {
        let url = format!("{}/workers/{}/frames", self.base_url, self.session_id);

        let mut last_err = None;
        for attempt in 1..=FRAME_POST_ATTEMPTS {
            let mut request = self.http.post(&url).json(frame);
            if let Some(token) = &self.bootstrap_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => return Err(WorkerClientError::Rejected(response.status())),
                Err(e) => {
                    warn!(attempt, "frame post failed: {e}");
                    last_err = Some(WorkerClientError::Transport(e));
                    if attempt < FRAME_POST_ATTEMPTS {
                        tokio::time::sleep(FRAME_POST_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt"))
    }

    /// Resolve a secret by name (task runtime seam)
    pub async fn get_secret(&self, name: &str) -> Result<Option<String>, WorkerClientError> {
        #[derive(Deserialize)]
        struct SecretResponse {
            value: String,
        }

        let url = format!("{}/secrets/{}", self.base_url, name);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.bootstrap_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: SecretResponse = response.error_for_status()?.json().await?;
        Ok(Some(body.value))
    }
}
