//! HTTP client for the orchestrator API

use anyhow::{bail, Context};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use flux_core::Event;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("server returned {status}: {body}");
        }
        response.json().await.context("malformed server response")
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    pub async fn register_workflow(
        &self,
        metadata: serde_json::Value,
        source: String,
    ) -> anyhow::Result<serde_json::Value> {
        let form = reqwest::multipart::Form::new()
            .text("metadata", metadata.to_string())
            .text("source", source);

        let response = self
            .http
            .post(self.url("/workflows"))
            .multipart(form)
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    pub async fn run_workflow(
        &self,
        name: &str,
        mode: &str,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(&format!("/workflows/{name}/run/{mode}")))
            .json(input)
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    pub async fn resume_workflow(
        &self,
        name: &str,
        id: Uuid,
        mode: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(&format!("/workflows/{name}/resume/{id}/{mode}")))
            .json(payload)
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    pub async fn cancel_workflow(&self, name: &str, id: Uuid) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workflows/{name}/cancel/{id}")))
            .send()
            .await
            .context("server unreachable")?;
        let status = response.status();
        if !status.is_success() {
            bail!("server returned {status}");
        }
        Ok(())
    }

    pub async fn workflow_status(
        &self,
        name: &str,
        id: Uuid,
        detailed: bool,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url(&format!(
                "/workflows/{name}/status/{id}?detailed={detailed}"
            )))
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    /// Submit in stream mode and print one `KIND json` line per event,
    /// returning the terminal execution-state line
    pub async fn stream_run(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("server unreachable")?;

        let status = response.status();
        if !status.is_success() {
            bail!("server returned {status}");
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(item) = events.next().await {
            match item {
                Ok(message) => {
                    if let Ok(event) = serde_json::from_str::<Event>(&message.data) {
                        println!("{} {}", event.kind, message.data);
                        if event.is_terminal() {
                            break;
                        }
                    }
                }
                Err(e) => bail!("stream error: {e}"),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    pub async fn secret_set(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/secrets/{name}")))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .context("server unreachable")?;
        if !response.status().is_success() {
            bail!("server returned {}", response.status());
        }
        Ok(())
    }

    pub async fn secret_get(&self, name: &str) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url(&format!("/secrets/{name}")))
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    pub async fn secret_list(&self) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url("/secrets"))
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }

    pub async fn secret_remove(&self, name: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/secrets/{name}")))
            .send()
            .await
            .context("server unreachable")?;
        if !response.status().is_success() {
            bail!("server returned {}", response.status());
        }
        Ok(())
    }

    pub async fn secret_rotate(
        &self,
        name: &str,
        value: Option<&str>,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({ "value": value });
        let response = self
            .http
            .post(self.url(&format!("/secrets/{name}/rotate")))
            .json(&body)
            .send()
            .await
            .context("server unreachable")?;
        Self::decode(response).await
    }
}
