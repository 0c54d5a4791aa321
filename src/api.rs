use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ClientError, ClientResult};
use crate::models::{
    AskRequest, AvailableModels, ChatDetail, ChatSummary, JobProgress, MessageReply,
    ProblemReport, ServerConfig, StatsResponse,
};
use crate::upload::UploadFile;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Called with (bytes sent, total bytes) as the upload body is consumed.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Thin wrapper over the document server's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, connect_timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(ApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn read_message(response: reqwest::Response) -> ClientResult<String> {
        let reply: MessageReply = Self::read_json(response).await?;
        reply.into_result()
    }

    /// `POST /upload`. Reports byte progress through `on_progress`.
    pub async fn upload(
        &self,
        file: &UploadFile,
        job_id: &str,
        on_progress: ProgressSink,
    ) -> ClientResult<String> {
        let bytes = tokio::fs::read(&file.path).await?;
        let total = bytes.len() as u64;
        let chunks: Vec<Vec<u8>> = bytes.chunks(UPLOAD_CHUNK).map(|c| c.to_vec()).collect();

        let mut sent = 0u64;
        let body = futures_util::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            on_progress(sent, total);
            Ok::<_, std::io::Error>(chunk)
        });

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(file.name.clone());
        let form = multipart::Form::new()
            .part("file", part)
            .text("job_id", job_id.to_string());

        let response = self.client.post(self.url("/upload")).multipart(form).send().await?;
        Self::read_message(response).await
    }

    /// `GET /progress/{job_id}`.
    pub async fn progress(&self, job_id: &str) -> ClientResult<JobProgress> {
        let response = self
            .client
            .get(self.url(&format!("/progress/{}", job_id)))
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// `POST /ask`. Returns the raw body stream of `data: {json}` lines.
    pub async fn ask(
        &self,
        request: &AskRequest,
    ) -> ClientResult<impl Stream<Item = reqwest::Result<impl AsRef<[u8]>>>> {
        let response = self.client.post(self.url("/ask")).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }

        Ok(response.bytes_stream())
    }

    pub async fn stats(&self) -> ClientResult<StatsResponse> {
        let response = self.client.get(self.url("/stats")).send().await?;
        Self::read_json(response).await
    }

    pub async fn chats(&self) -> ClientResult<Vec<ChatSummary>> {
        let response = self.client.get(self.url("/chats")).send().await?;
        Self::read_json(response).await
    }

    pub async fn chat(&self, id: &str) -> ClientResult<ChatDetail> {
        let response = self.client.get(self.url(&format!("/chats/{}", id))).send().await?;
        Self::read_json(response).await
    }

    pub async fn delete_chat(&self, id: &str) -> ClientResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/chats/{}", id)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }

    pub async fn toggle_public(&self, source: &str, is_public: bool) -> ClientResult<String> {
        let response = self
            .client
            .post(self.url("/toggle_public"))
            .json(&json!({ "source": source, "is_public": is_public }))
            .send()
            .await?;
        Self::read_message(response).await
    }

    pub async fn delete_source(&self, source: &str) -> ClientResult<String> {
        let response = self
            .client
            .post(self.url("/delete_source"))
            .json(&json!({ "source": source }))
            .send()
            .await?;
        Self::read_message(response).await
    }

    pub async fn reset_db(&self) -> ClientResult<String> {
        let response = self.client.post(self.url("/reset_db")).send().await?;
        Self::read_message(response).await
    }

    pub async fn server_config(&self) -> ClientResult<ServerConfig> {
        let response = self.client.get(self.url("/config")).send().await?;
        Self::read_json(response).await
    }

    pub async fn save_server_config(&self, config: &ServerConfig) -> ClientResult<String> {
        let response = self.client.post(self.url("/config")).json(config).send().await?;
        Self::read_message(response).await
    }

    pub async fn available_models(&self) -> ClientResult<Vec<String>> {
        let response = self.client.get(self.url("/available_models")).send().await?;
        let models: AvailableModels = Self::read_json(response).await?;
        Ok(models.models)
    }

    /// `POST /report` with an optional screenshot.
    pub async fn report(&self, report: &ProblemReport) -> ClientResult<String> {
        let mut form = multipart::Form::new()
            .text("content", report.content.clone())
            .text("message_id", report.message_id.clone().unwrap_or_default());

        if let Some(path) = &report.image {
            let bytes = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("image")
                .to_string();
            form = form.part("image", multipart::Part::bytes(bytes).file_name(name));
        }

        let response = self.client.post(self.url("/report")).multipart(form).send().await?;
        Self::read_message(response).await
    }

    /// Raw `GET` of a static asset, used by the asset cache.
    pub async fn asset(&self, path: &str) -> ClientResult<Vec<u8>> {
        let response = self.client.get(self.url(path)).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status { status: status.as_u16(), body: String::new() });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = ApiClient::new("http://127.0.0.1:5000/", Duration::from_secs(5)).unwrap();
        assert_eq!(api.base_url(), "http://127.0.0.1:5000");
        assert_eq!(api.url("/stats"), "http://127.0.0.1:5000/stats");
    }
}
