// http.rs — HTTPS 传输层
// 所有来源的请求都经过这里：只允许 HTTPS，限制超时与响应大小

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::security::{self, SecurityError};

/// 整个请求（含读取响应体）的超时
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 响应体上限 50 MiB
pub const MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) wallart/0.1";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API request failed: {status} ({url})")]
    Status { status: u16, url: String },
    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error(transparent)]
    Insecure(#[from] SecurityError),
    #[error("request cancelled")]
    Cancelled,
}

/// HTTP GET 能力
///
/// 真实实现是 [`HttpClient`]；测试里用假实现替换，从而不访问网络。
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// 发送 GET 请求并返回完整响应体
    async fn get_bytes(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError>;
}

/// 基于 reqwest 的 HTTPS 客户端
pub struct HttpClient {
    /// HTTP 客户端（内部有连接池，应复用）
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .https_only(true) // 重定向到 http 也会被拒绝
            .build()?;

        Ok(Self {
            client,
            max_bytes: MAX_RESPONSE_BYTES,
        })
    }

    async fn send(&self, url: reqwest::Url, headers: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let limit = self.max_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::TooLarge { limit });
        }

        // 逐块读取，Content-Length 缺失或不实时也能卡住上限
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get_bytes(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let url = security::require_https(url)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.send(url, headers) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_http_is_rejected_before_sending() {
        let client = HttpClient::new().unwrap();
        let cancel = CancellationToken::new();
        let result = client.get_bytes("http://example.org/a.jpg", &[], &cancel).await;
        assert!(matches!(result, Err(FetchError::Insecure(_))));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = HttpClient::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        // 10.255.255.1 不可路由，只有取消分支能让它立即返回
        let result = client.get_bytes("https://10.255.255.1/x", &[], &cancel).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
