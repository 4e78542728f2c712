// source/mod.rs — 艺术品来源模块入口
// 定义了所有馆藏来源必须实现的通用 Trait，以及统一的作品元数据结构

pub mod artic;
pub mod cleveland;
pub mod met;
pub mod vam;

use async_trait::async_trait; // 异步 Trait 支持宏
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::http::{FetchError, HttpFetch};
use crate::security::{self, SecurityError};

/// 统一的作品元数据结构
/// 不论来自哪个馆藏，都转换成这个结构体供上层使用
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtworkResult {
    /// 清洗后的作品 ID（只含字母数字、`_`、`-`）
    pub id: String,
    pub title: String,
    pub artist: String,
    pub date: String,
    pub medium: String,
    /// 原图地址，必须为 HTTPS
    pub image_url: String,
    /// 来源名称（如 "Art Institute of Chicago"）
    pub provider_name: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl SourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Fetch(FetchError::Cancelled))
    }
}

/// 馆藏来源的抽象 Trait
/// 所有的来源客户端都应该实现这个 Trait
///
/// # 异步 Trait 说明
/// 这里使用 `async_trait` 宏，使 Trait 可以作为 `dyn ArtSource` 使用。
#[async_trait]
pub trait ArtSource: Send + Sync {
    /// 来源名称，同时也是配置里开关的键
    fn name(&self) -> &'static str;

    /// 随机挑选一件作品，返回其元数据与 HTTPS 图片地址
    async fn fetch_one(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError>;

    /// 下载图片时需要附带的请求头
    fn download_headers(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }
}

/// 固定的四个来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    ArtInstituteOfChicago,
    ClevelandMuseumOfArt,
    MetropolitanMuseumOfArt,
    VictoriaAndAlbertMuseum,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::ArtInstituteOfChicago,
        ProviderKind::ClevelandMuseumOfArt,
        ProviderKind::MetropolitanMuseumOfArt,
        ProviderKind::VictoriaAndAlbertMuseum,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::ArtInstituteOfChicago => artic::NAME,
            ProviderKind::ClevelandMuseumOfArt => cleveland::NAME,
            ProviderKind::MetropolitanMuseumOfArt => met::NAME,
            ProviderKind::VictoriaAndAlbertMuseum => vam::NAME,
        }
    }

    /// 命令行使用的短名
    pub fn alias(&self) -> &'static str {
        match self {
            ProviderKind::ArtInstituteOfChicago => "aic",
            ProviderKind::ClevelandMuseumOfArt => "cma",
            ProviderKind::MetropolitanMuseumOfArt => "met",
            ProviderKind::VictoriaAndAlbertMuseum => "vam",
        }
    }

    /// 通过短名或全名查找（忽略大小写）
    pub fn parse(value: &str) -> Option<ProviderKind> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.alias().eq_ignore_ascii_case(value) || k.name().eq_ignore_ascii_case(value))
    }

    pub fn build(&self, http: Arc<dyn HttpFetch>) -> Arc<dyn ArtSource> {
        match self {
            ProviderKind::ArtInstituteOfChicago => Arc::new(artic::ArticClient::new(http)),
            ProviderKind::ClevelandMuseumOfArt => Arc::new(cleveland::ClevelandClient::new(http)),
            ProviderKind::MetropolitanMuseumOfArt => Arc::new(met::MetClient::new(http)),
            ProviderKind::VictoriaAndAlbertMuseum => Arc::new(vam::VamClient::new(http)),
        }
    }

    /// 构建全部四个来源
    pub fn build_all(http: Arc<dyn HttpFetch>) -> Vec<Arc<dyn ArtSource>> {
        Self::ALL.iter().map(|k| k.build(Arc::clone(&http))).collect()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GET 并把 JSON 响应体解析为 `T`
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    http: &dyn HttpFetch,
    url: &str,
    headers: &[(&str, &str)],
    cancel: &CancellationToken,
) -> Result<T, SourceError> {
    let bytes = http.get_bytes(url, headers, cancel).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// 原始字段（可能为空或空白）转为展示文本
pub(crate) fn text_or(value: Option<String>, fallback: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// 组装作品：清洗 ID 并确认图片地址为 HTTPS
pub(crate) fn build_artwork(
    provider: &str,
    raw_id: &str,
    title: Option<String>,
    artist: Option<String>,
    date: Option<String>,
    medium: Option<String>,
    image_url: &str,
) -> Result<ArtworkResult, SourceError> {
    if image_url.trim().is_empty() {
        return Err(SourceError::NotFound("no suitable image found".to_string()));
    }
    let url = security::require_https(image_url.trim())?;

    Ok(ArtworkResult {
        id: security::sanitize_id(raw_id),
        title: text_or(title, "Unknown Title"),
        artist: text_or(artist, "Unknown Artist"),
        date: date.unwrap_or_default(),
        medium: text_or(medium, "Painting"),
        image_url: url.to_string(),
        provider_name: provider.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// 按 URL 前缀返回预置响应的假 HTTP 实现，并记录所有请求
    #[derive(Default)]
    pub struct FakeHttp {
        routes: Mutex<Vec<(String, Vec<u8>)>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl FakeHttp {
        pub fn new() -> Self {
            Self::default()
        }

        /// 注册一个响应；同一前缀注册多次时按注册顺序依次返回，最后一个会被重复使用
        pub fn route(self, prefix: &str, body: impl Into<Vec<u8>>) -> Self {
            self.routes.lock().push((prefix.to_string(), body.into()));
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl HttpFetch for FakeHttp {
        async fn get_bytes(
            &self,
            url: &str,
            _headers: &[(&str, &str)],
            cancel: &CancellationToken,
        ) -> Result<Vec<u8>, FetchError> {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            self.requests.lock().push(url.to_string());
            crate::security::require_https(url)?;

            let mut routes = self.routes.lock();
            let matches: Vec<usize> = routes
                .iter()
                .enumerate()
                .filter(|(_, (prefix, _))| url.starts_with(prefix.as_str()))
                .map(|(i, _)| i)
                .collect();

            match matches.as_slice() {
                [] => Err(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
                [only] => Ok(routes[*only].1.clone()),
                [first, ..] => Ok(routes.remove(*first).1),
            }
        }
    }
}
