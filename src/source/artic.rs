// artic.rs — Art Institute of Chicago API 异步客户端
// 搜索公有领域的油画，拼出 IIIF 图片地址
//
// 注意：AIC 要求请求携带 AIC-User-Agent，下载图片时还需要浏览器风格的请求头。

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{build_artwork, fetch_json, ArtSource, ArtworkResult, SourceError};
use crate::http::HttpFetch;
use crate::security;

pub const NAME: &str = "Art Institute of Chicago";

const SEARCH_URL: &str = "https://api.artic.edu/api/v1/artworks/search";
const IIIF_URL: &str = "https://www.artic.edu/iiif/2";
const MAX_ATTEMPTS: u32 = 3;

const API_HEADERS: &[(&str, &str)] = &[
    ("AIC-User-Agent", "wallart/0.1 (https://github.com/wsdehl/wallart)"),
    ("Accept", "application/json"),
    ("Referer", "https://www.artic.edu/"),
];

const IMAGE_HEADERS: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    ),
    ("AIC-User-Agent", "wallart/0.1 (https://github.com/wsdehl/wallart)"),
    ("Accept", "image/webp,image/apng,image/*,*/*;q=0.8"),
    ("Referer", "https://www.artic.edu/"),
];

/// 搜索响应的顶层结构
#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Artwork>,
    /// API 出错时会返回 error 字段而不是 data
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// 单件作品，只提取需要的字段
#[derive(Deserialize, Debug)]
struct Artwork {
    title: Option<String>,
    image_id: Option<String>,
    artist_title: Option<String>,
    is_public_domain: Option<bool>,
    artwork_type_title: Option<String>,
}

pub struct ArticClient {
    http: Arc<dyn HttpFetch>,
    rng: Mutex<StdRng>,
}

impl ArticClient {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self::with_rng(http, StdRng::from_entropy())
    }

    pub fn with_rng(http: Arc<dyn HttpFetch>, rng: StdRng) -> Self {
        Self {
            http,
            rng: Mutex::new(rng),
        }
    }

    /// 单次尝试：随机翻到一页，按随机顺序找第一件合格的作品
    async fn attempt(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
        let page: u32 = self.rng.lock().gen_range(1..100);
        let url = format!(
            "{SEARCH_URL}?q=painting&limit=40&fields=title,image_id,thumbnail,artist_title,is_public_domain,artwork_type_title&page={page}"
        );

        let response: SearchResponse = fetch_json(self.http.as_ref(), &url, API_HEADERS, cancel).await?;

        if let Some(error) = response.error {
            let message: String = error.to_string().chars().take(150).collect();
            return Err(SourceError::Api(message));
        }

        if response.data.is_empty() {
            return Err(SourceError::NotFound("no artworks found on this page".to_string()));
        }

        let mut order: Vec<usize> = (0..response.data.len()).collect();
        order.shuffle(&mut *self.rng.lock());

        for index in order {
            let art = &response.data[index];

            if art.is_public_domain != Some(true) {
                continue;
            }
            if art.artwork_type_title.as_deref() != Some("Painting") {
                continue;
            }
            let Some(raw_image_id) = art.image_id.as_deref().filter(|id| !id.trim().is_empty()) else {
                continue;
            };

            // 先清洗再拼进 URL
            let image_id = security::sanitize_id(raw_image_id);
            let image_url = format!("{IIIF_URL}/{image_id}/full/843,/0/default.jpg");

            return build_artwork(
                NAME,
                &image_id,
                art.title.clone(),
                art.artist_title.clone(),
                None,
                art.artwork_type_title.clone(),
                &image_url,
            );
        }

        Err(SourceError::NotFound(
            "no suitable public domain painting found on this page".to_string(),
        ))
    }
}

#[async_trait]
impl ArtSource for ArticClient {
    fn name(&self) -> &'static str {
        NAME
    }

    /// 内部最多重试 3 次，全部失败时返回最后一次的错误
    async fn fetch_one(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
        tracing::info!(provider = NAME, "fetching artworks");

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(cancel).await {
                Ok(artwork) => return Ok(artwork),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = NAME, attempt, "attempt failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SourceError::NotFound("failed to fetch artwork after retries".to_string())
        }))
    }

    fn download_headers(&self) -> &'static [(&'static str, &'static str)] {
        IMAGE_HEADERS
    }
}
