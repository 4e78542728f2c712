// cleveland.rs — Cleveland Museum of Art Open Access API 客户端
// 先查询油画总数，再随机跳过若干条取一件

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{build_artwork, fetch_json, ArtSource, ArtworkResult, SourceError};
use crate::http::HttpFetch;

pub const NAME: &str = "Cleveland Museum of Art";

const API_URL: &str = "https://openaccess-api.clevelandart.org/api/artworks/";
/// API 不允许 skip 过大，只在前 5000 条里随机
const MAX_SKIP: u64 = 5000;

#[derive(Deserialize, Debug)]
struct ListResponse {
    #[serde(default)]
    info: Option<Info>,
    #[serde(default)]
    data: Vec<Artwork>,
}

#[derive(Deserialize, Debug)]
struct Info {
    #[serde(default)]
    total: u64,
}

#[derive(Deserialize, Debug)]
struct Artwork {
    id: serde_json::Value,
    title: Option<String>,
    #[serde(default)]
    creators: Vec<Creator>,
    creation_date: Option<String>,
    technique: Option<String>,
    images: Option<Images>,
}

#[derive(Deserialize, Debug)]
struct Creator {
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Images {
    web: Option<ImageLink>,
    print: Option<ImageLink>,
}

#[derive(Deserialize, Debug)]
struct ImageLink {
    url: Option<String>,
}

pub struct ClevelandClient {
    http: Arc<dyn HttpFetch>,
    rng: Mutex<StdRng>,
}

impl ClevelandClient {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self::with_rng(http, StdRng::from_entropy())
    }

    pub fn with_rng(http: Arc<dyn HttpFetch>, rng: StdRng) -> Self {
        Self {
            http,
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl ArtSource for ClevelandClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch_one(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
        tracing::info!(provider = NAME, "fetching artworks");

        let count_url = format!("{API_URL}?has_image=1&type=Painting&limit=1");
        let count: ListResponse = fetch_json(self.http.as_ref(), &count_url, &[], cancel).await?;
        let total = count.info.map(|i| i.total).unwrap_or(0);
        if total == 0 {
            return Err(SourceError::NotFound("no artworks found".to_string()));
        }

        let skip = self.rng.lock().gen_range(0..total.min(MAX_SKIP));
        let url = format!("{API_URL}?has_image=1&type=Painting&limit=1&skip={skip}");
        let response: ListResponse = fetch_json(self.http.as_ref(), &url, &[], cancel).await?;

        let art = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound("no artworks found".to_string()))?;

        // id 在 API 中是整数，这里兼容字符串
        let id = match &art.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let artist = art.creators.into_iter().next().and_then(|c| c.description);

        let image_url = art
            .images
            .and_then(|images| {
                images
                    .web
                    .and_then(|l| l.url)
                    .filter(|u| !u.trim().is_empty())
                    .or_else(|| images.print.and_then(|l| l.url))
            })
            .unwrap_or_default();

        build_artwork(
            NAME,
            &id,
            art.title,
            artist,
            art.creation_date,
            art.technique,
            &image_url,
        )
    }
}
