// vam.rs — Victoria and Albert Museum API v2 客户端
// 随机翻页取一件带图片的油画，用 IIIF 拼出最大尺寸的图片地址

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{build_artwork, fetch_json, ArtSource, ArtworkResult, SourceError};
use crate::http::HttpFetch;
use crate::security;

pub const NAME: &str = "Victoria and Albert Museum";

const SEARCH_URL: &str = "https://api.vam.ac.uk/v2/objects/search";
const IIIF_URL: &str = "https://framemark.vam.ac.uk/collections";

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    records: Vec<Record>,
}

#[derive(Deserialize, Debug)]
struct Record {
    #[serde(rename = "systemNumber")]
    system_number: Option<String>,
    #[serde(rename = "_primaryTitle")]
    primary_title: Option<String>,
    #[serde(rename = "_primaryMaker")]
    primary_maker: Option<Maker>,
    #[serde(rename = "_primaryDate")]
    primary_date: Option<String>,
    #[serde(rename = "_primaryImageId")]
    primary_image_id: Option<String>,
    #[serde(rename = "_images", default)]
    images: Option<Images>,
}

#[derive(Deserialize, Debug)]
struct Maker {
    name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Images {
    #[serde(rename = "_primary_thumbnail")]
    primary_thumbnail: Option<String>,
}

impl Record {
    /// 图片 ID：优先 `_primaryImageId`，否则从缩略图地址
    /// `.../collections/{id}/full/...` 中取出
    fn image_id(&self) -> Option<String> {
        let direct = self
            .primary_image_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if let Some(id) = direct {
            return Some(id.to_string());
        }

        let thumbnail = self.images.as_ref()?.primary_thumbnail.as_deref()?;
        let rest = thumbnail.split("/collections/").nth(1)?;
        rest.split('/').next().filter(|id| !id.is_empty()).map(str::to_string)
    }
}

pub struct VamClient {
    http: Arc<dyn HttpFetch>,
    rng: Mutex<StdRng>,
}

impl VamClient {
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
impl ArtSource for VamClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch_one(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
        tracing::info!(provider = NAME, "fetching artworks");

        let page: u32 = self.rng.lock().gen_range(1..30);
        let url = format!("{SEARCH_URL}?images_exist=1&material=painting&page_size=100&page={page}");
        let response: SearchResponse = fetch_json(self.http.as_ref(), &url, &[], cancel).await?;

        if response.records.is_empty() {
            return Err(SourceError::NotFound("no artworks found".to_string()));
        }
        let index = self.rng.lock().gen_range(0..response.records.len());
        let record = &response.records[index];

        let raw_image_id = record
            .image_id()
            .ok_or_else(|| SourceError::NotFound("no suitable image found".to_string()))?;

        // 先清洗再拼进 URL
        let image_id = security::sanitize_id(&raw_image_id);
        let image_url = format!("{IIIF_URL}/{image_id}/full/max/0/default.jpg");

        build_artwork(
            NAME,
            record.system_number.as_deref().unwrap_or_default(),
            record.primary_title.clone(),
            record.primary_maker.as_ref().and_then(|m| m.name.clone()),
            record.primary_date.clone(),
            Some("Painting".to_string()),
            &image_url,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::FakeHttp;

    fn client(http: FakeHttp) -> (Arc<FakeHttp>, VamClient) {
        let http = Arc::new(http);
        let client = VamClient::with_rng(http.clone(), StdRng::seed_from_u64(11));
        (http, client)
    }

    #[tokio::test]
    async fn builds_iiif_url_from_thumbnail() {
        let body = r#"{"records":[{
            "systemNumber":"O1287421",
            "_primaryTitle":"The Hay Wain",
            "_primaryMaker":{"name":"John Constable","association":"artist"},
            "_primaryDate":"1821",
            "_images":{"_primary_thumbnail":"https://framemark.vam.ac.uk/collections/2006AM6764/full/!100,100/0/default.jpg"}
        }]}"#;
        let (_http, client) = client(FakeHttp::new().route(SEARCH_URL, body));

        let art = client.fetch_one(&CancellationToken::new()).await.unwrap();
        assert_eq!(art.id, "O1287421");
        assert_eq!(art.artist, "John Constable");
        assert_eq!(
            art.image_url,
            "https://framemark.vam.ac.uk/collections/2006AM6764/full/max/0/default.jpg"
        );
    }

    #[tokio::test]
    async fn prefers_primary_image_id() {
        let body = r#"{"records":[{"systemNumber":"O1","_primaryImageId":"2019LA1234","_images":{}}]}"#;
        let (_http, client) = client(FakeHttp::new().route(SEARCH_URL, body));

        let art = client.fetch_one(&CancellationToken::new()).await.unwrap();
        assert!(art.image_url.contains("/2019LA1234/"));
    }

    #[tokio::test]
    async fn record_without_image_is_not_found() {
        let body = r#"{"records":[{"systemNumber":"O1","_images":{"_primary_thumbnail":null}}]}"#;
        let (_http, client) = client(FakeHttp::new().route(SEARCH_URL, body));

        let result = client.fetch_one(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_page_is_not_found() {
        let (_http, client) = client(FakeHttp::new().route(SEARCH_URL, r#"{"records":[]}"#));
        let result = client.fetch_one(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }
}
