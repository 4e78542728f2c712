// met.rs — Metropolitan Museum of Art Collection API 客户端

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{build_artwork, fetch_json, ArtSource, ArtworkResult, SourceError};
use crate::http::HttpFetch;

pub const NAME: &str = "Metropolitan Museum of Art";

const API_URL: &str = "https://collectionapi.metmuseum.org/public/collection/v1";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    /// 没有结果时 API 返回 null
    #[serde(rename = "objectIDs", default)]
    object_ids: Option<Vec<u64>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MetObject {
    primary_image: Option<String>,
    primary_image_small: Option<String>,
    title: Option<String>,
    artist_display_name: Option<String>,
    object_date: Option<String>,
    medium: Option<String>,
}

pub struct MetClient {
    http: Arc<dyn HttpFetch>,
    rng: Mutex<StdRng>,
}

impl MetClient {
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
impl ArtSource for MetClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch_one(&self, cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
        tracing::info!(provider = NAME, "fetching artworks");

        let search_url =
            format!("{API_URL}/search?isHighlight=true&isPublicDomain=true&medium=Paintings&q=*");
        let search: SearchResponse = fetch_json(self.http.as_ref(), &search_url, &[], cancel).await?;

        let ids = search.object_ids.unwrap_or_default();
        if ids.is_empty() {
            return Err(SourceError::NotFound("no artworks found".to_string()));
        }
        let selected = ids[self.rng.lock().gen_range(0..ids.len())];

        let object_url = format!("{API_URL}/objects/{selected}");
        let object: MetObject = fetch_json(self.http.as_ref(), &object_url, &[], cancel).await?;

        let image_url = object
            .primary_image
            .filter(|u| !u.trim().is_empty())
            .or(object.primary_image_small)
            .unwrap_or_default();

        build_artwork(
            NAME,
            &selected.to_string(),
            object.title,
            object.artist_display_name,
            object.object_date,
            object.medium,
            &image_url,
        )
    }
}
