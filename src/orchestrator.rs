// orchestrator.rs — 作品获取编排
// 在已启用的来源之间按权重排序、过滤不合适的作品、失败重试，最后下载图片字节

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, Configuration};
use crate::http::{FetchError, HttpFetch};
use crate::source::{artic, met, ArtSource, ArtworkResult};

/// 排除的装饰类器物词汇（标题或材质中出现即跳过）
pub const EXCLUDED_TERMS: [&str; 11] = [
    "vase", "pottery", "ceramic", "vessel", "bowl", "plate", "cup", "dish", "urn", "jar", "pitcher",
];

/// 来源选择策略
///
/// 偏好来源以数据形式给出，而不是在排序逻辑里硬编码名字匹配。
#[derive(Debug, Clone)]
pub struct AcquisitionPolicy {
    /// 偏好来源的名称
    pub preferred: Vec<String>,
    /// 偏好来源排在前面的概率
    pub preferred_probability: f64,
    /// 每个来源的最大尝试次数
    pub attempts_per_provider: u32,
    pub excluded_terms: Vec<String>,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            preferred: vec![artic::NAME.to_string(), met::NAME.to_string()],
            preferred_probability: 0.8,
            attempts_per_provider: 3,
            excluded_terms: EXCLUDED_TERMS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// 一次成功获取的结果：元数据加原始图片字节
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub artwork: ArtworkResult,
    pub bytes: Vec<u8>,
}

pub struct Orchestrator {
    sources: Vec<Arc<dyn ArtSource>>,
    config: Arc<ConfigStore>,
    http: Arc<dyn HttpFetch>,
    policy: AcquisitionPolicy,
    rng: Mutex<StdRng>,
}

impl Orchestrator {
    pub fn new(
        sources: Vec<Arc<dyn ArtSource>>,
        config: Arc<ConfigStore>,
        http: Arc<dyn HttpFetch>,
    ) -> Self {
        Self::with_rng(sources, config, http, AcquisitionPolicy::default(), StdRng::from_entropy())
    }

    pub fn with_rng(
        sources: Vec<Arc<dyn ArtSource>>,
        config: Arc<ConfigStore>,
        http: Arc<dyn HttpFetch>,
        policy: AcquisitionPolicy,
        rng: StdRng,
    ) -> Self {
        Self {
            sources,
            config,
            http,
            policy,
            rng: Mutex::new(rng),
        }
    }

    /// 获取下一件作品
    ///
    /// 所有来源都被禁用、全部失败或被取消时返回 `None`（不算错误）。
    pub async fn fetch_next(&self, cancel: &CancellationToken) -> Option<Acquisition> {
        let active: Vec<Arc<dyn ArtSource>> = {
            let config = self.config.current();
            self.sources
                .iter()
                .filter(|s| config.provider_enabled(s.name()))
                .cloned()
                .collect()
        };

        if active.is_empty() {
            tracing::warn!("all providers are disabled in settings");
            return None;
        }

        let attempts = self.policy.attempts_per_provider.max(1);

        for source in self.order(active) {
            let provider = source.name();
            let mut last_failure = String::new();

            for attempt in 1..=attempts {
                if cancel.is_cancelled() {
                    tracing::info!(provider, "acquisition cancelled");
                    return None;
                }

                let artwork = match source.fetch_one(cancel).await {
                    Ok(artwork) => artwork,
                    Err(e) if e.is_cancelled() => {
                        tracing::info!(provider, "acquisition cancelled");
                        return None;
                    }
                    Err(e) => {
                        tracing::debug!(provider, attempt, "fetch failed: {e}");
                        last_failure = e.to_string();
                        continue;
                    }
                };

                if let Some(reason) = self.rejection(&artwork, &self.config.current()) {
                    tracing::info!(provider, attempt, id = %artwork.id, "{reason}");
                    last_failure = reason;
                    continue;
                }

                tracing::info!(provider, title = %artwork.title, artist = %artwork.artist, "selected artwork");
                tracing::info!(provider, "downloading image");

                match self
                    .http
                    .get_bytes(&artwork.image_url, source.download_headers(), cancel)
                    .await
                {
                    Ok(bytes) if !bytes.is_empty() => {
                        tracing::info!(provider, kb = bytes.len() / 1024, "downloaded image");
                        return Some(Acquisition { artwork, bytes });
                    }
                    Ok(_) => last_failure = "image download returned no data".to_string(),
                    Err(FetchError::Cancelled) => {
                        tracing::info!(provider, "acquisition cancelled");
                        return None;
                    }
                    Err(e) => last_failure = format!("image download failed: {e}"),
                }
            }

            tracing::warn!(provider, attempts, "failed after {attempts} attempts: {last_failure}");
        }

        tracing::warn!("all providers failed");
        None
    }

    /// 排序：按概率把偏好来源打乱后放在前面，其余来源打乱后跟在后面；
    /// 否则全部打乱
    fn order(&self, mut active: Vec<Arc<dyn ArtSource>>) -> Vec<Arc<dyn ArtSource>> {
        let mut rng = self.rng.lock();

        if rng.gen_bool(self.policy.preferred_probability.clamp(0.0, 1.0)) {
            let (mut preferred, mut others): (Vec<_>, Vec<_>) = active
                .into_iter()
                .partition(|s| self.policy.preferred.iter().any(|p| p == s.name()));
            preferred.shuffle(&mut *rng);
            others.shuffle(&mut *rng);
            preferred.extend(others);
            preferred
        } else {
            active.shuffle(&mut *rng);
            active
        }
    }

    /// 内容过滤：返回拒绝原因，合格时返回 `None`
    fn rejection(&self, artwork: &ArtworkResult, config: &Configuration) -> Option<String> {
        let title = artwork.title.to_lowercase();
        let medium = artwork.medium.to_lowercase();

        if self
            .policy
            .excluded_terms
            .iter()
            .any(|term| title.contains(term.as_str()) || medium.contains(term.as_str()))
        {
            return Some(format!(
                "skipping non-fine-art object '{}' ({})",
                artwork.title, artwork.medium
            ));
        }

        if config.is_blacklisted(&artwork.id) {
            return Some(format!("skipping blacklisted artwork {}", artwork.id));
        }

        None
    }
}
