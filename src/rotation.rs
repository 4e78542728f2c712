// rotation.rs — 一次完整的换壁纸流程
// 获取作品 → 加工 → 设为壁纸 → 记录历史 → 清理缓存；任何一步失败都退回到最近一张缓存图

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheCurator, CacheError};
use crate::config::{ConfigError, ConfigStore};
use crate::orchestrator::Orchestrator;
use crate::processor::{ImageProcessor, ProcessError};
use crate::scheduler::{JobError, ScheduledJob, Trigger};
use crate::setter::{SetterError, WallpaperSetter};
use crate::source::ArtworkResult;

/// 每次成功更换后历史记录保留的条数
pub const HISTORY_CAP: usize = 20;

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("no artwork could be acquired")]
    NoArtwork,
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Setter(#[from] SetterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("rotation cancelled")]
    Cancelled,
}

impl From<ProcessError> for RotationError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Cancelled => RotationError::Cancelled,
            other => RotationError::Process(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 新作品已设为壁纸
    Applied { artwork: ArtworkResult, path: PathBuf },
    /// 本轮失败，重新应用了缓存里最近的一张
    Fallback { path: PathBuf },
    /// 失败且没有可用的缓存图，什么也没改
    Unchanged,
}

pub struct Rotation {
    orchestrator: Arc<Orchestrator>,
    processor: Arc<ImageProcessor>,
    setter: Arc<dyn WallpaperSetter>,
    cache: Arc<CacheCurator>,
    config: Arc<ConfigStore>,
    /// 正在进行的那一轮（编号, 取消令牌）
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl Rotation {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        processor: Arc<ImageProcessor>,
        setter: Arc<dyn WallpaperSetter>,
        cache: Arc<CacheCurator>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            orchestrator,
            processor,
            setter,
            cache,
            config,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// 执行一轮更换；新一轮开始时会取消仍在进行的上一轮
    pub async fn rotate(&self, parent: &CancellationToken) -> Result<Outcome, RotationError> {
        let cancel = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.in_flight.lock().replace((generation, cancel.clone())) {
            previous.cancel();
        }

        let result = self.acquire_and_apply(&cancel).await;

        {
            // 只清掉自己的令牌，后来者的保持不动
            let mut in_flight = self.in_flight.lock();
            if in_flight.as_ref().is_some_and(|(g, _)| *g == generation) {
                *in_flight = None;
            }
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(RotationError::Cancelled) => {
                tracing::info!("rotation cancelled");
                Err(RotationError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(error = %e, "rotation failed, applying fallback image");
                self.apply_fallback().await
            }
        }
    }

    /// “换下一张”：先把当前作品加入黑名单再更换
    pub async fn skip_current(&self, parent: &CancellationToken) -> Result<Outcome, RotationError> {
        if let Some(active) = self.config.current().active_artwork.clone() {
            self.config.update(|c| c.blacklist(&active.id))?;
            tracing::info!(id = %active.id, title = %active.title, "artwork blacklisted");
        }
        self.rotate(parent).await
    }

    async fn acquire_and_apply(&self, cancel: &CancellationToken) -> Result<Outcome, RotationError> {
        // CLI 可能刚改过来源开关或黑名单
        self.config.sync_from_disk();

        let Some(acquisition) = self.orchestrator.fetch_next(cancel).await else {
            if cancel.is_cancelled() {
                return Err(RotationError::Cancelled);
            }
            return Err(RotationError::NoArtwork);
        };
        let artwork = acquisition.artwork;

        // 解码/缩放/编码都是 CPU 密集型，放到阻塞线程池
        let path = {
            let processor = Arc::clone(&self.processor);
            let artwork = artwork.clone();
            let bytes = acquisition.bytes;
            let token = cancel.clone();
            tokio::task::spawn_blocking(move || processor.process(&bytes, &artwork, &token)).await??
        };

        if cancel.is_cancelled() {
            return Err(RotationError::Cancelled);
        }
        self.set_wallpaper(path.clone()).await?;

        self.config
            .update(|c| c.record_rotation(artwork.clone(), HISTORY_CAP, Utc::now()))?;
        tracing::info!(title = %artwork.title, provider = %artwork.provider_name, "wallpaper updated");

        let bound = self.config.current().cache_bounds;
        if let Err(e) = self.cache.enforce_bound(bound) {
            tracing::warn!(error = %e, "failed to trim cache");
        }

        Ok(Outcome::Applied { artwork, path })
    }

    async fn set_wallpaper(&self, path: PathBuf) -> Result<(), RotationError> {
        let setter = Arc::clone(&self.setter);
        tokio::task::spawn_blocking(move || setter.set(&path)).await??;
        Ok(())
    }

    async fn apply_fallback(&self) -> Result<Outcome, RotationError> {
        match self.cache.latest_fallback() {
            Some(path) => {
                tracing::info!(path = %path.display(), "using cached fallback image");
                self.set_wallpaper(path.clone()).await?;
                Ok(Outcome::Fallback { path })
            }
            None => {
                tracing::warn!("no cached image available, wallpaper left unchanged");
                Ok(Outcome::Unchanged)
            }
        }
    }
}

#[async_trait]
impl ScheduledJob for Rotation {
    async fn run(&self, trigger: Trigger, cancel: CancellationToken) -> Result<(), JobError> {
        tracing::debug!(?trigger, "rotation triggered");
        self.rotate(&cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::AcquisitionPolicy;
    use crate::setter::testing::RecordingSetter;
    use crate::source::testing::FakeHttp;
    use crate::source::{ArtSource, SourceError};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs::File;
    use std::io::Cursor;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const IMAGE_URL: &str = "https://img.example.org/irises.jpg";

    struct StubSource(Option<ArtworkResult>);

    #[async_trait]
    impl ArtSource for StubSource {
        fn name(&self) -> &'static str {
            "Stub Museum"
        }

        async fn fetch_one(&self, _cancel: &CancellationToken) -> Result<ArtworkResult, SourceError> {
            self.0
                .clone()
                .ok_or_else(|| SourceError::NotFound("nothing here".into()))
        }
    }

    fn irises() -> ArtworkResult {
        ArtworkResult {
            id: "irises-1889".to_string(),
            title: "Irises".to_string(),
            artist: "Vincent van Gogh".to_string(),
            date: "1889".to_string(),
            medium: "Oil on canvas".to_string(),
            image_url: IMAGE_URL.to_string(),
            provider_name: "Stub Museum".to_string(),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(128, 72, Rgb([90, 60, 30])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn old_file(dir: &Path, name: &str, secs: u64) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        File::create(&path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + secs))
            .unwrap();
        path
    }

    struct Harness {
        _dir: TempDir,
        cache_dir: PathBuf,
        config: Arc<ConfigStore>,
        setter: Arc<RecordingSetter>,
        rotation: Rotation,
    }

    fn harness(artwork: Option<ArtworkResult>, setter: RecordingSetter) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let config = Arc::new(ConfigStore::load(dir.path().join("config.toml")));
        let http = Arc::new(FakeHttp::new().route(IMAGE_URL, png_bytes()));

        let orchestrator = Orchestrator::with_rng(
            vec![Arc::new(StubSource(artwork)) as Arc<dyn ArtSource>],
            config.clone(),
            http,
            AcquisitionPolicy::default(),
            StdRng::seed_from_u64(5),
        );
        let processor = ImageProcessor::new(&cache_dir, config.clone()).with_target(64, 36);
        let setter = Arc::new(setter);

        let rotation = Rotation::new(
            Arc::new(orchestrator),
            Arc::new(processor),
            setter.clone(),
            Arc::new(CacheCurator::new(&cache_dir)),
            config.clone(),
        );

        Harness {
            _dir: dir,
            cache_dir,
            config,
            setter,
            rotation,
        }
    }

    #[tokio::test]
    async fn successful_rotation_is_applied_and_recorded() {
        let h = harness(Some(irises()), RecordingSetter::default());

        let outcome = h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        let Outcome::Applied { artwork, path } = outcome else {
            panic!("expected applied outcome, got {outcome:?}");
        };
        assert_eq!(artwork.id, "irises-1889");
        assert!(path.starts_with(&h.cache_dir));
        assert!(path.exists());
        assert_eq!(h.setter.applied(), vec![path]);

        let config = h.config.current();
        assert_eq!(config.active_artwork.as_ref().map(|a| a.id.as_str()), Some("irises-1889"));
        assert_eq!(config.history.len(), 1);
        assert!(config.last_update_time.is_some());
    }

    #[tokio::test]
    async fn history_is_capped_after_rotation() {
        let h = harness(Some(irises()), RecordingSetter::default());
        h.config
            .update(|c| {
                c.history = (0..60)
                    .map(|i| ArtworkResult {
                        id: format!("old-{i}"),
                        ..ArtworkResult::default()
                    })
                    .collect();
            })
            .unwrap();
        assert_eq!(h.config.current().history.len(), 60);

        h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        let history = &h.config.current().history;
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0].id, "irises-1889");
        assert_eq!(history[1].id, "old-0");
    }

    #[tokio::test]
    async fn cache_bound_is_enforced_after_rotation() {
        let h = harness(Some(irises()), RecordingSetter::default());
        h.config.update(|c| c.cache_bounds = 2).unwrap();
        old_file(&h.cache_dir, "a.jpg", 1);
        old_file(&h.cache_dir, "b.jpg", 2);
        let newest_old = old_file(&h.cache_dir, "c.png", 3);

        let outcome = h.rotation.rotate(&CancellationToken::new()).await.unwrap();
        let Outcome::Applied { path, .. } = outcome else {
            panic!("expected applied outcome");
        };

        let mut left: Vec<PathBuf> = std::fs::read_dir(&h.cache_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        left.sort();
        let mut expected = vec![newest_old, path];
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn failed_acquisition_reapplies_latest_cached_image() {
        let h = harness(None, RecordingSetter::default());
        old_file(&h.cache_dir, "older.jpg", 1);
        let latest = old_file(&h.cache_dir, "latest.jpg", 2);

        let outcome = h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Outcome::Fallback { path: latest.clone() });
        assert_eq!(h.setter.applied(), vec![latest]);
        assert!(h.config.current().active_artwork.is_none());
    }

    #[tokio::test]
    async fn fallback_is_applied_off_the_async_thread() {
        let h = harness(None, RecordingSetter::default());
        old_file(&h.cache_dir, "latest.jpg", 2);

        h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        let threads = h.setter.threads.lock().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn provider_toggled_by_another_process_is_honoured() {
        let h = harness(Some(irises()), RecordingSetter::default());
        old_file(&h.cache_dir, "latest.jpg", 2);

        // 另一个进程（CLI）关掉了唯一的来源
        ConfigStore::load(h.config.path())
            .update(|c| {
                c.provider_toggles.insert("Stub Museum".into(), false);
            })
            .unwrap();

        let outcome = h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, Outcome::Fallback { .. }));
        assert!(!h.config.current().provider_enabled("Stub Museum"));
    }

    #[tokio::test]
    async fn failure_without_cache_leaves_state_untouched() {
        let h = harness(None, RecordingSetter::default());

        let outcome = h.rotation.rotate(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Outcome::Unchanged);
        assert!(h.setter.applied().is_empty());
        assert!(h.config.current().history.is_empty());
    }

    #[tokio::test]
    async fn setter_failure_surfaces_after_fallback_fails() {
        let h = harness(Some(irises()), RecordingSetter::failing());

        let result = h.rotation.rotate(&CancellationToken::new()).await;

        assert!(matches!(result, Err(RotationError::Setter(_))));
        assert!(h.config.current().active_artwork.is_none());
    }

    #[tokio::test]
    async fn cancelled_rotation_does_nothing() {
        let h = harness(Some(irises()), RecordingSetter::default());
        old_file(&h.cache_dir, "latest.jpg", 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.rotation.rotate(&cancel).await;

        assert!(matches!(result, Err(RotationError::Cancelled)));
        assert!(h.setter.applied().is_empty());
    }

    #[tokio::test]
    async fn skip_current_blacklists_active_artwork() {
        let h = harness(Some(irises()), RecordingSetter::default());
        h.config
            .update(|c| {
                c.active_artwork = Some(ArtworkResult {
                    id: "boring-7".to_string(),
                    ..ArtworkResult::default()
                })
            })
            .unwrap();

        h.rotation.skip_current(&CancellationToken::new()).await.unwrap();

        let config = h.config.current();
        assert!(config.is_blacklisted("boring-7"));
        assert_eq!(config.active_artwork.as_ref().map(|a| a.id.as_str()), Some("irises-1889"));
    }
}
