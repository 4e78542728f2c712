// cache.rs — 壁纸缓存目录管理
// 控制缓存文件数量上限、清空缓存、查找最近一张可用作回退的壁纸

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// 参与管理的图片扩展名，其余文件一律不动
const CACHED_EXTENSIONS: &[&str] = &["jpg", "png"];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct CacheCurator {
    dir: PathBuf,
}

impl CacheCurator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 缓存中的图片，按修改时间从旧到新排序；目录不存在时为空
    pub fn list(&self) -> Result<Vec<(PathBuf, SystemTime)>, CacheError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut images: Vec<(PathBuf, SystemTime)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let meta = entry.metadata().ok()?;
                if !meta.is_file() || !is_cached_image(&path) {
                    return None;
                }
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((path, modified))
            })
            .collect();

        images.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(images)
    }

    /// 删除最旧的图片直到数量不超过 `max_count`，返回删除数量
    ///
    /// `max_count <= 0` 表示不限制。单个文件删除失败（比如正在使用）只记录日志。
    pub fn enforce_bound(&self, max_count: i64) -> Result<usize, CacheError> {
        if max_count <= 0 {
            return Ok(0);
        }

        let images = self.list()?;
        let bound = usize::try_from(max_count).unwrap_or(usize::MAX);
        if images.len() <= bound {
            return Ok(0);
        }

        let excess = images.len() - bound;
        let removed = images
            .iter()
            .take(excess)
            .filter(|(path, _)| remove_quietly(path))
            .count();

        tracing::info!(removed, bound, "cache trimmed");
        Ok(removed)
    }

    /// 尽力删除所有缓存图片，返回删除数量
    pub fn clear_all(&self) -> Result<usize, CacheError> {
        let removed = self
            .list()?
            .iter()
            .filter(|(path, _)| remove_quietly(path))
            .count();

        tracing::info!(removed, dir = %self.dir.display(), "cache cleared");
        Ok(removed)
    }

    /// 最近修改的一张缓存图片
    pub fn latest_fallback(&self) -> Option<PathBuf> {
        match self.list() {
            Ok(images) => images.into_iter().last().map(|(path, _)| path),
            Err(e) => {
                tracing::warn!(error = %e, "cannot look up fallback image");
                None
            }
        }
    }
}

fn is_cached_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CACHED_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete cached file");
            false
        }
    }
}
