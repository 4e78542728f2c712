// setter.rs — 系统壁纸设置模块
// 优先使用 wallpaper crate（自动识别桌面环境），失败时退回到 feh

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetterError {
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(String),
    #[error("failed to set wallpaper ({primary}); fallback also failed ({fallback})")]
    Failed { primary: String, fallback: String },
}

/// 把图片设为桌面壁纸（所有显示器）
pub trait WallpaperSetter: Send + Sync {
    fn set(&self, path: &Path) -> Result<(), SetterError>;
}

pub struct SystemWallpaper;

impl SystemWallpaper {
    /// wallpaper crate 返回的是非 Send 的 Box<dyn Error>，这里立即转成字符串
    fn primary(path: &str) -> Result<(), String> {
        wallpaper::set_from_path(path).map_err(|e| e.to_string())?;
        // 我们输出的图已经是屏幕比例，裁切模式可以避免桌面再加黑边
        if let Err(e) = wallpaper::set_mode(wallpaper::Mode::Crop) {
            tracing::debug!(error = %e, "could not set wallpaper mode");
        }
        Ok(())
    }

    fn fallback(path: &str) -> Result<(), String> {
        let status = Command::new("feh")
            .args(["--no-fehbg", "--bg-fill", path])
            .status()
            .map_err(|e| format!("feh: {e}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("feh exited with {status}"))
        }
    }
}

impl WallpaperSetter for SystemWallpaper {
    fn set(&self, path: &Path) -> Result<(), SetterError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| SetterError::NonUtf8(path.display().to_string()))?;

        tracing::info!(path = %path.display(), "setting wallpaper");

        let primary = match Self::primary(path_str) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(error = %primary, "desktop API failed, falling back to feh");

        Self::fallback(path_str).map_err(|fallback| SetterError::Failed { primary, fallback })
    }
}
