// processor.rs — 把下载的原图加工成壁纸
// 流程：解码 → 裁切/留黑边到目标尺寸 → 模糊 → 压暗 → 叠加说明文字 → 以 JPEG 写入缓存目录

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::caption;
use crate::config::{ConfigStore, StyleSettings};
use crate::security::{self, SecurityError};
use crate::source::ArtworkResult;

pub const TARGET_WIDTH: u32 = 3840;
pub const TARGET_HEIGHT: u32 = 2160;
/// 宽高比与目标相差不超过该值时裁切铺满，否则等比缩放后留黑边
pub const RATIO_TOLERANCE: f64 = 0.5;

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image has zero size")]
    EmptyImage,
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("processing cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStrategy {
    /// 等比放大到铺满后居中裁切
    Crop,
    /// 等比缩放到完全放入，四周补黑
    Pad,
}

impl ResizeStrategy {
    pub fn choose(width: u32, height: u32, target: (u32, u32)) -> Self {
        if width == 0 || height == 0 || target.1 == 0 {
            return ResizeStrategy::Pad;
        }
        let source_ratio = f64::from(width) / f64::from(height);
        let target_ratio = f64::from(target.0) / f64::from(target.1);

        if (source_ratio - target_ratio).abs() <= RATIO_TOLERANCE {
            ResizeStrategy::Crop
        } else {
            ResizeStrategy::Pad
        }
    }
}

/// 说明文字：标题、作者、来源各占一段
pub fn caption_text(artwork: &ArtworkResult) -> String {
    format!("{}\n{}\n{}", artwork.title, artwork.artist, artwork.provider_name)
}

/// 缓存文件名：`yyyyMMdd_HHmmss_{清洗后的 id}.jpg`
pub fn output_file_name(id: &str, at: DateTime<Local>) -> String {
    format!("{}_{}.jpg", at.format("%Y%m%d_%H%M%S"), security::sanitize_id(id))
}

pub struct ImageProcessor {
    cache_dir: PathBuf,
    config: Arc<ConfigStore>,
    target: (u32, u32),
}

impl ImageProcessor {
    pub fn new(cache_dir: impl Into<PathBuf>, config: Arc<ConfigStore>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            config,
            target: (TARGET_WIDTH, TARGET_HEIGHT),
        }
    }

    /// 修改输出尺寸（测试里用小图加速）
    pub fn with_target(mut self, width: u32, height: u32) -> Self {
        self.target = (width.max(1), height.max(1));
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// 加工并保存，返回缓存目录内的文件路径
    ///
    /// 这是阻塞操作，异步调用方应放进 `spawn_blocking`。
    /// 取消或出错时不会在缓存目录留下文件。
    pub fn process(
        &self,
        bytes: &[u8],
        artwork: &ArtworkResult,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessError> {
        tracing::info!(id = %artwork.id, "processing image");

        let style = self.config.current().style();
        let rendered = self.render(bytes, artwork, &style, cancel)?;

        let file_name = output_file_name(&artwork.id, Local::now());
        let path = security::ensure_within(&self.cache_dir.join(&file_name), &self.cache_dir)?;

        check_cancelled(cancel)?;
        self.write_jpeg(&rendered, &path)?;

        tracing::info!(file = %file_name, "image saved to cache");
        Ok(path)
    }

    /// 只做像素处理，不落盘
    pub fn render(
        &self,
        bytes: &[u8],
        artwork: &ArtworkResult,
        style: &StyleSettings,
        cancel: &CancellationToken,
    ) -> Result<RgbImage, ProcessError> {
        check_cancelled(cancel)?;
        let img = image::load_from_memory(bytes).map_err(ProcessError::Decode)?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(ProcessError::EmptyImage);
        }

        let strategy = ResizeStrategy::choose(width, height, self.target);
        tracing::debug!(width, height, ?strategy, "resizing");

        check_cancelled(cancel)?;
        let resized = resize(&img, strategy, self.target);

        check_cancelled(cancel)?;
        let blurred = if style.blur > 0.0 {
            apply_fast_blur(&resized, style.blur as f32)
        } else {
            resized
        };

        let mut canvas = blurred.to_rgb8();
        if style.dimming > 0.0 {
            apply_dimming(&mut canvas, style.dimming);
        }

        check_cancelled(cancel)?;
        // 文字叠加失败只影响美观，不影响换壁纸
        if let Err(e) = caption::draw(&mut canvas, &caption_text(artwork), style) {
            tracing::warn!(error = %e, "failed to draw caption, continuing without it");
        }

        Ok(canvas)
    }

    fn write_jpeg(&self, img: &RgbImage, path: &Path) -> Result<(), ProcessError> {
        let io_err = |source: std::io::Error| ProcessError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.cache_dir).map_err(io_err)?;

        // 写到同目录的临时文件，完成后原子改名
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
            img.write_with_encoder(encoder).map_err(ProcessError::Encode)?;
            writer.flush().map_err(io_err)?;
        }
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        Err(ProcessError::Cancelled)
    } else {
        Ok(())
    }
}

fn resize(img: &DynamicImage, strategy: ResizeStrategy, (width, height): (u32, u32)) -> DynamicImage {
    match strategy {
        ResizeStrategy::Crop => img.resize_to_fill(width, height, FilterType::Lanczos3),
        ResizeStrategy::Pad => {
            let fitted = img.resize(width, height, FilterType::Lanczos3).to_rgb8();
            let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
            let x = (width.saturating_sub(fitted.width())) / 2;
            let y = (height.saturating_sub(fitted.height())) / 2;
            image::imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));
            DynamicImage::ImageRgb8(canvas)
        }
    }
}

/// 高斯模糊；sigma 较大时先缩小 4 倍模糊再放大，4K 图上快很多
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_fast_blur(img: &DynamicImage, sigma: f32) -> DynamicImage {
    if sigma <= 5.0 {
        return img.blur(sigma);
    }

    let (width, height) = img.dimensions();
    let scale_factor = 4u32;

    let small_width = (width / scale_factor).max(1);
    let small_height = (height / scale_factor).max(1);
    let small = img.resize_exact(small_width, small_height, FilterType::CatmullRom);

    let blurred_small = small.blur((sigma / scale_factor as f32).max(1.0));
    blurred_small.resize_exact(width, height, FilterType::CatmullRom)
}

/// 叠加一层不透明度为 `amount` 的黑色
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_dimming(img: &mut RgbImage, amount: f64) {
    let keep = (1.0 - amount.clamp(0.0, 1.0)) as f32;
    for pixel in img.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (f32::from(*channel) * keep).round() as u8;
        }
    }
}
