// caption.rs — 作品说明文字叠加
// 使用 font8x8 位图字体，按配置的角落对齐、自动换行，并通过逐步缩小字号适配宽度

use font8x8::{BASIC_FONTS, LATIN_FONTS, UnicodeFonts};
use image::{Rgb, RgbImage};
use thiserror::Error;

use crate::config::StyleSettings;

/// 起始字号占图片宽度的比例
pub const START_SIZE_RATIO: f32 = 0.02;
/// 换行宽度占图片宽度的比例（再减去水平边距）
pub const WRAP_RATIO: f32 = 0.55;
pub const PADDING_RATIO: f32 = 0.03;
/// 字号下限与每次缩小的步长（都会乘以缩放系数）
pub const MIN_FONT_SIZE: f32 = 10.0;
pub const FONT_STEP: f32 = 2.0;
pub const LINE_SPACING: f32 = 1.2;

/// font8x8 每个字形是 8x8 的点阵
const GLYPH_CELL: f32 = 8.0;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("image has no pixels")]
    EmptyImage,
    #[error("no room for text (wrap width {0})")]
    NoRoom(f32),
    #[error("invalid font size {0}")]
    InvalidSize(f32),
}

/// 最终排版结果，主要用于日志与测试
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLayout {
    pub font_size: f32,
    pub lines: Vec<String>,
    /// 文字块左上角
    pub origin: (f32, f32),
    pub width: f32,
    pub height: f32,
}

/// 按字数贪心换行；单个超长单词独占一行（允许溢出，由字号适配处理）
pub fn wrap(text: &str, font_size: f32, max_width: f32) -> Vec<String> {
    let max_chars = ((max_width / font_size).floor() as usize).max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut current = String::new();
        let mut current_len = 0usize;

        for word in paragraph.split_whitespace() {
            let word_len = word.chars().count();
            if current_len == 0 {
                current.push_str(word);
                current_len = word_len;
            } else if current_len + 1 + word_len <= max_chars {
                current.push(' ');
                current.push_str(word);
                current_len += 1 + word_len;
            } else {
                lines.push(std::mem::take(&mut current));
                current.push_str(word);
                current_len = word_len;
            }
        }
        lines.push(current);
    }

    lines
}

/// 换行后最宽一行的像素宽度
pub fn measure(text: &str, font_size: f32, max_width: f32) -> f32 {
    wrap(text, font_size, max_width)
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(0) as f32
        * font_size
}

/// 从 `start` 开始按 `FONT_STEP * scale` 递减，返回第一个宽度不超过
/// `max_width` 的字号；都放不下时返回下限 `MIN_FONT_SIZE * scale`。
/// 结果永远不大于 `start`。
pub fn fit_font_size(start: f32, scale: f32, max_width: f32, measure: impl Fn(f32) -> f32) -> f32 {
    let floor = MIN_FONT_SIZE * scale;
    let step = FONT_STEP * scale;

    let mut size = start;
    while size > floor {
        if measure(size) <= max_width {
            return size;
        }
        size -= step;
    }
    floor.min(start)
}

/// 在图片上绘制说明文字
pub fn draw(img: &mut RgbImage, text: &str, style: &StyleSettings) -> Result<CaptionLayout, CaptionError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(CaptionError::EmptyImage);
    }

    let (w, h) = (w as f32, h as f32);
    let scale = style.scale as f32;
    let padding_x = w * PADDING_RATIO;
    let padding_y = h * PADDING_RATIO;
    let max_width = w * WRAP_RATIO - padding_x;
    if !(max_width.is_finite() && max_width >= 1.0) {
        return Err(CaptionError::NoRoom(max_width));
    }

    let start = w * START_SIZE_RATIO * scale;
    let font_size = fit_font_size(start, scale, max_width, |size| measure(text, size, max_width));
    if !(font_size.is_finite() && font_size > 0.0) {
        return Err(CaptionError::InvalidSize(font_size));
    }

    let lines = wrap(text, font_size, max_width);
    let line_height = font_size * LINE_SPACING;
    let block_width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as f32 * font_size;
    let block_height = (lines.len().max(1) - 1) as f32 * line_height + font_size;

    let top = if style.position.is_top() {
        padding_y
    } else {
        h - padding_y - block_height
    };
    let block_left = if style.position.is_left() {
        padding_x
    } else {
        w - padding_x - block_width
    };

    for (i, line) in lines.iter().enumerate() {
        let line_width = line.chars().count() as f32 * font_size;
        // 右侧锚定时每一行都右对齐
        let x = if style.position.is_left() {
            padding_x
        } else {
            w - padding_x - line_width
        };
        let y = top + i as f32 * line_height;
        draw_line(img, x, y, line, font_size);
    }

    Ok(CaptionLayout {
        font_size,
        lines,
        origin: (block_left, top),
        width: block_width,
        height: block_height,
    })
}

fn glyph(ch: char) -> Option<[u8; 8]> {
    BASIC_FONTS
        .get(ch)
        .or_else(|| LATIN_FONTS.get(ch))
        .or_else(|| BASIC_FONTS.get('?'))
}

fn draw_line(img: &mut RgbImage, x: f32, y: f32, line: &str, font_size: f32) {
    let px = font_size / GLYPH_CELL;
    let mut cursor_x = x;

    for ch in line.chars() {
        if let Some(rows) = glyph(ch) {
            for (row_idx, row) in rows.iter().enumerate() {
                for col_idx in 0..8 {
                    if (row >> col_idx) & 1 == 0 {
                        continue;
                    }
                    let x0 = cursor_x + col_idx as f32 * px;
                    let y0 = y + row_idx as f32 * px;
                    fill_rect(img, x0, y0, x0 + px, y0 + px);
                }
            }
        }
        cursor_x += font_size;
    }
}

fn fill_rect(img: &mut RgbImage, x0: f32, y0: f32, x1: f32, y1: f32) {
    let (w, h) = img.dimensions();
    let clamp_x = |v: f32| v.round().clamp(0.0, w as f32) as u32;
    let clamp_y = |v: f32| v.round().clamp(0.0, h as f32) as u32;

    // 字号很小时一个点可能不足一个像素，至少画一个
    let (sx, mut ex) = (clamp_x(x0), clamp_x(x1));
    let (sy, mut ey) = (clamp_y(y0), clamp_y(y1));
    if ex == sx && sx < w {
        ex = sx + 1;
    }
    if ey == sy && sy < h {
        ey = sy + 1;
    }

    for py in sy..ey {
        for px in sx..ex {
            img.put_pixel(px, py, TEXT_COLOR);
        }
    }
}
