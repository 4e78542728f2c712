// config.rs — 配置管理模块
// 遵循 Unix 风格：优先从 ~/.config/wallart/config.toml 读取配置
// 配置是整个进程唯一的可变共享状态，只能通过 ConfigStore 读写

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use schemars::JsonSchema; // 引入用于生成 JSON Schema 的 trait
use serde::{Deserialize, Serialize}; // 引入序列化与反序列化 trait
use shellexpand::tilde; // 用于展开 ~ 和环境变量
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::source::ArtworkResult;

/// 允许的更新间隔（分钟）
pub const ALLOWED_INTERVALS: [u32; 3] = [60, 360, 1440];
/// 加载校验时历史记录的硬上限
pub const MAX_HISTORY: usize = 100;
/// 黑名单上限，超出时丢弃最早加入的 ID
pub const MAX_BLACKLIST: usize = 1000;
pub const MAX_CACHE_BOUNDS: i64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine $HOME")]
    HomeNotFound,
    #[error("failed to write config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// 文字叠加的锚定角落
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypographyPosition {
    #[default]
    TopRight,
    TopLeft,
    BottomRight,
    BottomLeft,
}

impl TypographyPosition {
    pub const ALL: [TypographyPosition; 4] = [
        TypographyPosition::TopRight,
        TypographyPosition::TopLeft,
        TypographyPosition::BottomRight,
        TypographyPosition::BottomLeft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TypographyPosition::TopRight => "TopRight",
            TypographyPosition::TopLeft => "TopLeft",
            TypographyPosition::BottomRight => "BottomRight",
            TypographyPosition::BottomLeft => "BottomLeft",
        }
    }

    pub fn is_left(&self) -> bool {
        matches!(self, TypographyPosition::TopLeft | TypographyPosition::BottomLeft)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, TypographyPosition::TopLeft | TypographyPosition::TopRight)
    }
}

// 手工编辑出的非法值一律回落到 TopRight，而不是让整个文件解析失败
impl From<String> for TypographyPosition {
    fn from(value: String) -> Self {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
            .unwrap_or_default()
    }
}

impl From<TypographyPosition> for String {
    fn from(value: TypographyPosition) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TypographyPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化的应用配置聚合
///
/// 字段顺序有意义：TOML 要求普通键写在子表之前。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// 更新间隔（分钟），只能取 60 / 360 / 1440
    pub update_interval_minutes: u32,
    /// 上一次成功更换壁纸的时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// 是否登录时自动启动
    pub autostart_enabled: bool,
    /// 缓存目录最多保留的图片数量，0 表示不清理
    pub cache_bounds: i64,
    /// 背景压暗程度 0.0 – 1.0
    pub background_dimming: f64,
    /// 背景模糊程度 0.0 – 100.0
    pub background_blur: f64,
    #[schemars(with = "String")]
    pub typography_position: TypographyPosition,
    /// 文字缩放 0.1 – 5.0
    pub typography_scale: f64,
    /// 被用户拉黑的作品 ID
    pub blacklisted_artwork_ids: Vec<String>,
    /// 来源开关，未出现的来源视为启用
    pub provider_toggles: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_artwork: Option<ArtworkResult>,
    /// 最近的作品，最新的在最前
    pub history: Vec<ArtworkResult>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            update_interval_minutes: 60,
            last_update_time: None,
            autostart_enabled: true,
            cache_bounds: 50,
            background_dimming: 0.0,
            background_blur: 0.0,
            typography_position: TypographyPosition::TopRight,
            typography_scale: 1.0,
            blacklisted_artwork_ids: Vec::new(),
            provider_toggles: BTreeMap::new(),
            active_artwork: None,
            history: Vec::new(),
        }
    }
}

/// 图片后处理用到的那部分配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StyleSettings {
    pub dimming: f64,
    pub blur: f64,
    pub position: TypographyPosition,
    pub scale: f64,
}

impl Default for StyleSettings {
    fn default() -> Self {
        Configuration::default().style()
    }
}

impl Configuration {
    /// 把所有字段钳制/修复到合法范围
    pub fn validate(&mut self) {
        if !ALLOWED_INTERVALS.contains(&self.update_interval_minutes) {
            self.update_interval_minutes = ALLOWED_INTERVALS[0];
        }

        self.cache_bounds = self.cache_bounds.clamp(0, MAX_CACHE_BOUNDS);
        self.background_dimming = clamp_finite(self.background_dimming, 0.0, 1.0, 0.0);
        self.background_blur = clamp_finite(self.background_blur, 0.0, 100.0, 0.0);
        self.typography_scale = clamp_finite(self.typography_scale, 0.1, 5.0, 1.0);

        // 黑名单按集合语义去重，保留首次出现的顺序
        let mut seen = std::collections::HashSet::new();
        self.blacklisted_artwork_ids
            .retain(|id| !id.trim().is_empty() && seen.insert(id.clone()));
        if self.blacklisted_artwork_ids.len() > MAX_BLACKLIST {
            let excess = self.blacklisted_artwork_ids.len() - MAX_BLACKLIST;
            self.blacklisted_artwork_ids.drain(..excess);
        }

        self.history.truncate(MAX_HISTORY);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_interval_minutes) * 60)
    }

    pub fn provider_enabled(&self, name: &str) -> bool {
        self.provider_toggles.get(name).copied().unwrap_or(true)
    }

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.blacklisted_artwork_ids.iter().any(|b| b == id)
    }

    /// 加入黑名单（已存在则忽略）
    pub fn blacklist(&mut self, id: &str) {
        if !self.is_blacklisted(id) {
            self.blacklisted_artwork_ids.push(id.to_string());
        }
    }

    /// 记录一次成功的更换：设为当前作品并插入历史最前端
    pub fn record_rotation(&mut self, artwork: ArtworkResult, cap: usize, at: DateTime<Utc>) {
        self.history.insert(0, artwork.clone());
        self.history.truncate(cap);
        self.active_artwork = Some(artwork);
        self.last_update_time = Some(at);
    }

    pub fn style(&self) -> StyleSettings {
        StyleSettings {
            dimming: self.background_dimming,
            blur: self.background_blur,
            position: self.typography_position,
            scale: self.typography_scale,
        }
    }

    /// 按 CLI 传入的键值修改配置项
    /// 数值只做解析，范围钳制交给 validate()
    pub fn set_from_str(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "interval" | "updateIntervalMinutes" => {
                let minutes: u32 = value.parse().map_err(|_| invalid())?;
                if !ALLOWED_INTERVALS.contains(&minutes) {
                    return Err(invalid());
                }
                self.update_interval_minutes = minutes;
            }
            "autostart" | "autostartEnabled" => {
                self.autostart_enabled = value.parse().map_err(|_| invalid())?;
            }
            "cache" | "cacheBounds" => {
                self.cache_bounds = value.parse().map_err(|_| invalid())?;
            }
            "dimming" | "backgroundDimming" => {
                self.background_dimming = value.parse().map_err(|_| invalid())?;
            }
            "blur" | "backgroundBlur" => {
                self.background_blur = value.parse().map_err(|_| invalid())?;
            }
            "position" | "typographyPosition" => {
                self.typography_position = TypographyPosition::ALL
                    .into_iter()
                    .find(|p| p.as_str().eq_ignore_ascii_case(value))
                    .ok_or_else(invalid)?;
            }
            "scale" | "typographyScale" => {
                self.typography_scale = value.parse().map_err(|_| invalid())?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// 将当前配置转换为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// 获取配置文件的 JSON Schema
    pub fn schema() -> Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(Configuration);
        serde_json::to_string_pretty(&schema)
    }
}

fn clamp_finite(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

/// 并发安全的配置存储
///
/// 读多写少：`current()` 之间互不阻塞，`update()` 在整个
/// 复制-修改-校验-落盘-发布 过程中独占写锁。
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Configuration>>,
    load_warning: Option<String>,
}

impl ConfigStore {
    /// 从文件加载配置；文件损坏时记录警告并使用默认值，绝不失败
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (config, load_warning) = Self::read_config(&path);

        if let Some(warning) = &load_warning {
            tracing::warn!(path = %path.display(), "{warning}");
        }

        Self {
            path,
            current: RwLock::new(Arc::new(config)),
            load_warning,
        }
    }

    fn read_config(path: &Path) -> (Configuration, Option<String>) {
        if !path.exists() {
            return (Configuration::default(), None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                return (
                    Configuration::default(),
                    Some(format!("Config could not be read ({e}). Defaults applied.")),
                );
            }
        };

        if content.trim().is_empty() {
            return (
                Configuration::default(),
                Some("Config file was empty. Defaults applied.".to_string()),
            );
        }

        match toml::from_str::<Configuration>(&content) {
            Ok(mut config) => {
                config.validate();
                (config, None)
            }
            Err(e) => (
                Configuration::default(),
                Some(format!("Config could not be parsed ({}). Defaults applied.", e.message())),
            ),
        }
    }

    /// 当前配置的只读快照
    pub fn current(&self) -> Arc<Configuration> {
        Arc::clone(&self.current.read())
    }

    /// 加载阶段产生的非致命警告
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 重新读取磁盘上的文件（其他进程改了配置时使用）
    ///
    /// 文件缺失或损坏时保留内存中的配置，并返回警告。
    pub fn reload(&self) -> Option<String> {
        if !self.path.exists() {
            return Some("Config file is missing. Keeping current settings.".to_string());
        }

        let (config, warning) = Self::read_config(&self.path);
        if let Some(warning) = warning {
            tracing::warn!(path = %self.path.display(), "{warning}");
            return Some(warning);
        }

        *self.current.write() = Arc::new(config);
        tracing::info!(path = %self.path.display(), "config reloaded");
        None
    }

    /// 磁盘上的版本与内存不同时（另一个进程写过文件）采用磁盘版本
    ///
    /// 文件缺失或损坏时什么都不做。
    pub fn sync_from_disk(&self) {
        let mut guard = self.current.write();
        if let Some(disk) = self.read_if_changed(&guard) {
            tracing::info!(path = %self.path.display(), "config changed on disk, picked up");
            *guard = Arc::new(disk);
        }
    }

    fn read_if_changed(&self, current: &Configuration) -> Option<Configuration> {
        if !self.path.exists() {
            return None;
        }
        match Self::read_config(&self.path) {
            (disk, None) if disk != *current => Some(disk),
            (_, None) => None,
            (_, Some(warning)) => {
                tracing::warn!(path = %self.path.display(), "{warning}");
                None
            }
        }
    }

    /// 在独立副本上应用修改，校验、落盘后再发布
    ///
    /// 副本取自磁盘上的最新内容（CLI 和后台进程共用同一个文件），
    /// 文件缺失或损坏时取内存中的配置。写盘失败时内存中的配置保持不变，
    /// 错误返回给调用方。
    pub fn update<F>(&self, mutate: F) -> Result<Arc<Configuration>, ConfigError>
    where
        F: FnOnce(&mut Configuration),
    {
        self.try_update(|c| {
            mutate(c);
            Ok(())
        })
    }

    /// 同 [`update`](Self::update)，修改本身可能失败；失败时不落盘
    pub fn try_update<F>(&self, mutate: F) -> Result<Arc<Configuration>, ConfigError>
    where
        F: FnOnce(&mut Configuration) -> Result<(), ConfigError>,
    {
        let mut guard = self.current.write();

        let mut next = match self.read_if_changed(&guard) {
            Some(disk) => {
                tracing::debug!(path = %self.path.display(), "config changed on disk, updating from file");
                disk
            }
            None => Configuration::clone(&guard),
        };
        mutate(&mut next)?;
        next.validate();

        self.persist(&next)?;

        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(next)
    }

    fn persist(&self, config: &Configuration) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let toml_str = config.to_toml()?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        // 先写临时文件再原子替换，避免写到一半留下损坏的配置
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(toml_str.as_bytes()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// 展开路径中的 ~ 和环境变量 ($HOME, $XDG_CONFIG_HOME 等)
/// 相对路径则相对于 $HOME
fn expand_path(path_str: &str, home: &Path) -> PathBuf {
    let p = PathBuf::from(tilde(path_str).into_owned());
    if p.is_absolute() { p } else { home.join(p) }
}

/// 进程用到的文件系统位置
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// 配置文件所在路径
    pub config_path: PathBuf,
    /// 处理后壁纸的缓存目录
    pub cache_dir: PathBuf,
    /// XDG 自启动目录
    pub autostart_dir: PathBuf,
}

impl AppPaths {
    /// 解析路径（优先级：环境变量 > 默认位置）
    pub fn resolve() -> Result<Self, ConfigError> {
        let home = env::var("HOME").map_err(|_| ConfigError::HomeNotFound)?;
        let home_path = PathBuf::from(&home);

        let config_path = env::var("WALLART_CONFIG")
            .ok()
            .map(|p| expand_path(&p, &home_path))
            .unwrap_or_else(|| home_path.join(".config").join("wallart").join("config.toml"));

        let cache_dir = env::var("WALLART_CACHE_DIR")
            .ok()
            .map(|p| expand_path(&p, &home_path))
            .unwrap_or_else(|| home_path.join("Pictures").join("wallart"));

        Ok(Self {
            config_path,
            cache_dir,
            autostart_dir: home_path.join(".config").join("autostart"),
        })
    }

    /// 确保所有必要的目录都存在
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.cache_dir)
    }
}
