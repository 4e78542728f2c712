// security.rs — 外部数据安全校验模块
// 所有来自远程 API 的标识符与 URL 在进入文件名或请求之前都要经过这里

use reqwest::Url;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// 标识符最大长度
pub const MAX_ID_LENGTH: usize = 200;

/// 安全违规：出现即中止当前操作，不做降级处理
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("only HTTPS URLs are permitted, rejected: {0}")]
    InsecureUrl(String),
    #[error("path traversal attempt: '{path}' is outside '{dir}'")]
    PathEscape { path: String, dir: String },
}

/// 清洗 API 提供的 ID，只保留字母数字、`_` 和 `-`
///
/// 空白或清洗后为空的输入返回 `"_"`，超过 200 个字符时截断。
pub fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_ID_LENGTH)
        .collect();

    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// 要求 URL 为带主机名的绝对 HTTPS 地址
pub fn require_https(url: &str) -> Result<Url, SecurityError> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "https" && parsed.host_str().is_some() => Ok(parsed),
        _ => Err(SecurityError::InsecureUrl(url.to_string())),
    }
}

/// 校验 `file` 解析后严格位于 `dir` 之内，返回解析后的绝对路径
///
/// 目标文件此时通常尚不存在，所以这里做的是词法归一化（消解 `.` 与 `..`），
/// 而不是 `canonicalize`。
pub fn ensure_within(file: &Path, dir: &Path) -> Result<PathBuf, SecurityError> {
    let escape = || SecurityError::PathEscape {
        path: file.display().to_string(),
        dir: dir.display().to_string(),
    };

    let root = std::path::absolute(dir).map(|p| normalize(&p)).map_err(|_| escape())?;
    let resolved = std::path::absolute(file).map(|p| normalize(&p)).map_err(|_| escape())?;

    if resolved != root && resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(escape())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
