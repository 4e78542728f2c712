// cli.rs — 命令行接口定义模块
// 使用 clap 的 derive 模式定义所有子命令和参数

use clap::{Parser, Subcommand}; // Parser: 解析命令行参数的 trait; Subcommand: 定义子命令的 trait
use clap_complete::Shell; // Shell 枚举：Bash, Zsh, Fish, Elvish, PowerShell

/// 博物馆名画壁纸轮换工具
///
/// 定时从芝加哥艺术学院、大都会、克利夫兰、V&A 的开放 API 获取公有领域油画，
/// 加工后设为桌面壁纸。
#[derive(Parser)]
#[command(name = "wallart")]
#[command(version)] // 自动从 Cargo.toml 读取 version 字段
#[command(author)] // 自动从 Cargo.toml 读取 authors 字段（如有）
#[command(about = "博物馆名画壁纸轮换工具 — 定时获取公有领域油画并设为桌面壁纸")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 后台运行：按配置的间隔自动更换壁纸
    ///
    /// 用法示例:
    ///   wallart daemon
    ///   RUST_LOG=wallart=debug wallart daemon
    Daemon {
        /// 由登录自启动项拉起
        #[arg(long)]
        autostart: bool,
    },

    /// 立即更换一张壁纸
    ///
    /// 用法示例:
    ///   wallart next
    ///   wallart next --skip-current
    Next {
        /// 把当前壁纸的作品加入黑名单，以后不再出现
        #[arg(short, long)]
        skip_current: bool,
    },

    /// 查看最近更换过的作品
    ///
    /// 用法示例:
    ///   wallart history
    ///   wallart history -n 5
    History {
        /// 显示条数
        #[arg(short = 'n', long, default_value = "20", value_name = "N")]
        count: usize,
    },

    /// 查看或开关作品来源
    ///
    /// 用法示例:
    ///   wallart providers
    ///   wallart providers disable met
    ///   wallart providers enable "Cleveland Museum of Art"
    Providers {
        #[command(subcommand)]
        action: Option<ProviderAction>,
    },

    /// 配置管理操作
    ///
    /// 用法示例:
    ///   wallart config show
    ///   wallart config dump
    ///   wallart config set interval 360
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 删除缓存目录中的所有壁纸图片
    ///
    /// 用法示例:
    ///   wallart clean
    Clean,

    /// 生成 shell 补全脚本（支持 bash, zsh, fish, elvish, powershell）
    ///
    /// 用法示例：
    ///   wallart completions zsh > ~/.zsh/completions/_wallart
    ///   wallart completions fish > ~/.config/fish/completions/wallart.fish
    Completions {
        /// 目标 shell 类型
        shell: Shell,
    },
}

/// 来源开关
#[derive(Subcommand)]
pub enum ProviderAction {
    /// 启用来源（名称或简写：aic, cma, met, vam）
    Enable { name: String },
    /// 禁用来源
    Disable { name: String },
}

/// 配置管理操作
#[derive(Subcommand)]
pub enum ConfigAction {
    /// 查看当前所有配置简报
    Show,
    /// 生成配置文件对应的 JSON Schema
    Schema,
    /// 以 TOML 格式打印当前完整配置内容
    Dump,
    /// 设置配置项的值 (支持: interval, autostart, cache, dimming, blur, position, scale)
    Set {
        /// 要设置的键
        key: String,
        /// 要设置的值
        value: String,
    },
}
