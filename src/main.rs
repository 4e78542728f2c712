// main.rs — 程序入口
// 负责初始化日志与异步运行时、解析命令行参数、组装各组件并分发子命令

mod autostart;
mod cache;
mod caption;
mod cli; // 声明 cli 模块，对应 src/cli.rs
mod config; // 声明 config 模块，对应 src/config.rs
mod http;
mod orchestrator;
mod processor;
mod rotation;
mod scheduler;
mod security;
mod setter;
mod source;

// 初始化多语言支持，嵌入 locales 目录下的所有翻译
rust_i18n::i18n!("locales");

use autostart::Autostart;
use cache::CacheCurator;
use chrono::{Local, Utc};
use clap::{CommandFactory, Parser}; // 引入 Parser trait 的 parse() 方法; CommandFactory 用于生成补全脚本
use clap_complete::generate; // 引入补全脚本生成函数
use cli::{Cli, Commands, ConfigAction, ProviderAction}; // 引入 CLI 结构体和子命令枚举
use config::{AppPaths, ConfigStore, Configuration};
use http::{HttpClient, HttpFetch};
use orchestrator::Orchestrator;
use processor::ImageProcessor;
use rotation::{Outcome, Rotation};
use rust_i18n::t; // 引入翻译宏
use scheduler::{Scheduler, SystemClock};
use setter::SystemWallpaper;
use source::ProviderKind;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// `#[tokio::main]` 宏将 async main 转换为同步 main + tokio 运行时
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 自动检测系统语言并设置
    let locale = std::env::var("LANG").unwrap_or_else(|_| "en".to_string());
    if locale.starts_with("zh") {
        rust_i18n::set_locale("zh-CN");
    } else {
        rust_i18n::set_locale("en");
    }

    // 日志写到 stderr，避免污染 `config dump` 之类命令的标准输出
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wallart=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // 解析命令行参数
    let cli = Cli::parse();

    // 解析路径（读取环境变量）并确保目录存在
    let paths = AppPaths::resolve()?;
    paths.ensure_dirs()?;

    // 配置损坏时不会失败，只给出警告并使用默认值
    let config = Arc::new(ConfigStore::load(&paths.config_path));
    if let Some(warning) = config.load_warning() {
        eprintln!("{}", t!("config_warning", warning => warning));
    }

    // 根据子命令分发执行逻辑
    match &cli.command {
        Commands::Daemon { autostart } => {
            handle_daemon(&paths, config, *autostart).await?;
        }
        Commands::Next { skip_current } => {
            handle_next(&paths, config, *skip_current).await?;
        }
        Commands::History { count } => {
            handle_history(&config, *count);
        }
        Commands::Providers { action } => {
            handle_providers(&config, action.as_ref())?;
        }
        Commands::Config { action } => {
            handle_config(&paths, &config, action)?;
        }
        Commands::Clean => {
            handle_clean(&paths)?;
        }
        Commands::Completions { shell } => {
            generate(
                *shell,
                &mut Cli::command(),
                "wallart",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// 组装一次换壁纸需要的全部组件
fn build_rotation(
    paths: &AppPaths,
    config: Arc<ConfigStore>,
) -> Result<Rotation, Box<dyn std::error::Error>> {
    let http: Arc<dyn HttpFetch> = Arc::new(HttpClient::new()?);
    let sources = ProviderKind::build_all(Arc::clone(&http));

    let orchestrator = Orchestrator::new(sources, Arc::clone(&config), http);
    let processor = ImageProcessor::new(&paths.cache_dir, Arc::clone(&config));
    let cache = CacheCurator::new(&paths.cache_dir);

    Ok(Rotation::new(
        Arc::new(orchestrator),
        Arc::new(processor),
        Arc::new(SystemWallpaper),
        Arc::new(cache),
        config,
    ))
}

/// 守护进程收到的控制信号
#[derive(Debug, Clone, Copy)]
enum DaemonSignal {
    /// SIGHUP：重新读取配置文件
    Reload,
    /// SIGUSR1：立即换一张
    RunNow,
}

/// Ctrl+C / SIGTERM 时取消令牌
fn setup_shutdown_signal(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, shutting down");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel_token.cancel();
    });
}

#[cfg(unix)]
fn setup_control_signals(tx: mpsc::UnboundedSender<DaemonSignal>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    for (kind, message) in [
        (SignalKind::hangup(), DaemonSignal::Reload),
        (SignalKind::user_defined1(), DaemonSignal::RunNow),
    ] {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn setup_control_signals(_tx: mpsc::UnboundedSender<DaemonSignal>) -> std::io::Result<()> {
    Ok(())
}

/// 处理 daemon 子命令：启动调度器，直到收到退出信号
async fn handle_daemon(
    paths: &AppPaths,
    config: Arc<ConfigStore>,
    launched_at_login: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let autostart = Autostart::for_current_exe(&paths.autostart_dir)?;
    if let Err(e) = autostart.apply(config.current().autostart_enabled) {
        tracing::warn!(error = %e, "failed to update autostart entry");
    }

    // 退出信号先于调度器就位，启动补跑期间也能被 Ctrl+C 中断
    let shutdown = CancellationToken::new();
    setup_shutdown_signal(shutdown.clone());

    let rotation = Arc::new(build_rotation(paths, Arc::clone(&config))?);
    let interval = config.current().interval();
    let scheduler =
        Scheduler::new(rotation, interval, Arc::new(SystemClock)).with_shutdown(&shutdown);
    scheduler.start();

    let next = scheduler
        .next_run()
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    println!(
        "{}",
        t!("daemon_started", minutes => interval.as_secs() / 60, next => next)
    );
    tracing::info!(launched_at_login, pid = std::process::id(), "daemon running");

    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    setup_control_signals(signal_tx)?;

    // 距上次成功更换已超过一个间隔（或从未更换过）就先补一次
    let overdue = config.current().last_update_time.is_none_or(|last| {
        chrono::TimeDelta::from_std(interval).is_ok_and(|i| Utc::now() - last >= i)
    });
    if overdue {
        scheduler.run_now().await;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(signal) = signals.recv() => match signal {
                DaemonSignal::Reload => reload_daemon(&config, &scheduler, &autostart),
                DaemonSignal::RunNow => scheduler.run_now().await,
            },
        }
    }

    scheduler.stop().await;
    println!("{}", t!("daemon_stopped"));
    Ok(())
}

fn reload_daemon(config: &ConfigStore, scheduler: &Scheduler, autostart: &Autostart) {
    if let Some(warning) = config.reload() {
        eprintln!("{}", t!("config_warning", warning => warning));
        return;
    }

    let current = config.current();
    if current.interval() != scheduler.interval() {
        scheduler.update_interval(current.interval());
    }
    if autostart.is_enabled() != current.autostart_enabled {
        if let Err(e) = autostart.apply(current.autostart_enabled) {
            tracing::warn!(error = %e, "failed to update autostart entry");
        }
    }
}

/// 处理 next 子命令：立即换一张
async fn handle_next(
    paths: &AppPaths,
    config: Arc<ConfigStore>,
    skip_current: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let rotation = build_rotation(paths, config)?;
    let cancel = CancellationToken::new();
    setup_shutdown_signal(cancel.clone());

    println!("{}", t!("next_start"));
    let outcome = if skip_current {
        rotation.skip_current(&cancel).await?
    } else {
        rotation.rotate(&cancel).await?
    };

    match outcome {
        Outcome::Applied { artwork, path } => {
            println!(
                "{}",
                t!(
                    "next_applied",
                    title => artwork.title,
                    artist => artwork.artist,
                    provider => artwork.provider_name
                )
            );
            println!("{}", t!("save_path", path => path.display()));
        }
        Outcome::Fallback { path } => {
            println!("{}", t!("next_fallback", path => path.display()));
        }
        Outcome::Unchanged => {
            println!("{}", t!("next_unchanged"));
        }
    }
    Ok(())
}

/// 处理 history 子命令
fn handle_history(config: &ConfigStore, count: usize) {
    let current = config.current();
    if current.history.is_empty() {
        println!("{}", t!("history_empty"));
        return;
    }

    let active_id = current.active_artwork.as_ref().map(|a| a.id.as_str());
    println!("{}", t!("history_title", count => current.history.len().min(count)));
    for (i, artwork) in current.history.iter().take(count).enumerate() {
        let marker = if Some(artwork.id.as_str()) == active_id { "*" } else { " " };
        println!(
            "{marker} {:>2}. {} / {} ({}, {})",
            i + 1,
            artwork.title,
            artwork.artist,
            artwork.date,
            artwork.provider_name
        );
    }
}

/// 处理 providers 子命令：列出或开关来源
fn handle_providers(
    config: &ConfigStore,
    action: Option<&ProviderAction>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (name, enabled) = match action {
        None => {
            let current = config.current();
            println!("{}", t!("providers_title"));
            for kind in ProviderKind::ALL {
                let state = if current.provider_enabled(kind.name()) {
                    t!("enabled")
                } else {
                    t!("disabled")
                };
                println!("  {:<4} {:<30} {}", kind.alias(), kind.name(), state);
            }
            return Ok(());
        }
        Some(ProviderAction::Enable { name }) => (name, true),
        Some(ProviderAction::Disable { name }) => (name, false),
    };

    let kind = ProviderKind::parse(name).ok_or_else(|| t!("provider_unknown", name => name))?;
    config.update(|c| {
        c.provider_toggles.insert(kind.name().to_string(), enabled);
    })?;

    let state = if enabled { t!("enabled") } else { t!("disabled") };
    println!("{}", t!("provider_toggled", name => kind, state => state));
    Ok(())
}

/// 处理 config 子命令：查看或修改配置
fn handle_config(
    paths: &AppPaths,
    config: &ConfigStore,
    action: &ConfigAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => {
            let current = config.current();
            println!("{}", t!("config_title"));
            println!("{}", t!("config_path", path => paths.config_path.display()));
            println!("{}", t!("config_cache_dir", path => paths.cache_dir.display()));
            println!(
                "{}",
                t!("config_interval", minutes => current.update_interval_minutes)
            );
            println!("{}", t!("config_autostart", value => current.autostart_enabled));
            println!("{}", t!("config_cache_bounds", value => current.cache_bounds));
            println!(
                "{}",
                t!(
                    "config_style",
                    dimming => current.background_dimming,
                    blur => current.background_blur,
                    position => current.typography_position,
                    scale => current.typography_scale
                )
            );
            println!(
                "{}",
                t!("config_blacklist", count => current.blacklisted_artwork_ids.len())
            );
            if let Some(last) = current.last_update_time {
                println!(
                    "{}",
                    t!("config_last_update", time => last.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"))
                );
            }
        }
        ConfigAction::Schema => {
            println!("{}", Configuration::schema()?);
        }
        ConfigAction::Dump => {
            println!("{}", config.current().to_toml()?);
        }
        ConfigAction::Set { key, value } => {
            // 键名或数值不合法时不落盘
            let saved = config.try_update(|c| c.set_from_str(key, value))?;

            if matches!(key.as_str(), "autostart" | "autostartEnabled") {
                Autostart::for_current_exe(&paths.autostart_dir)?.apply(saved.autostart_enabled)?;
            }
            println!("{}", t!("config_updated", key => key, value => value));
        }
    }
    Ok(())
}

/// 处理 clean 子命令：删除缓存中的所有壁纸
fn handle_clean(paths: &AppPaths) -> Result<(), Box<dyn std::error::Error>> {
    let curator = CacheCurator::new(&paths.cache_dir);
    println!("{}", t!("cleaning_dir", path => curator.dir().display()));
    let removed = curator.clear_all()?;
    println!("{}", t!("clean_done", count => removed));
    Ok(())
}
