use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobq::app::{AppMode, Application};
use jobq::shutdown::ShutdownManager;
use jobq_core::{AppConfig, FunctionCall, FunctionRegistry, SchedulerResult};

#[tokio::main]
async fn main() -> Result<()> {
    // runner子进程入口：不加载CLI与配置，直接执行函数后退出
    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.len() >= 3 && raw_args[1] == "run-function" {
        let registry = build_registry().context("构建函数注册表失败")?;
        let exit_code = jobq_worker::runner::run(&registry, Path::new(&raw_args[2]));
        std::process::exit(exit_code);
    }

    let matches = Command::new("jobq")
        .version("0.1.0")
        .about("数据库协调的后台任务调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["all", "worker"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-name")
                .long("worker-name")
                .value_name("NAME")
                .help("Worker名称，缺省自动生成"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches.get_one::<String>("mode").unwrap();
    let worker_name = matches.get_one::<String>("worker-name");
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    init_logging(log_level, log_format)?;

    info!("启动jobq调度系统");
    info!("运行模式: {mode_str}");

    let mut config = AppConfig::load(config_path.map(|s| s.as_str()))
        .context("加载配置失败")?;
    if let Some(name) = worker_name {
        config.worker.name = Some(name.clone());
    }

    let mode = match mode_str.as_str() {
        "worker" => AppMode::Worker,
        _ => AppMode::All,
    };

    let registry = Arc::new(build_registry().context("构建函数注册表失败")?);
    let app = Application::new(config, mode, registry);

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("应用关闭时发生错误: {e}");
            } else {
                info!("应用已优雅关闭");
            }
        }
        Err(_) => {
            warn!("应用关闭超时，强制退出");
        }
    }

    info!("jobq调度系统已退出");
    Ok(())
}

/// 宿主应用提供的任务函数注册表
///
/// 调度器本体不内置业务函数，这里注册的是参考实现自带的几个
/// 通用函数；实际部署时宿主在此注册自己的工作项。
fn build_registry() -> SchedulerResult<FunctionRegistry> {
    let mut registry = FunctionRegistry::new();

    registry.register("noop", |_: &FunctionCall| Ok(json!(null)))?;

    registry.register("echo", |call: &FunctionCall| {
        Ok(json!({ "args": call.args, "vars": call.vars }))
    })?;

    registry.register("sleep", |call: &FunctionCall| {
        let seconds = call.args.first().and_then(|v| v.as_u64()).unwrap_or(1);
        std::thread::sleep(Duration::from_secs(seconds));
        Ok(json!(seconds))
    })?;

    registry.register("shell_echo", |call: &FunctionCall| {
        let mut line = String::new();
        for arg in &call.args {
            if let Some(s) = arg.as_str() {
                if !line.is_empty() {
                    line.push(' ');
                }
                line.push_str(s);
            }
        }
        println!("{line}");
        Ok(json!(line))
    })?;

    Ok(registry)
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
