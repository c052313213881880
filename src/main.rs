use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tracing::{error, info, warn};

use clustered_scheduler::{
    init_metrics, init_schema, wait_for_shutdown_signal, Application, ShutdownManager,
};
use scheduler_core::{init_logging, AppConfig, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config_arg = Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("配置文件路径，未指定时按默认路径查找");

    let matches = Command::new("clustered-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("持久化、可集群的作业调度系统")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("运行调度节点直到收到 SIGINT/SIGTERM")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("shutdown-timeout")
                        .long("shutdown-timeout")
                        .value_name("SECONDS")
                        .help("等待正在执行的作业结束的最长时间")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("30"),
                ),
        )
        .subcommand(
            Command::new("init-schema")
                .about("创建作业存储的表结构后退出")
                .arg(config_arg),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("run", sub)) => {
            let config = load_config(&matches, sub)?;
            run_node(config, sub).await
        }
        Some(("init-schema", sub)) => {
            let config = load_config(&matches, sub)?;
            init_schema(&config).await
        }
        _ => Err(anyhow::anyhow!("未知的子命令")),
    }
}

/// 加载配置并用命令行参数覆盖日志设置，然后初始化日志
fn load_config(matches: &ArgMatches, sub: &ArgMatches) -> Result<AppConfig> {
    let config_path = sub.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = match format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }
    init_logging(&config.observability)?;
    Ok(config)
}

async fn run_node(config: AppConfig, sub: &ArgMatches) -> Result<()> {
    let shutdown_timeout = sub
        .get_one::<u64>("shutdown-timeout")
        .copied()
        .unwrap_or(30);

    info!(
        scheduler = %config.scheduler.name,
        clustered = config.job_store.clustered,
        url = %config.job_store.url,
        "启动调度节点"
    );
    init_metrics(&config)?;

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("调度节点运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(shutdown_timeout), app_handle).await {
        Ok(Ok(())) => info!("调度节点已优雅关闭"),
        Ok(Err(e)) => error!("调度节点关闭时发生错误: {e}"),
        Err(_) => warn!("关闭超时，强制退出"),
    }
    Ok(())
}
