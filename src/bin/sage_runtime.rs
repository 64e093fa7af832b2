//! SAGE 主程序 - 配置驱动运行
//!
//! 生成配置、创建模块模板，或对模块目录做一次发现和依赖分析

use anyhow::Context;
use sage_runtime::{
    config::{generate_default_config_file, ConfigManager, LoggingConfig},
    core::init_logging,
    plugins::dev_toolkit::{create_module_template, TemplateOptions},
    runner::{InspectionReport, SageRuntime},
};
use std::env;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "sage_config.yaml";

/// 程序入口点
#[tokio::main]
async fn main() {
    init_logging(&LoggingConfig::default());

    if let Err(e) = run_main().await {
        tracing::error!("❌ 程序运行失败: {:#}", e);
        std::process::exit(1);
    }
}

/// 主要逻辑函数
async fn run_main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.as_slice() {
        [_] => inspect_with_default_config().await,
        [_, command] if command == "init" => generate_config_file(DEFAULT_CONFIG_FILE).await,
        [_, command, path] if command == "init" => generate_config_file(path).await,
        [_, command, name] if command == "new-module" => new_module(DEFAULT_CONFIG_FILE, name).await,
        [_, command, ..] if command == "help" || command == "--help" => {
            print_usage();
            Ok(())
        }
        [_, path] => inspect_with_config_file(path).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// 使用默认配置检查模块目录
async fn inspect_with_default_config() -> anyhow::Result<()> {
    tracing::info!("🚀 启动 SAGE 模块运行时 (默认配置)");
    let config_manager = ConfigManager::new_default();
    let runtime = SageRuntime::from_config(config_manager.get_config()).await?;
    display_report(&runtime.inspect().await);
    Ok(())
}

/// 使用配置文件检查模块目录
async fn inspect_with_config_file(config_path: &str) -> anyhow::Result<()> {
    tracing::info!("🚀 启动 SAGE 模块运行时");
    tracing::info!("📄 配置文件: {}", config_path);

    if !Path::new(config_path).exists() {
        tracing::error!("❌ 配置文件不存在: {}", config_path);
        tracing::info!("💡 使用 'sage_runtime init' 生成默认配置文件");
        return Ok(());
    }

    let config_manager = ConfigManager::load_from_file(config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path))?;
    let runtime = SageRuntime::from_config(config_manager.get_config()).await?;
    display_report(&runtime.inspect().await);
    Ok(())
}

/// 生成默认配置文件
async fn generate_config_file(config_path: &str) -> anyhow::Result<()> {
    tracing::info!("📝 生成默认配置文件: {}", config_path);
    generate_default_config_file(config_path)
        .await
        .with_context(|| format!("failed to write {}", config_path))?;
    tracing::info!("✅ 配置文件生成完成");
    tracing::info!("🔧 请编辑配置文件后运行: sage_runtime {}", config_path);
    Ok(())
}

/// 在配置的模块目录中创建模块模板
async fn new_module(config_path: &str, name: &str) -> anyhow::Result<()> {
    let config = if Path::new(config_path).exists() {
        ConfigManager::load_from_file(config_path).await?.get_config()
    } else {
        ConfigManager::new_default().get_config()
    };

    let dir = create_module_template(&config.runtime.modules_path, name, &TemplateOptions::default())
        .await
        .with_context(|| format!("failed to create module '{}'", name))?;
    tracing::info!("✅ 模块模板已创建: {}", dir.display());
    Ok(())
}

/// 显示检查结果
fn display_report(report: &InspectionReport) {
    tracing::info!("📦 发现模块: {}", report.discovered.len());
    for name in &report.discovered {
        let deps = report.graph.dependencies.get(name).cloned().unwrap_or_default();
        if deps.is_empty() {
            tracing::info!("  - {}", name);
        } else {
            tracing::info!("  - {} -> {}", name, deps.join(", "));
        }
    }

    if report.validation.is_empty() {
        tracing::info!("✅ 依赖检查通过");
    } else {
        for issues in report.validation.values() {
            for issue in issues {
                tracing::warn!("⚠️  {}", issue.message);
            }
        }
    }

    if report.load_order.cyclic {
        tracing::warn!("🔁 存在循环依赖，按名称顺序: {}", report.load_order.order.join(", "));
    } else {
        tracing::info!("📋 加载顺序: {}", report.load_order.order.join(" -> "));
    }

    let stats = &report.statistics;
    tracing::info!(
        "📊 统计: 已知={}, 已加载={}, 热重载={}, 沙箱检查={}",
        stats.discovered_modules, stats.loaded_modules, stats.hot_reload_enabled, stats.sandbox_enabled
    );
}

/// 打印使用说明
fn print_usage() {
    println!("SAGE 模块运行时");
    println!();
    println!("用法:");
    println!("  sage_runtime                       # 使用默认配置检查模块目录");
    println!("  sage_runtime init [config_file]    # 生成默认配置文件");
    println!("  sage_runtime new-module <name>     # 在模块目录中创建模块模板");
    println!("  sage_runtime <config_file>         # 使用指定配置文件检查模块目录");
    println!();
    println!("配置文件格式: YAML");
}
