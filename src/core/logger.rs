//! 日志
//!
//! 全局 tracing 订阅器初始化，以及注入到模块上下文中的模块日志器

use crate::config::LoggingConfig;

/// 初始化全局日志，重复调用时保留已有的订阅器
pub fn init_logging(config: &LoggingConfig) -> bool {
    let level: tracing::Level = config.level.into();
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(config.verbose)
        .try_init()
        .is_ok()
}

/// 模块日志器，每条日志都带上模块名
#[derive(Debug, Clone)]
pub struct ModuleLogger {
    module: String,
}

impl ModuleLogger {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(module = %self.module, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(module = %self.module, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(module = %self.module, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(module = %self.module, "{}", message);
    }
}
