//! SAGE 配置管理系统
//!
//! YAML 主配置文件 + 模块目录下的 `*_config.yaml` / `*_config.json` 文件

use crate::{Result, SageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 运行时配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 运行时基础设置
    pub runtime: RuntimeSettings,
    /// 模块配置
    pub modules: ModulesConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 运行时基础设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// 模块根目录
    pub modules_path: PathBuf,
    /// 是否启用热重载
    pub hot_reload: bool,
    /// 是否对声明 sandboxed 的模块做源码检查
    pub sandbox_enabled: bool,
    /// 周期健康检查间隔（秒），0 表示关闭
    pub health_check_interval_secs: u64,
    /// 热重载去抖窗口（毫秒）
    pub reload_debounce_ms: u64,
    /// 事件历史保留条数
    pub event_history_size: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            modules_path: PathBuf::from("modules"),
            hot_reload: false,
            sandbox_enabled: true,
            health_check_interval_secs: 30,
            reload_debounce_ms: 1000,
            event_history_size: 100,
        }
    }
}

/// 模块配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModulesConfig {
    /// 启动时自动加载的模块
    pub auto_load: Vec<String>,
    /// 可选模块
    pub optional: Vec<String>,
    /// 每个模块的配置
    pub settings: HashMap<String, HashMap<String, Value>>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 详细输出（包含目标模块路径）
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            verbose: false,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// 模块配置提供者
pub trait ConfigProvider: Send + Sync {
    /// 获取模块的合并配置
    fn get_module_config(&self, module_name: &str) -> HashMap<String, Value>;
}

/// 配置管理器
pub struct ConfigManager {
    config: RwLock<RuntimeConfig>,
    /// 来自模块目录配置文件的配置
    file_configs: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl ConfigManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            file_configs: RwLock::new(HashMap::new()),
        }
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self::new(RuntimeConfig::default())
    }

    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| SageError::config(&format!("Failed to read config file: {}", e)))?;

        let config: RuntimeConfig = serde_yaml::from_str(&content)
            .map_err(|e| SageError::config(&format!("Failed to parse config file: {}", e)))?;

        Ok(Self::new(config))
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&*self.config.read())
            .map_err(|e| SageError::config(&format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content).await
            .map_err(|e| SageError::config(&format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// 获取配置快照
    pub fn get_config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    /// 加载模块目录下的配置文件
    ///
    /// 每个模块子目录中的 `*_config.yaml` 与 `*_config.json` 以目录名为键收集，
    /// 同一目录的多个文件按文件名顺序合并。解析失败只记录警告。
    pub async fn load_module_configs(&self) -> Result<usize> {
        let root = self.config.read().runtime.modules_path.clone();
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Ok(0);
        }

        let mut collected: HashMap<String, HashMap<String, Value>> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let module_name = entry.file_name().to_string_lossy().to_string();

            let mut files = Vec::new();
            let mut module_entries = tokio::fs::read_dir(entry.path()).await?;
            while let Some(file) = module_entries.next_entry().await? {
                let file_name = file.file_name().to_string_lossy().to_string();
                if file_name.ends_with("_config.yaml") || file_name.ends_with("_config.json") {
                    files.push(file.path());
                }
            }
            files.sort();

            for file in files {
                match read_config_file(&file).await {
                    Ok(values) => {
                        let slot = collected.entry(module_name.clone()).or_default();
                        merge_into(slot, values);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config for {}: {}", module_name, e);
                    }
                }
            }
        }

        let count = collected.len();
        *self.file_configs.write() = collected;
        tracing::debug!("Loaded module config files for {} modules", count);
        Ok(count)
    }

    /// 设置模块配置（写入主配置）
    pub fn set_module_config(&self, module_name: &str, config: HashMap<String, Value>) {
        self.config.write().modules.settings.insert(module_name.to_string(), config);
    }

    /// 模块是否自动加载
    pub fn is_module_auto_load(&self, module_name: &str) -> bool {
        self.config.read().modules.auto_load.iter().any(|m| m == module_name)
    }

    /// 自动加载的模块列表
    pub fn get_auto_load_modules(&self) -> Vec<String> {
        self.config.read().modules.auto_load.clone()
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        let config = self.config.read();

        if config.runtime.modules_path.as_os_str().is_empty() {
            return Err(SageError::config("Modules path cannot be empty"));
        }

        if config.runtime.event_history_size == 0 {
            return Err(SageError::config("Event history size must be positive"));
        }

        if config.runtime.hot_reload && config.runtime.reload_debounce_ms == 0 {
            return Err(SageError::config("Reload debounce must be positive when hot reload is enabled"));
        }

        for name in &config.modules.auto_load {
            if config.modules.optional.contains(name) {
                return Err(SageError::config(&format!(
                    "Module '{}' is listed as both auto_load and optional", name
                )));
            }
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

impl ConfigProvider for ConfigManager {
    /// 模块目录文件作为基础，主配置覆盖其上
    fn get_module_config(&self, module_name: &str) -> HashMap<String, Value> {
        let mut merged = self.file_configs.read()
            .get(module_name)
            .cloned()
            .unwrap_or_default();

        if let Some(main) = self.config.read().modules.settings.get(module_name) {
            merge_into(&mut merged, main.clone());
        }
        merged
    }
}

/// 生成默认配置文件
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let config_manager = ConfigManager::new_default();
    config_manager.save_to_file(path).await?;
    Ok(())
}

async fn read_config_file(path: &Path) -> Result<HashMap<String, Value>> {
    let content = tokio::fs::read_to_string(path).await?;
    let values = if path.extension().map_or(false, |ext| ext == "json") {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str::<Option<HashMap<String, Value>>>(&content)?.unwrap_or_default()
    };
    Ok(values)
}

/// 递归合并，对象逐键合并，其余类型直接覆盖
fn merge_into(base: &mut HashMap<String, Value>, overlay: HashMap<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn merge_objects(base: &mut serde_json::Map<String, Value>, overlay: serde_json::Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
