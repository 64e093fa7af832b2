//! SAGE 配置驱动的运行时
//!
//! 从一份 YAML 配置构建事件总线、配置管理器、缓存、生命周期管理器、
//! 健康监控和热重载监控，并按顺序启动和停止它们

use crate::config::*;
use crate::core::{CacheProvider, EventBus, EventBusConfig, MemoryCache};
use crate::plugins::dependency::{GraphDump, LoadOrder};
use crate::plugins::dynamic_loader::{LoaderConfig, ModuleLoader};
use crate::plugins::health::HealthMonitor;
use crate::plugins::hot_reload::{HotReloadConfig, HotReloadWatcher};
use crate::plugins::lifecycle::{LifecycleConfig, LoadReport, PluginManager, RuntimeServices, RuntimeStatistics};
use crate::plugins::metadata::{ModuleMetadata, ValidationIssue};
use crate::plugins::registry::{ModuleRegistry, RegistryConfig};
use crate::plugins::core::{Module, ModuleContext};
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 检查模式的输出
#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub discovered: Vec<String>,
    pub validation: HashMap<String, Vec<ValidationIssue>>,
    pub load_order: LoadOrder,
    pub graph: GraphDump,
    pub statistics: RuntimeStatistics,
}

/// 模块运行时
pub struct SageRuntime {
    config: RuntimeConfig,
    config_manager: Arc<ConfigManager>,
    event_bus: Arc<EventBus>,
    cache: Arc<MemoryCache>,
    manager: PluginManager,
    health: HealthMonitor,
    watcher: HotReloadWatcher,
}

impl SageRuntime {
    /// 从配置创建运行时
    pub async fn from_config(config: RuntimeConfig) -> Result<Self> {
        let config_manager = Arc::new(ConfigManager::new(config.clone()));
        config_manager.validate()?;

        match config_manager.load_module_configs().await {
            Ok(count) if count > 0 => info!("Loaded {} module config files", count),
            Ok(_) => {}
            Err(e) => warn!("Failed to load module config files: {}", e),
        }

        let event_bus = Arc::new(EventBus::new(EventBusConfig {
            history_size: config.runtime.event_history_size,
            ..Default::default()
        }));
        let cache = Arc::new(MemoryCache::default());

        let registry = Arc::new(ModuleRegistry::new(
            config.runtime.modules_path.clone(),
            RegistryConfig::default(),
        ));
        let loader = Arc::new(ModuleLoader::new(LoaderConfig {
            sandbox_enabled: config.runtime.sandbox_enabled,
            ..Default::default()
        }));

        let services = RuntimeServices {
            event_bus: Some(event_bus.clone()),
            config: Some(config_manager.clone() as Arc<dyn ConfigProvider>),
            cache: Some(cache.clone() as Arc<dyn CacheProvider>),
        };
        // 热重载开关由监控器在成功启动后打开
        let manager = PluginManager::new(registry, loader, services, LifecycleConfig::default());

        let health = HealthMonitor::new(
            manager.clone(),
            Duration::from_secs(config.runtime.health_check_interval_secs),
        );
        let watcher = HotReloadWatcher::new(manager.clone(), HotReloadConfig {
            debounce: Duration::from_millis(config.runtime.reload_debounce_ms),
            ..Default::default()
        });

        Ok(Self {
            config,
            config_manager,
            event_bus,
            cache,
            manager,
            health,
            watcher,
        })
    }

    /// 从配置文件创建运行时
    pub async fn from_config_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_manager = ConfigManager::load_from_file(path).await?;
        Self::from_config(config_manager.get_config()).await
    }

    /// 登记模块工厂，元数据来自描述文件或默认值
    pub fn register_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn(ModuleContext) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.manager.loader().register_factory(name, factory);
    }

    /// 以编程方式登记模块
    pub async fn register_module<F>(&self, metadata: ModuleMetadata, factory: F)
    where
        F: Fn(ModuleContext) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.manager.register_module(metadata, factory).await;
    }

    /// 启动运行时
    ///
    /// 未配置 auto_load 和 optional 时加载全部已知模块。可选模块加载失败只记录警告。
    pub async fn start(&self) -> Result<LoadReport> {
        if !self.event_bus.is_running() {
            self.event_bus.start().await?;
        }

        self.manager.registry().discover().await;

        let modules = &self.config.modules;
        let requested = if modules.auto_load.is_empty() && modules.optional.is_empty() {
            self.manager.registry().module_names().await
        } else {
            modules.auto_load.iter().chain(modules.optional.iter()).cloned().collect()
        };

        let report = self.manager.load_all(Some(requested)).await;
        for (name, ok) in &report.results {
            if *ok {
                continue;
            }
            if modules.optional.contains(name) {
                warn!("Optional module '{}' failed to load", name);
            } else {
                warn!("Module '{}' failed to load", name);
            }
        }

        if self.config.runtime.hot_reload && !self.watcher.enable() {
            warn!("Hot reload requested but could not be enabled");
        }
        self.health.start();

        info!("SAGE runtime started with {} modules", report.loaded_count());
        Ok(report)
    }

    /// 停止运行时：先停监控，再卸载模块，最后停事件总线
    pub async fn shutdown(&self) -> Result<HashMap<String, bool>> {
        self.health.stop().await;
        self.watcher.disable().await;
        let results = self.manager.unload_all().await;
        if self.event_bus.is_running() {
            self.event_bus.stop().await?;
        }
        info!("SAGE runtime stopped");
        Ok(results)
    }

    /// 只发现和分析模块，不加载
    pub async fn inspect(&self) -> InspectionReport {
        let discovered = self.manager.registry().discover().await;
        let known = self.manager.registry().module_names().await;
        InspectionReport {
            discovered,
            validation: self.manager.validate_dependencies().await,
            load_order: self.manager.registry().resolve_load_order(&known).await,
            graph: self.manager.dependency_graph().await,
            statistics: self.manager.statistics().await,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn hot_reload_watcher(&self) -> &HotReloadWatcher {
        &self.watcher
    }
}
