//! 模块生命周期管理器
//!
//! 负责模块的加载、卸载、重载和批量加载，注入共享服务，
//! 把实例注册到事件总线，并记录每个模块的运行状态。

use super::core::{Module, ModuleContext};
use super::dependency::{GraphDump, LoadOrder};
use super::dynamic_loader::ModuleLoader;
use super::metadata::{
    check_api_compatibility, validate_config_against_schema, ModuleMetadata, ValidationIssue,
};
use super::registry::ModuleRegistry;
use crate::config::ConfigProvider;
use crate::core::{CacheProvider, EventBus, EventHandler};
use crate::types::{Event, EventType};
use crate::{Result, SageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// 共享的模块实例
pub type SharedModule = Arc<Mutex<Box<dyn Module>>>;

/// 模块生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModulePhase {
    /// 未加载
    Unloaded,
    /// 正在加载（含依赖）
    Loading,
    /// 已加载
    Loaded,
    /// 正在卸载
    Unloading,
    /// 正在强制重载
    Reloading,
}

/// 模块运行状态
#[derive(Debug, Clone, Serialize)]
pub struct ModuleState {
    /// 最近一次加载成功的时间
    pub loaded_at: Option<DateTime<Utc>>,
    /// 最近一次强制加载的时间
    pub last_reload: Option<DateTime<Utc>>,
    /// 强制加载次数
    pub reload_count: u32,
    /// 最近一次健康检查结果
    pub health_check_passed: bool,
    /// 累计错误次数
    pub error_count: u32,
    /// 最近一次错误
    pub last_error: Option<String>,
    /// 资源使用快照
    pub resource_usage: HashMap<String, Value>,
    /// 当前阶段
    pub phase: ModulePhase,
    /// 当前实例的类型版本号
    pub version: Option<u64>,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            loaded_at: None,
            last_reload: None,
            reload_count: 0,
            health_check_passed: false,
            error_count: 0,
            last_error: None,
            resource_usage: HashMap::new(),
            phase: ModulePhase::Unloaded,
            version: None,
        }
    }
}

/// 注入到模块的共享服务
#[derive(Clone, Default)]
pub struct RuntimeServices {
    pub event_bus: Option<Arc<EventBus>>,
    pub config: Option<Arc<dyn ConfigProvider>>,
    pub cache: Option<Arc<dyn CacheProvider>>,
}

/// 生命周期管理器配置
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    /// 是否启用热重载
    pub hot_reload: bool,
}

/// 批量加载结果
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// 每个模块的加载结果
    pub results: HashMap<String, bool>,
    /// 实际使用的加载顺序
    pub load_order: LoadOrder,
}

impl LoadReport {
    pub fn loaded_count(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }
}

/// 运行时统计
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatistics {
    pub discovered_modules: usize,
    pub loaded_modules: usize,
    pub hot_reload_enabled: bool,
    pub sandbox_enabled: bool,
    pub total_reloads: u64,
    pub average_error_count: f64,
}

/// 单个已加载模块的状态信息
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub loaded: bool,
    pub subscribed_events: Vec<String>,
    pub resource_usage: HashMap<String, Value>,
}

#[derive(Clone)]
struct LoadedModule {
    version: u64,
    instance: SharedModule,
    handler_id: String,
    events: Vec<EventType>,
}

/// 把事件转交给模块实例
struct ModuleSubscriber {
    id: String,
    instance: SharedModule,
}

#[async_trait]
impl EventHandler for ModuleSubscriber {
    fn handler_id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let mut module = self.instance.lock().await;
        module.handle_event(event).await.map(|_| ())
    }
}

/// 模块生命周期管理器
#[derive(Clone)]
pub struct PluginManager {
    /// 模块注册表
    registry: Arc<ModuleRegistry>,
    /// 模块加载器
    loader: Arc<ModuleLoader>,
    /// 已加载的模块
    loaded: Arc<RwLock<HashMap<String, LoadedModule>>>,
    /// 模块状态
    states: Arc<RwLock<HashMap<String, ModuleState>>>,
    /// 重载串行化
    reload_lock: Arc<Mutex<()>>,
    /// 共享服务
    services: RuntimeServices,
    hot_reload: Arc<AtomicBool>,
    instance_seq: Arc<AtomicU64>,
}

impl PluginManager {
    /// 创建新的生命周期管理器
    pub fn new(
        registry: Arc<ModuleRegistry>,
        loader: Arc<ModuleLoader>,
        services: RuntimeServices,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            loader,
            loaded: Arc::new(RwLock::new(HashMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
            reload_lock: Arc::new(Mutex::new(())),
            services,
            hot_reload: Arc::new(AtomicBool::new(config.hot_reload)),
            instance_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.services.event_bus.as_ref()
    }

    pub fn hot_reload_enabled(&self) -> bool {
        self.hot_reload.load(Ordering::SeqCst)
    }

    pub fn set_hot_reload(&self, enabled: bool) {
        self.hot_reload.store(enabled, Ordering::SeqCst);
    }

    /// 以编程方式登记模块：元数据进入注册表，工厂进入加载器
    pub async fn register_module<F>(&self, metadata: ModuleMetadata, factory: F)
    where
        F: Fn(ModuleContext) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.loader.register_factory(&metadata.name, factory);
        self.registry.register(metadata).await;
    }

    /// 加载模块
    ///
    /// 已加载且非强制时直接返回 true。任何失败都会记录到模块状态并返回 false。
    pub async fn load(
        &self,
        name: &str,
        config: Option<HashMap<String, Value>>,
        force_reload: bool,
    ) -> bool {
        self.load_module(name.to_string(), config, force_reload, Vec::new()).await.is_ok()
    }

    fn load_module(
        &self,
        name: String,
        config: Option<HashMap<String, Value>>,
        force: bool,
        chain: Vec<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !force && self.is_loaded(&name).await {
                debug!("Module '{}' already loaded", name);
                return Ok(());
            }

            let was_loaded = self.is_loaded(&name).await;
            let phase = if force && was_loaded {
                ModulePhase::Reloading
            } else {
                ModulePhase::Loading
            };
            self.set_phase(&name, phase).await;

            match self.try_load(&name, config, force, chain).await {
                Ok(version) => {
                    info!("Module '{}' loaded (version {})", name, version);
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to load module '{}': {}", name, e);
                    self.record_error(&name, &e).await;
                    Err(e)
                }
            }
        })
    }

    async fn try_load(
        &self,
        name: &str,
        config: Option<HashMap<String, Value>>,
        force: bool,
        mut chain: Vec<String>,
    ) -> Result<u64> {
        let metadata = self.registry.get_metadata(name).await
            .unwrap_or_else(|| ModuleMetadata::new(name));
        chain.push(name.to_string());

        // 必需依赖
        for dependency in &metadata.dependencies {
            if chain.contains(dependency) {
                let mut path = chain.clone();
                path.push(dependency.clone());
                return Err(SageError::CyclicDependency { path });
            }
            match self.load_module(dependency.clone(), None, false, chain.clone()).await {
                Ok(()) => {}
                Err(e @ SageError::CyclicDependency { .. }) => return Err(e),
                Err(_) => {
                    return Err(SageError::DependencyFailed {
                        module: name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // 可选依赖，失败不影响本模块
        for dependency in &metadata.optional_dependencies {
            if chain.contains(dependency) || !self.registry.contains(dependency).await {
                continue;
            }
            if self.load_module(dependency.clone(), None, false, chain.clone()).await.is_err() {
                warn!("Optional dependency '{}' of '{}' failed to load", dependency, name);
            }
        }

        check_api_compatibility(&metadata)?;

        let module_dir = self.registry.module_dir(name).await;
        let module_type = self.loader.load_type(name, &metadata, &module_dir, force).await?;

        let config = match config {
            Some(config) => config,
            None => self.services.config.as_ref()
                .map(|provider| provider.get_module_config(name))
                .unwrap_or_default(),
        };
        if let Some(schema) = &metadata.config_schema {
            let errors = validate_config_against_schema(&config, schema)?;
            if !errors.is_empty() {
                return Err(SageError::InvalidModuleConfig {
                    module: name.to_string(),
                    message: errors.join("; "),
                });
            }
        }

        let context = ModuleContext::new(name)
            .with_config(config)
            .with_event_bus(self.services.event_bus.clone())
            .with_cache(self.services.cache.clone());
        let mut instance = module_type.instantiate(context);

        let initialized = match instance.before_initialize().await {
            Ok(()) => match instance.initialize().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(SageError::InitializationFailed { module: name.to_string() }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = initialized {
            instance.initialize_failed(&e.to_string()).await;
            return Err(e);
        }

        let events = instance.subscribed_events();
        let handler_id = format!("{}#{}", name, self.instance_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let shared: SharedModule = Arc::new(Mutex::new(instance));

        if let Some(bus) = &self.services.event_bus {
            for event_type in &events {
                bus.subscribe(event_type.clone(), Arc::new(ModuleSubscriber {
                    id: handler_id.clone(),
                    instance: shared.clone(),
                }));
            }
        }

        let entry = LoadedModule {
            version: module_type.version,
            instance: shared.clone(),
            handler_id,
            events,
        };
        let previous = self.loaded.write().await.insert(name.to_string(), entry);
        if let Some(previous) = previous {
            if !force {
                warn!("Module '{}' was loaded concurrently, replacing the earlier instance", name);
            }
            self.retire(name, previous).await;
        }

        {
            let now = Utc::now();
            let mut states = self.states.write().await;
            let state = states.entry(name.to_string()).or_default();
            state.loaded_at = Some(now);
            if force {
                state.reload_count += 1;
                state.last_reload = Some(now);
            }
            state.phase = ModulePhase::Loaded;
            state.version = Some(module_type.version);
        }

        if let Err(e) = shared.lock().await.after_initialize().await {
            warn!("after_initialize hook of '{}' failed: {}", name, e);
        }

        self.emit(Event::module_loaded(name, force));
        Ok(module_type.version)
    }

    /// 撤下被替换的旧实例（不改变已加载集合）
    async fn retire(&self, name: &str, previous: LoadedModule) {
        self.unsubscribe(&previous);
        if let Err(e) = previous.instance.lock().await.shutdown().await {
            warn!("Shutdown of replaced instance of '{}' failed: {}", name, e);
        }
        debug!("Retired instance version {} of '{}'", previous.version, name);
    }

    fn unsubscribe(&self, entry: &LoadedModule) {
        if let Some(bus) = &self.services.event_bus {
            for event_type in &entry.events {
                bus.unsubscribe(event_type, &entry.handler_id);
            }
        }
    }

    /// 卸载模块，先按逆拓扑顺序卸载依赖它的已加载模块
    pub async fn unload(&self, name: &str) -> bool {
        if !self.is_loaded(name).await {
            warn!("Module '{}' is not loaded", name);
            return false;
        }

        let dependents = self.loaded_dependents(name).await;
        if !dependents.is_empty() {
            info!("Unloading dependents of '{}': {:?}", name, dependents);
            let order = self.registry.unload_order(&dependents).await;
            for dependent in &order.order {
                self.teardown(dependent).await;
            }
        }

        self.teardown(name).await
    }

    /// 移出已加载集合、取消订阅并调用 shutdown
    async fn teardown(&self, name: &str) -> bool {
        let Some(entry) = self.loaded.write().await.remove(name) else {
            return false;
        };
        self.set_phase(name, ModulePhase::Unloading).await;
        self.unsubscribe(&entry);

        let result = entry.instance.lock().await.shutdown().await;
        self.set_phase(name, ModulePhase::Unloaded).await;
        self.emit(Event::module_unloaded(name));

        match result {
            Ok(()) => {
                info!("Module '{}' unloaded", name);
                true
            }
            Err(e) => {
                error!("Module '{}' failed to shut down: {}", name, e);
                self.record_error(name, &e).await;
                false
            }
        }
    }

    /// 重载模块，并强制加载反向依赖图中找到的全部依赖方
    ///
    /// 已加载的依赖方先按逆序卸载；未加载的依赖方同样会被强制加载。
    /// 返回目标模块的加载结果，依赖方的重载尽力而为。
    pub async fn reload(&self, name: &str) -> bool {
        let _guard = self.reload_lock.lock().await;
        info!("Reloading module '{}'", name);

        let dependents = self.registry.transitive_dependents(name).await;
        let order = self.registry.resolve_load_order(&dependents).await;
        self.set_phase(name, ModulePhase::Reloading).await;

        for dependent in order.order.iter().rev() {
            if self.is_loaded(dependent).await {
                self.teardown(dependent).await;
            }
        }
        self.teardown(name).await;
        self.loader.invalidate(name);

        let reloaded = self.load_module(name.to_string(), None, true, Vec::new()).await.is_ok();

        for dependent in &order.order {
            if self.load_module(dependent.clone(), None, true, Vec::new()).await.is_err() {
                warn!("Dependent '{}' failed to reload after '{}'", dependent, name);
            }
        }

        reloaded
    }

    /// 批量加载，未指定时加载发现的全部模块
    pub async fn load_all(&self, names: Option<Vec<String>>) -> LoadReport {
        let requested = match names {
            Some(names) => {
                let mut known = true;
                for name in &names {
                    known &= self.registry.contains(name).await;
                }
                if !known {
                    self.registry.discover().await;
                }
                names
            }
            None => self.registry.discover().await,
        };

        let load_order = self.registry.resolve_load_order(&requested).await;
        if load_order.cyclic {
            warn!("Cyclic dependencies detected, loading in name order");
        }

        let mut results = HashMap::new();
        for name in &load_order.order {
            let ok = self.load(name, None, false).await;
            results.insert(name.clone(), ok);
        }

        let report = LoadReport { results, load_order };
        info!("Loaded {}/{} modules", report.loaded_count(), report.results.len());
        report
    }

    /// 按逆拓扑顺序卸载全部模块
    pub async fn unload_all(&self) -> HashMap<String, bool> {
        let loaded = self.loaded_modules().await;
        let order = self.registry.unload_order(&loaded).await;

        let mut results = HashMap::new();
        for name in &order.order {
            let ok = self.teardown(name).await;
            results.insert(name.clone(), ok);
        }
        info!("Unloaded {} modules", results.len());
        results
    }

    async fn loaded_dependents(&self, name: &str) -> Vec<String> {
        let dependents = self.registry.transitive_dependents(name).await;
        let loaded = self.loaded.read().await;
        dependents.into_iter().filter(|d| loaded.contains_key(d)).collect()
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.services.event_bus {
            bus.emit(event.with_source("plugin_manager"));
        }
    }

    async fn set_phase(&self, name: &str, phase: ModulePhase) {
        let mut states = self.states.write().await;
        states.entry(name.to_string()).or_default().phase = phase;
    }

    async fn record_error(&self, name: &str, error: &SageError) {
        let still_loaded = self.is_loaded(name).await;
        let mut states = self.states.write().await;
        let state = states.entry(name.to_string()).or_default();
        state.error_count += 1;
        state.last_error = Some(error.to_string());
        state.phase = if still_loaded { ModulePhase::Loaded } else { ModulePhase::Unloaded };
    }

    /// 记录健康检查结果
    pub(crate) async fn record_health(
        &self,
        name: &str,
        passed: bool,
        error: Option<String>,
        usage: Option<HashMap<String, Value>>,
    ) {
        let mut states = self.states.write().await;
        let state = states.entry(name.to_string()).or_default();
        state.health_check_passed = passed;
        if let Some(error) = error {
            state.last_error = Some(error);
        }
        if let Some(usage) = usage {
            state.resource_usage = usage;
        }
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().await.contains_key(name)
    }

    /// 已加载模块（按名称排序）
    pub async fn loaded_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 获取模块实例
    pub async fn get_module(&self, name: &str) -> Option<SharedModule> {
        self.loaded.read().await.get(name).map(|m| m.instance.clone())
    }

    /// 当前实例的类型版本号
    pub async fn loaded_version(&self, name: &str) -> Option<u64> {
        self.loaded.read().await.get(name).map(|m| m.version)
    }

    pub async fn get_module_state(&self, name: &str) -> Option<ModuleState> {
        self.states.read().await.get(name).cloned()
    }

    pub async fn module_states(&self) -> HashMap<String, ModuleState> {
        self.states.read().await.clone()
    }

    /// 已加载模块的状态信息
    pub async fn module_status(&self) -> HashMap<String, ModuleStatus> {
        let entries: Vec<(String, LoadedModule)> = self.loaded.read().await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut status = HashMap::new();
        for (name, entry) in entries {
            let module = entry.instance.lock().await;
            status.insert(name, ModuleStatus {
                loaded: module.is_loaded(),
                subscribed_events: entry.events.iter().map(|e| e.to_string()).collect(),
                resource_usage: module.resource_usage(),
            });
        }
        status
    }

    pub async fn dependency_graph(&self) -> GraphDump {
        self.registry.graph().await
    }

    pub async fn validate_dependencies(&self) -> HashMap<String, Vec<ValidationIssue>> {
        self.registry.validate_dependencies().await
    }

    /// 运行时统计
    pub async fn statistics(&self) -> RuntimeStatistics {
        let states = self.states.read().await;
        let total_reloads = states.values().map(|s| s.reload_count as u64).sum();
        let average_error_count = if states.is_empty() {
            0.0
        } else {
            states.values().map(|s| s.error_count as f64).sum::<f64>() / states.len() as f64
        };

        RuntimeStatistics {
            discovered_modules: self.registry.module_names().await.len(),
            loaded_modules: self.loaded.read().await.len(),
            hot_reload_enabled: self.hot_reload_enabled(),
            sandbox_enabled: self.loader.config().sandbox_enabled,
            total_reloads,
            average_error_count,
        }
    }

    /// 当前依赖方集合（含未加载的）
    pub async fn dependents_of(&self, name: &str) -> HashSet<String> {
        self.registry.transitive_dependents(name).await.into_iter().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ConfigManager, RuntimeConfig};
    use crate::core::EventBusConfig;
    use crate::plugins::dynamic_loader::LoaderConfig;
    use crate::plugins::metadata::MetadataBuilder;
    use crate::plugins::registry::RegistryConfig;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum InitMode {
        Ready,
        Refuse,
        Fail,
    }

    /// 测试模块的行为
    #[derive(Clone)]
    pub(crate) struct Behavior {
        pub init: InitMode,
        pub fail_shutdown: bool,
        pub healthy: bool,
        pub events: Vec<EventType>,
        pub yield_on_init: bool,
    }

    impl Default for Behavior {
        fn default() -> Self {
            Self {
                init: InitMode::Ready,
                fail_shutdown: false,
                healthy: true,
                events: Vec::new(),
                yield_on_init: false,
            }
        }
    }

    /// 测试模块调用计数
    #[derive(Default)]
    pub(crate) struct CallCounts {
        pub initialized: AtomicUsize,
        pub shut_down: AtomicUsize,
        pub handled: AtomicUsize,
        pub health_checks: AtomicUsize,
        pub failed_hook: AtomicUsize,
        pub config: parking_lot::Mutex<HashMap<String, Value>>,
    }

    pub(crate) type Journal = Arc<parking_lot::Mutex<Vec<String>>>;

    struct TestModule {
        context: ModuleContext,
        behavior: Behavior,
        calls: Arc<CallCounts>,
        journal: Journal,
        loaded: bool,
    }

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &str {
            &self.context.module_name
        }

        async fn initialize(&mut self) -> Result<bool> {
            if self.behavior.yield_on_init {
                tokio::task::yield_now().await;
            }
            self.calls.initialized.fetch_add(1, Ordering::SeqCst);
            *self.calls.config.lock() = self.context.config.clone();
            match self.behavior.init {
                InitMode::Ready => {
                    self.journal.lock().push(format!("init:{}", self.context.module_name));
                    self.loaded = true;
                    Ok(true)
                }
                InitMode::Refuse => Ok(false),
                InitMode::Fail => Err(SageError::module("device unavailable")),
            }
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.calls.shut_down.fetch_add(1, Ordering::SeqCst);
            self.journal.lock().push(format!("shutdown:{}", self.context.module_name));
            self.loaded = false;
            if self.behavior.fail_shutdown {
                return Err(SageError::module("device busy"));
            }
            Ok(())
        }

        async fn handle_event(&mut self, _event: &Event) -> Result<Option<Value>> {
            self.calls.handled.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }

        fn subscribed_events(&self) -> Vec<EventType> {
            self.behavior.events.clone()
        }

        async fn health_check(&self) -> Result<bool> {
            self.calls.health_checks.fetch_add(1, Ordering::SeqCst);
            if self.behavior.healthy {
                Ok(true)
            } else {
                Err(SageError::module("microphone disconnected"))
            }
        }

        async fn initialize_failed(&mut self, _reason: &str) {
            self.calls.failed_hook.fetch_add(1, Ordering::SeqCst);
        }

        fn resource_usage(&self) -> HashMap<String, Value> {
            let mut usage = HashMap::new();
            usage.insert("handled".to_string(), json!(self.calls.handled.load(Ordering::SeqCst)));
            usage
        }
    }

    pub(crate) struct Harness {
        pub manager: PluginManager,
        pub bus: Arc<EventBus>,
        pub journal: Journal,
    }

    impl Harness {
        pub async fn new() -> Self {
            Self::with_services(None).await
        }

        pub async fn with_services(config: Option<Arc<dyn ConfigProvider>>) -> Self {
            Self::build(Path::new("unused-modules-root"), config).await
        }

        /// 注册表根目录指向真实目录，供文件监控使用
        pub async fn with_root(root: &Path) -> Self {
            Self::build(root, None).await
        }

        async fn build(root: &Path, config: Option<Arc<dyn ConfigProvider>>) -> Self {
            let bus = Arc::new(EventBus::new(EventBusConfig::default()));
            bus.start().await.unwrap();
            let registry = Arc::new(ModuleRegistry::new(root, RegistryConfig::default()));
            let loader = Arc::new(ModuleLoader::new(LoaderConfig::default()));
            let services = RuntimeServices {
                event_bus: Some(bus.clone()),
                config,
                cache: None,
            };
            let manager = PluginManager::new(registry, loader, services, LifecycleConfig::default());
            Self {
                manager,
                bus,
                journal: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }

        pub async fn add(&self, name: &str, deps: &[&str], behavior: Behavior) -> Arc<CallCounts> {
            let mut builder = MetadataBuilder::new(name);
            for dep in deps {
                builder = builder.dependency(*dep);
            }
            self.add_with(builder.build(), behavior).await
        }

        pub async fn add_with(&self, metadata: ModuleMetadata, behavior: Behavior) -> Arc<CallCounts> {
            let calls = Arc::new(CallCounts::default());
            let factory_calls = calls.clone();
            let journal = self.journal.clone();
            self.manager.register_module(metadata, move |context| {
                Box::new(TestModule {
                    context,
                    behavior: behavior.clone(),
                    calls: factory_calls.clone(),
                    journal: journal.clone(),
                    loaded: false,
                }) as Box<dyn Module>
            }).await;
            calls
        }

        pub fn journal(&self) -> Vec<String> {
            self.journal.lock().clone()
        }

        pub fn clear_journal(&self) {
            self.journal.lock().clear();
        }
    }

    async fn chain_harness() -> (Harness, Arc<CallCounts>, Arc<CallCounts>, Arc<CallCounts>) {
        let harness = Harness::new().await;
        let a = harness.add("a", &["b"], Behavior::default()).await;
        let b = harness.add("b", &["c"], Behavior::default()).await;
        let c = harness.add("c", &[], Behavior::default()).await;
        (harness, a, b, c)
    }

    #[tokio::test]
    async fn test_load_brings_dependencies_first() {
        let (harness, _, _, _) = chain_harness().await;

        assert!(harness.manager.load("a", None, false).await);
        assert_eq!(harness.manager.loaded_modules().await, vec!["a", "b", "c"]);
        assert_eq!(harness.journal(), vec!["init:c", "init:b", "init:a"]);

        let state = harness.manager.get_module_state("a").await.unwrap();
        assert_eq!(state.phase, ModulePhase::Loaded);
        assert!(state.loaded_at.is_some());
        assert_eq!(state.reload_count, 0);
    }

    #[tokio::test]
    async fn test_dependency_failure_fails_whole_load() {
        let harness = Harness::new().await;
        harness.add("a", &["b"], Behavior::default()).await;
        let b = harness.add("b", &[], Behavior { init: InitMode::Refuse, ..Default::default() }).await;

        assert!(!harness.manager.load("a", None, false).await);
        assert!(!harness.manager.is_loaded("a").await);
        assert!(!harness.manager.is_loaded("b").await);
        assert_eq!(b.failed_hook.load(Ordering::SeqCst), 1);

        let a_state = harness.manager.get_module_state("a").await.unwrap();
        assert_eq!(a_state.error_count, 1);
        assert!(a_state.last_error.unwrap().contains("'b'"));
        assert_eq!(a_state.phase, ModulePhase::Unloaded);

        let b_state = harness.manager.get_module_state("b").await.unwrap();
        assert_eq!(b_state.error_count, 1);
    }

    #[tokio::test]
    async fn test_initialize_error_is_recorded_and_retryable() {
        let harness = Harness::new().await;
        let calls = harness.add("vision", &[], Behavior { init: InitMode::Fail, ..Default::default() }).await;

        assert!(!harness.manager.load("vision", None, false).await);
        assert!(!harness.manager.load("vision", None, false).await);
        assert_eq!(calls.initialized.load(Ordering::SeqCst), 2);
        let state = harness.manager.get_module_state("vision").await.unwrap();
        assert_eq!(state.error_count, 2);
        assert!(state.last_error.unwrap().contains("device unavailable"));
    }

    #[tokio::test]
    async fn test_second_load_is_noop() {
        let harness = Harness::new().await;
        let calls = harness.add("voice", &[], Behavior::default()).await;

        assert!(harness.manager.load("voice", None, false).await);
        let version = harness.manager.loaded_version("voice").await;
        assert!(harness.manager.load("voice", None, false).await);

        assert_eq!(calls.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(harness.manager.loaded_version("voice").await, version);
        assert_eq!(harness.manager.get_module_state("voice").await.unwrap().reload_count, 0);
    }

    #[tokio::test]
    async fn test_forced_load_swaps_instance() {
        let harness = Harness::new().await;
        let calls = harness.add("voice", &[], Behavior::default()).await;

        assert!(harness.manager.load("voice", None, false).await);
        let first = harness.manager.loaded_version("voice").await.unwrap();
        assert!(harness.manager.load("voice", None, true).await);
        let second = harness.manager.loaded_version("voice").await.unwrap();

        assert!(second > first);
        assert_eq!(calls.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(calls.shut_down.load(Ordering::SeqCst), 1);
        let state = harness.manager.get_module_state("voice").await.unwrap();
        assert_eq!(state.reload_count, 1);
        assert!(state.last_reload.is_some());
    }

    #[tokio::test]
    async fn test_reload_cascades_to_loaded_dependents() {
        let (harness, _, _, _) = chain_harness().await;
        assert!(harness.manager.load("a", None, false).await);
        harness.clear_journal();

        assert!(harness.manager.reload("c").await);
        assert_eq!(
            harness.journal(),
            vec!["shutdown:a", "shutdown:b", "shutdown:c", "init:c", "init:b", "init:a"]
        );
        for name in ["a", "b", "c"] {
            let state = harness.manager.get_module_state(name).await.unwrap();
            assert_eq!(state.reload_count, 1, "{}", name);
            assert!(harness.manager.is_loaded(name).await);
        }
    }

    #[tokio::test]
    async fn test_reload_force_loads_unloaded_dependents() {
        let harness = Harness::new().await;
        harness.add("x", &[], Behavior::default()).await;
        let y = harness.add("y", &["x"], Behavior::default()).await;
        assert!(harness.manager.load("x", None, false).await);
        assert!(!harness.manager.is_loaded("y").await);
        harness.clear_journal();

        assert!(harness.manager.reload("x").await);
        assert_eq!(harness.journal(), vec!["shutdown:x", "init:x", "init:y"]);
        assert!(harness.manager.is_loaded("y").await);
        assert_eq!(y.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(y.shut_down.load(Ordering::SeqCst), 0);
        assert_eq!(harness.manager.get_module_state("y").await.unwrap().reload_count, 1);
    }

    #[tokio::test]
    async fn test_reload_reaches_transitive_dependents_in_order() {
        let (harness, _, _, _) = chain_harness().await;
        assert!(harness.manager.load("b", None, false).await);
        harness.clear_journal();

        assert!(harness.manager.reload("c").await);
        assert_eq!(
            harness.journal(),
            vec!["shutdown:b", "shutdown:c", "init:c", "init:b", "init:a"]
        );
        for name in ["a", "b", "c"] {
            assert!(harness.manager.is_loaded(name).await, "{}", name);
        }
        assert_eq!(harness.manager.get_module_state("a").await.unwrap().reload_count, 1);
    }

    #[tokio::test]
    async fn test_reloads_never_interleave() {
        let harness = Harness::new().await;
        let slow = Behavior { yield_on_init: true, ..Default::default() };
        harness.add("voice", &[], slow.clone()).await;
        harness.add("vision", &[], slow).await;
        assert!(harness.manager.load("voice", None, false).await);
        assert!(harness.manager.load("vision", None, false).await);
        harness.clear_journal();

        let (voice, vision) = tokio::join!(
            harness.manager.reload("voice"),
            harness.manager.reload("vision"),
        );
        assert!(voice && vision);

        let journal = harness.journal();
        assert_eq!(journal.len(), 4);
        let pairs: Vec<&[String]> = journal.chunks(2).collect();
        for pair in pairs {
            let module = pair[0].trim_start_matches("shutdown:");
            assert_eq!(pair[0], format!("shutdown:{}", module));
            assert_eq!(pair[1], format!("init:{}", module));
        }
    }

    #[tokio::test]
    async fn test_direct_cyclic_load_fails_fast() {
        let harness = Harness::new().await;
        harness.add("x", &["y"], Behavior::default()).await;
        harness.add("y", &["x"], Behavior::default()).await;

        let result = tokio::time::timeout(Duration::from_secs(5), harness.manager.load("x", None, false)).await;
        assert_eq!(result.ok(), Some(false));
        assert!(harness.manager.loaded_modules().await.is_empty());

        let state = harness.manager.get_module_state("x").await.unwrap();
        assert_eq!(state.last_error.as_deref(), Some("Cyclic dependency detected: x -> y -> x"));
    }

    #[tokio::test]
    async fn test_unload_tears_down_dependents_first() {
        let (harness, _, _, _) = chain_harness().await;
        assert!(harness.manager.load("a", None, false).await);
        harness.clear_journal();

        assert!(harness.manager.unload("c").await);
        assert!(harness.manager.loaded_modules().await.is_empty());
        assert_eq!(harness.journal(), vec!["shutdown:a", "shutdown:b", "shutdown:c"]);
        assert!(!harness.manager.unload("c").await);
    }

    #[tokio::test]
    async fn test_failed_shutdown_still_removes_module() {
        let harness = Harness::new().await;
        harness.add("calendar", &[], Behavior { fail_shutdown: true, ..Default::default() }).await;
        assert!(harness.manager.load("calendar", None, false).await);

        assert!(!harness.manager.unload("calendar").await);
        assert!(!harness.manager.is_loaded("calendar").await);
        let state = harness.manager.get_module_state("calendar").await.unwrap();
        assert_eq!(state.error_count, 1);
        assert_eq!(state.phase, ModulePhase::Unloaded);
    }

    #[tokio::test]
    async fn test_load_all_continues_past_failures() {
        let harness = Harness::new().await;
        harness.add("voice", &[], Behavior::default()).await;
        harness.add("vision", &[], Behavior { init: InitMode::Fail, ..Default::default() }).await;
        harness.add("calendar", &["vision"], Behavior::default()).await;
        harness.add("nlp", &[], Behavior::default()).await;

        let report = harness.manager
            .load_all(Some(vec!["calendar".into(), "voice".into(), "vision".into(), "nlp".into()]))
            .await;

        assert_eq!(report.load_order.order, vec!["voice", "vision", "nlp", "calendar"]);
        assert!(!report.load_order.cyclic);
        assert_eq!(report.results["voice"], true);
        assert_eq!(report.results["vision"], false);
        assert_eq!(report.results["calendar"], false);
        assert_eq!(report.results["nlp"], true);
        assert_eq!(report.loaded_count(), 2);
    }

    #[tokio::test]
    async fn test_unload_all_in_reverse_topological_order() {
        let (harness, _, _, _) = chain_harness().await;
        harness.add("d", &[], Behavior::default()).await;
        let report = harness.manager.load_all(Some(vec!["d".into(), "a".into(), "b".into(), "c".into()])).await;
        assert_eq!(report.loaded_count(), 4);
        harness.clear_journal();

        let results = harness.manager.unload_all().await;
        assert_eq!(results.len(), 4);
        assert!(results.values().all(|ok| *ok));

        let journal = harness.journal();
        let position = |entry: &str| journal.iter().position(|e| e == entry).unwrap();
        assert!(position("shutdown:a") < position("shutdown:b"));
        assert!(position("shutdown:b") < position("shutdown:c"));
        assert!(harness.manager.loaded_modules().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_follow_lifecycle() {
        let harness = Harness::new().await;
        let calls = harness
            .add("calendar", &[], Behavior { events: vec![EventType::ReminderDue], ..Default::default() })
            .await;
        assert!(harness.manager.load("calendar", None, false).await);
        assert_eq!(harness.bus.handler_count(&EventType::ReminderDue), 1);

        harness.bus.emit(Event::new(EventType::ReminderDue, HashMap::new()));
        for _ in 0..100 {
            if calls.handled.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.handled.load(Ordering::SeqCst), 1);

        assert!(harness.manager.unload("calendar").await);
        assert_eq!(harness.bus.handler_count(&EventType::ReminderDue), 0);

        let kinds: Vec<EventType> = harness.bus.recent_events().into_iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&EventType::ModuleLoaded));
        assert!(kinds.contains(&EventType::ModuleUnloaded));
        let loaded = harness.bus.recent_events().into_iter()
            .find(|e| e.event_type == EventType::ModuleLoaded)
            .unwrap();
        assert_eq!(loaded.get_str("module_name"), Some("calendar"));
    }

    #[tokio::test]
    async fn test_config_schema_is_enforced() {
        let harness = Harness::new().await;
        let metadata = MetadataBuilder::new("voice")
            .config_schema(json!({
                "type": "object",
                "properties": { "rate": { "type": "integer" } },
                "required": ["rate"]
            }))
            .build();
        let calls = harness.add_with(metadata, Behavior::default()).await;

        assert!(!harness.manager.load("voice", None, false).await);
        let state = harness.manager.get_module_state("voice").await.unwrap();
        assert!(state.last_error.unwrap().contains("Invalid configuration"));
        assert_eq!(calls.initialized.load(Ordering::SeqCst), 0);

        let mut config = HashMap::new();
        config.insert("rate".to_string(), json!(180));
        assert!(harness.manager.load("voice", Some(config), false).await);
        assert_eq!(calls.config.lock().get("rate"), Some(&json!(180)));
    }

    #[tokio::test]
    async fn test_config_comes_from_provider() {
        let mut runtime_config = RuntimeConfig::default();
        let mut voice = HashMap::new();
        voice.insert("language".to_string(), json!("en-US"));
        runtime_config.modules.settings.insert("voice".to_string(), voice);
        let provider: Arc<dyn ConfigProvider> = Arc::new(ConfigManager::new(runtime_config));

        let harness = Harness::with_services(Some(provider)).await;
        let calls = harness.add("voice", &[], Behavior::default()).await;
        assert!(harness.manager.load("voice", None, false).await);
        assert_eq!(calls.config.lock().get("language"), Some(&json!("en-US")));
    }

    #[tokio::test]
    async fn test_incompatible_api_blocks_load() {
        let harness = Harness::new().await;
        let metadata = MetadataBuilder::new("legacy").requires_api_version("^0.3").build();
        let calls = harness.add_with(metadata, Behavior::default()).await;

        assert!(!harness.manager.load("legacy", None, false).await);
        assert_eq!(calls.initialized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_implementation() {
        let harness = Harness::new().await;
        harness.manager.registry().register(ModuleMetadata::new("ghost")).await;
        assert!(!harness.manager.load("ghost", None, false).await);
        let state = harness.manager.get_module_state("ghost").await.unwrap();
        assert!(state.last_error.unwrap().contains("No implementation"));
    }

    #[tokio::test]
    async fn test_optional_dependency_failure_is_tolerated() {
        let harness = Harness::new().await;
        let metadata = MetadataBuilder::new("nlp").optional_dependency("vision").build();
        harness.add_with(metadata, Behavior::default()).await;
        harness.add("vision", &[], Behavior { init: InitMode::Refuse, ..Default::default() }).await;

        assert!(harness.manager.load("nlp", None, false).await);
        assert!(!harness.manager.is_loaded("vision").await);
    }

    #[tokio::test]
    async fn test_concurrent_first_loads_are_not_deduplicated() {
        let harness = Harness::new().await;
        let calls = harness.add("voice", &[], Behavior { yield_on_init: true, ..Default::default() }).await;

        let (first, second) = tokio::join!(
            harness.manager.load("voice", None, false),
            harness.manager.load("voice", None, false),
        );
        assert!(first && second);
        assert_eq!(calls.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(calls.shut_down.load(Ordering::SeqCst), 1);
        assert_eq!(harness.manager.loaded_modules().await, vec!["voice"]);
    }

    #[tokio::test]
    async fn test_statistics_and_status() {
        let (harness, _, _, _) = chain_harness().await;
        harness.add("vision", &[], Behavior { init: InitMode::Fail, ..Default::default() }).await;
        assert!(harness.manager.load("a", None, false).await);
        assert!(!harness.manager.load("vision", None, false).await);
        assert!(harness.manager.reload("c").await);

        let stats = harness.manager.statistics().await;
        assert_eq!(stats.discovered_modules, 4);
        assert_eq!(stats.loaded_modules, 3);
        assert_eq!(stats.total_reloads, 3);
        assert!(!stats.hot_reload_enabled);
        assert!(stats.sandbox_enabled);
        assert_eq!(stats.average_error_count, 0.25);

        let status = harness.manager.module_status().await;
        assert_eq!(status.len(), 3);
        assert!(status["a"].loaded);
        assert!(status["a"].resource_usage.contains_key("handled"));

        let graph = harness.manager.dependency_graph().await;
        assert_eq!(graph.dependencies["a"], vec!["b".to_string()]);
        assert!(harness.manager.validate_dependencies().await.is_empty());
        assert_eq!(harness.manager.dependents_of("c").await.len(), 2);
    }
}
