//! 模块系统核心特征定义
//!
//! 定义统一的 Module trait、模块运行时上下文和模块工厂

use crate::core::{CacheProvider, EventBus, ModuleLogger};
use crate::types::{Event, EventType, ModuleName};
use crate::{Result, SageError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 模块上下文 - 加载时注入的共享服务
#[derive(Clone)]
pub struct ModuleContext {
    /// 模块名称
    pub module_name: ModuleName,
    /// 事件总线引用
    pub event_bus: Option<Arc<EventBus>>,
    /// 配置数据
    pub config: HashMap<String, Value>,
    /// 共享缓存
    pub cache: Option<Arc<dyn CacheProvider>>,
    /// 日志器
    pub logger: ModuleLogger,
}

impl ModuleContext {
    /// 创建新的模块上下文
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            event_bus: None,
            config: HashMap::new(),
            cache: None,
            logger: ModuleLogger::new(module_name),
        }
    }

    /// 设置配置
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Option<Arc<EventBus>>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn CacheProvider>>) -> Self {
        self.cache = cache;
        self
    }

    /// 获取配置值
    pub fn get_config<T>(&self, key: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.config.get(key).ok_or_else(|| {
            SageError::InvalidModuleConfig {
                module: self.module_name.clone(),
                message: format!("missing key '{}'", key),
            }
        })?;

        serde_json::from_value(value.clone()).map_err(|e| {
            SageError::InvalidModuleConfig {
                module: self.module_name.clone(),
                message: format!("failed to deserialize key '{}': {}", key, e),
            }
        })
    }

    /// 以本模块为来源发布事件，没有事件总线时忽略
    pub fn emit(&self, event_type: EventType, data: HashMap<String, Value>) {
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::new(event_type, data).with_source(&self.module_name));
        }
    }

    /// 读取本模块命名空间下的缓存
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.as_ref()?.get(&self.module_name, key)
    }

    /// 写入本模块命名空间下的缓存
    pub fn cache_set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Some(cache) = &self.cache {
            cache.set(&self.module_name, key, value, ttl);
        }
    }
}

/// 核心模块特征 - 所有模块必须实现
#[async_trait]
pub trait Module: Send + Sync {
    /// 模块名称
    fn name(&self) -> &str;

    /// 初始化模块，返回 false 表示初始化失败
    async fn initialize(&mut self) -> Result<bool>;

    /// 释放模块资源
    async fn shutdown(&mut self) -> Result<()>;

    /// 处理订阅的事件
    async fn handle_event(&mut self, event: &Event) -> Result<Option<Value>>;

    /// 模块是否处于已加载状态
    fn is_loaded(&self) -> bool;

    /// 订阅的事件类型
    fn subscribed_events(&self) -> Vec<EventType>;

    /// 健康检查
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// 初始化之前调用
    async fn before_initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// 初始化成功并注册后调用
    async fn after_initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// 初始化失败时调用
    async fn initialize_failed(&mut self, _reason: &str) {}

    /// 资源使用快照
    fn resource_usage(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// 模块工厂：每个模块包导出的构造函数
pub type ModuleFactory = Arc<dyn Fn(ModuleContext) -> Box<dyn Module> + Send + Sync>;
