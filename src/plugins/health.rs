//! 模块健康监控
//!
//! 按需或周期性地检查已加载模块，结果写回模块状态

use super::lifecycle::PluginManager;
use crate::types::{Event, EventType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 健康监控器
pub struct HealthMonitor {
    manager: PluginManager,
    /// 周期检查间隔
    interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(manager: PluginManager, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            task: Mutex::new(None),
        }
    }

    /// 检查指定模块或全部已加载模块
    ///
    /// 未加载的模块直接报告为不健康，不会调用任何模块代码。
    pub async fn check(&self, name: Option<&str>) -> HashMap<String, bool> {
        check_modules(&self.manager, name).await
    }

    /// 启动周期检查
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return true;
        }
        if self.interval.is_zero() {
            debug!("Periodic health checks disabled");
            return false;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime available, periodic health checks disabled");
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let manager = self.manager.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = check_modules(&manager, None).await;
                        report_unhealthy(&manager, &results);
                    }
                }
            }
        });

        *task = Some((token, handle));
        info!("Health monitor started with interval {:?}", self.interval);
        true
    }

    /// 停止周期检查
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

async fn check_modules(manager: &PluginManager, name: Option<&str>) -> HashMap<String, bool> {
    let targets = match name {
        Some(name) => vec![name.to_string()],
        None => manager.loaded_modules().await,
    };

    let mut results = HashMap::new();
    for target in targets {
        let Some(instance) = manager.get_module(&target).await else {
            manager.record_health(&target, false, None, None).await;
            results.insert(target, false);
            continue;
        };

        let (healthy, error, usage) = {
            let module = instance.lock().await;
            let usage = module.resource_usage();
            match module.health_check().await {
                Ok(passed) => (module.is_loaded() && passed, None, usage),
                Err(e) => (false, Some(e.to_string()), usage),
            }
        };

        if !healthy {
            debug!("Module '{}' failed health check", target);
        }
        manager.record_health(&target, healthy, error, Some(usage)).await;
        results.insert(target, healthy);
    }
    results
}

fn report_unhealthy(manager: &PluginManager, results: &HashMap<String, bool>) {
    for (name, healthy) in results {
        if *healthy {
            continue;
        }
        warn!("Module '{}' is unhealthy", name);
        if let Some(bus) = manager.event_bus() {
            let mut data = HashMap::new();
            data.insert("module_name".to_string(), serde_json::json!(name));
            bus.emit(Event::new(EventType::HealthCheckFailed, data).with_source("health_monitor"));
        }
    }
}
