//! 模块热重载
//!
//! 文件监控回调运行在 notify 的线程上，只负责把 `(模块, 路径, 时间)` 投递到通道；
//! 运行时上的消费任务做按文件去抖，然后请求生命周期管理器重载模块。

use super::lifecycle::PluginManager;
use super::registry::RegistryConfig;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 热重载配置
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// 同一文件两次变更的最小间隔
    pub debounce: Duration,
    /// 触发重载的文件扩展名
    pub extensions: Vec<String>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            extensions: vec!["rs".to_string()],
        }
    }
}

/// 重载请求
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub module_name: String,
    pub path: PathBuf,
    pub observed_at: Instant,
}

/// 按文件去抖，窗口从上一次被接受的变更开始计算
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_accepted: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    pub fn accept(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(previous) = self.last_accepted.get(path) {
            if now.saturating_duration_since(*previous) < self.window {
                return false;
            }
        }
        // 窗口已过的记录不再影响判断
        let window = self.window;
        self.last_accepted.retain(|_, accepted| now.saturating_duration_since(*accepted) < window);
        self.last_accepted.insert(path.to_path_buf(), now);
        true
    }

    /// 仍在窗口内的文件数
    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}

/// 变更文件所属的模块：模块根目录下的第一级目录名
pub fn module_name_for(root: &Path, path: &Path, registry: &RegistryConfig) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = match components.next()? {
        Component::Normal(name) => name.to_string_lossy().to_string(),
        _ => return None,
    };
    // 根目录下的文件不属于任何模块
    components.next()?;
    if registry.is_excluded(&first) {
        return None;
    }
    Some(first)
}

struct WatchSession {
    watcher: RecommendedWatcher,
    token: CancellationToken,
    consumer: JoinHandle<()>,
}

/// 热重载监控器
pub struct HotReloadWatcher {
    manager: PluginManager,
    config: HotReloadConfig,
    session: Mutex<Option<WatchSession>>,
}

impl HotReloadWatcher {
    pub fn new(manager: PluginManager, config: HotReloadConfig) -> Self {
        Self {
            manager,
            config,
            session: Mutex::new(None),
        }
    }

    /// 开始监控模块根目录
    ///
    /// 没有异步运行时、无法创建文件监控或根目录不可监控时返回 false，热重载保持关闭。
    pub fn enable(&self) -> bool {
        let mut session = self.session.lock();
        if session.is_some() {
            return true;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, hot reload disabled");
            return false;
        };

        let root = match std::fs::canonicalize(self.manager.registry().root()) {
            Ok(root) => root,
            Err(e) => {
                warn!("Cannot watch modules path {:?}: {}", self.manager.registry().root(), e);
                return false;
            }
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let watch_root = root.clone();
        let extensions = self.config.extensions.clone();
        let registry_config = self.manager.registry().config().clone();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    return;
                }
                let observed_at = Instant::now();
                for path in event.paths {
                    let relevant = path.extension()
                        .and_then(|ext| ext.to_str())
                        .map_or(false, |ext| extensions.iter().any(|e| e == ext));
                    if !relevant {
                        continue;
                    }
                    if let Some(module_name) = module_name_for(&watch_root, &path, &registry_config) {
                        let _ = sender.send(ReloadRequest { module_name, path, observed_at });
                    }
                }
            },
            notify::Config::default(),
        );

        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create file watcher: {}", e);
                return false;
            }
        };

        if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
            warn!("Failed to watch {:?}: {}", root, e);
            return false;
        }

        let token = CancellationToken::new();
        let consumer = runtime.spawn(run_consumer(
            self.manager.clone(),
            receiver,
            self.config.debounce,
            token.clone(),
        ));

        *session = Some(WatchSession { watcher, token, consumer });
        self.manager.set_hot_reload(true);
        info!("Hot reload enabled for {:?}", root);
        true
    }

    /// 停止监控
    pub async fn disable(&self) {
        let session = self.session.lock().take();
        self.manager.set_hot_reload(false);
        if let Some(session) = session {
            session.token.cancel();
            drop(session.watcher);
            let _ = session.consumer.await;
            info!("Hot reload disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.session.lock().is_some()
    }
}

/// 消费重载请求，直到通道关闭或被取消
pub async fn run_consumer(
    manager: PluginManager,
    mut receiver: mpsc::UnboundedReceiver<ReloadRequest>,
    debounce: Duration,
    token: CancellationToken,
) {
    let mut debouncer = Debouncer::new(debounce);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            request = receiver.recv() => match request {
                Some(request) => {
                    handle_request(&manager, &mut debouncer, request).await;
                }
                None => break,
            },
        }
    }
}

async fn handle_request(manager: &PluginManager, debouncer: &mut Debouncer, request: ReloadRequest) -> bool {
    if !debouncer.accept(&request.path, request.observed_at) {
        debug!("Change to {:?} debounced", request.path);
        return false;
    }
    if !manager.hot_reload_enabled() {
        return false;
    }
    if !manager.is_loaded(&request.module_name).await {
        debug!("Module '{}' changed but is not loaded", request.module_name);
        return false;
    }
    let reload_safe = manager.registry().get_metadata(&request.module_name).await
        .map_or(true, |metadata| metadata.reload_safe);
    if !reload_safe {
        info!("Module '{}' changed but is not reload safe, restart required", request.module_name);
        return false;
    }

    info!("Change detected in module '{}': {:?}", request.module_name, request.path);
    manager.reload(&request.module_name).await
}
