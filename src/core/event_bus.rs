//! 事件总线
//!
//! 基于有界 mpsc 通道的发布/订阅实现。发布不阻塞，队列满时丢弃事件；
//! 分发在后台任务中进行，已排队的事件按优先级从高到低分发，
//! 每个处理器的单次处理有超时限制。

use crate::types::{Event, EventType};
use crate::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器标识，用于取消订阅
    fn handler_id(&self) -> &str;

    /// 处理事件
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// 事件总线配置
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 保留的最近事件条数
    pub history_size: usize,
    /// 单个处理器的处理超时
    pub handler_timeout: Duration,
    /// 待分发队列的容量
    pub max_queue_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            handler_timeout: Duration::from_secs(5),
            max_queue_size: 1000,
        }
    }
}

/// 事件总线统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStatistics {
    /// 通道中等待分发的事件数
    pub queue_size: usize,
    pub max_queue_size: usize,
    /// 全部事件类型上的处理器总数
    pub total_subscribers: usize,
    /// 有处理器的事件类型
    pub event_types: Vec<String>,
    pub running: bool,
    /// 成功入队的事件数
    pub published: u64,
    /// 因队列已满被丢弃的事件数
    pub dropped: u64,
}

type HandlerMap = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

/// 事件总线
pub struct EventBus {
    /// 事件发送通道
    sender: mpsc::Sender<Event>,
    /// 未运行时保存接收端，分发任务结束后归还
    receiver: Arc<Mutex<Option<mpsc::Receiver<Event>>>>,
    /// 注册的事件处理器
    handlers: Arc<RwLock<HandlerMap>>,
    /// 最近事件
    history: Arc<Mutex<VecDeque<Event>>>,
    config: EventBusConfig,
    running: Arc<AtomicBool>,
    published: AtomicU64,
    dropped: AtomicU64,
    worker: Mutex<Option<(CancellationToken, JoinHandle<mpsc::Receiver<Event>>)>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        // 容量为 0 时 tokio 会 panic
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            config,
            running: Arc::new(AtomicBool::new(false)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// 启动分发任务
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut receiver = self.receiver.lock().take()
            .ok_or_else(|| crate::SageError::event_bus("Event receiver is already in use"))?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handlers = self.handlers.clone();
        let timeout = self.config.handler_timeout;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(event) => {
                            let mut batch = vec![event];
                            while let Ok(queued) = receiver.try_recv() {
                                batch.push(queued);
                            }
                            for event in order_by_priority(batch) {
                                dispatch(&handlers, &event, timeout).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            receiver
        });

        *self.worker.lock() = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        info!("Event bus started");
        Ok(())
    }

    /// 停止分发任务，未分发的事件保留在通道中
    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let worker = self.worker.lock().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            match handle.await {
                Ok(receiver) => *self.receiver.lock() = Some(receiver),
                Err(e) => error!("Event bus worker ended abnormally: {}", e),
            }
            info!("Event bus stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 订阅事件
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!("Handler '{}' subscribed to {}", handler.handler_id(), event_type);
        self.handlers.write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// 按处理器标识取消订阅，返回是否移除了处理器
    pub fn unsubscribe(&self, event_type: &EventType, handler_id: &str) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.handler_id() != handler_id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }
        if removed {
            debug!("Handler '{}' unsubscribed from {}", handler_id, event_type);
        }
        removed
    }

    /// 某事件类型的处理器数量
    pub fn handler_count(&self, event_type: &EventType) -> usize {
        self.handlers.read().get(event_type).map_or(0, Vec::len)
    }

    /// 发布事件（不等待处理）。总线未运行或队列已满时事件被丢弃。
    pub fn emit(&self, event: Event) {
        if !self.is_running() {
            warn!("Event bus not running, dropping event {}", event.event_type);
            return;
        }

        let recorded = event.clone();
        match self.sender.try_send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                let mut history = self.history.lock();
                history.push_back(recorded);
                while history.len() > self.config.history_size {
                    history.pop_front();
                }
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Event queue full ({}), dropping event {}",
                    self.config.max_queue_size, event.event_type
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Event bus channel closed, event dropped");
            }
        }
    }

    /// 最近的事件，按发布顺序
    pub fn recent_events(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    /// 总线统计
    pub fn statistics(&self) -> EventBusStatistics {
        let handlers = self.handlers.read();
        let mut event_types: Vec<String> = handlers.keys().map(|t| t.to_string()).collect();
        event_types.sort();

        EventBusStatistics {
            queue_size: self.sender.max_capacity() - self.sender.capacity(),
            max_queue_size: self.sender.max_capacity(),
            total_subscribers: handlers.values().map(Vec::len).sum(),
            event_types,
            running: self.is_running(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

/// 按优先级从高到低排列，同优先级保持发布顺序
fn order_by_priority(mut batch: Vec<Event>) -> Vec<Event> {
    batch.sort_by(|a, b| b.priority.cmp(&a.priority));
    batch
}

async fn dispatch(handlers: &RwLock<HandlerMap>, event: &Event, timeout: Duration) {
    let targets: Vec<Arc<dyn EventHandler>> = handlers.read()
        .get(&event.event_type)
        .cloned()
        .unwrap_or_default();

    if targets.is_empty() {
        return;
    }

    let results = futures::future::join_all(targets.iter().map(|handler| async move {
        let outcome = tokio::time::timeout(timeout, handler.handle(event)).await;
        (handler.handler_id().to_string(), outcome)
    })).await;

    for (handler_id, outcome) in results {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Handler '{}' failed on {}: {}", handler_id, event.event_type, e),
            Err(_) => warn!("Handler '{}' timed out on {}", handler_id, event.event_type),
        }
    }
}
