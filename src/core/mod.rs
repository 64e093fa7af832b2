//! 核心基础层模块
//!
//! 提供运行时共享的基础设施：事件总线、缓存、日志

pub mod event_bus;
pub mod cache;
pub mod logger;

// 重新导出核心组件
pub use event_bus::*;
pub use cache::*;
pub use logger::*;
