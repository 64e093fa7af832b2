//! 模块生命周期层
//!
//! 注册表发现模块，解析器排定顺序，加载器产出模块类型，
//! 生命周期管理器负责加载、卸载和重载，健康监控与热重载监控在其之上工作

pub mod core;
pub mod metadata;
pub mod dependency;
pub mod registry;
pub mod dynamic_loader;
pub mod lifecycle;
pub mod health;
pub mod hot_reload;
pub mod dev_toolkit;

// 重新导出核心组件
pub use self::core::*;
pub use metadata::*;
pub use dependency::*;
pub use registry::*;
pub use dynamic_loader::*;
pub use lifecycle::*;
pub use health::*;
pub use hot_reload::*;
pub use dev_toolkit::*;
