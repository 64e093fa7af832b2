//! SAGE - 模块化助手运行时
//!
//! 发现、排序、加载、热重载并监控可插拔模块
//!
//! # 组成
//!
//! - **模块注册表**: 扫描模块目录，读取 `module.json` 描述文件，维护依赖图
//! - **依赖解析**: 拓扑排序给出加载顺序，检测循环依赖
//! - **模块加载器**: 按名称登记的工厂，带版本号的模块类型缓存，可选的源码检查
//! - **生命周期管理**: 依赖优先加载、依赖方优先卸载、级联重载
//! - **热重载与健康监控**: 文件变更去抖后重载，周期性健康检查
//!
//! 共享服务（事件总线、配置、缓存）由宿主持有，通过 `ModuleContext` 注入模块。

pub mod types;
pub mod error;
pub mod core;
pub mod plugins;
pub mod config;
pub mod runner;

// 重新导出核心类型
pub use types::*;
pub use error::*;
pub use self::core::*;
pub use plugins::*;
pub use config::*;
pub use runner::*;

use once_cell::sync::Lazy;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "SAGE";

/// 模块描述文件中 `requires_api_version` 所对照的运行时 API 版本
pub static API_VERSION: Lazy<semver::Version> = Lazy::new(|| semver::Version::new(1, 0, 0));

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SageError>;

/// 快速启动函数：按默认日志配置安装订阅器
pub async fn initialize() -> Result<()> {
    init_logging(&LoggingConfig::default());
    tracing::info!("Initializing {} v{} (module API {})", FRAMEWORK_NAME, VERSION, *API_VERSION);
    Ok(())
}
