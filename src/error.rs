//! SAGE 运行时错误处理
//!
//! 统一的错误类型和错误处理机制

use thiserror::Error;

/// 运行时统一错误类型
#[derive(Error, Debug)]
pub enum SageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("No implementation registered for module: {module}")]
    NoImplementationFound { module: String },

    #[error("Module '{module}' failed to load dependency '{dependency}'")]
    DependencyFailed { module: String, dependency: String },

    #[error("Cyclic dependency detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Sandbox check failed for module '{module}': {}", .violations.join("; "))]
    SandboxViolation { module: String, violations: Vec<String> },

    #[error("Module '{module}' requires API '{required}', runtime provides {actual}")]
    IncompatibleApiVersion {
        module: String,
        required: String,
        actual: String,
    },

    #[error("Invalid configuration for module '{module}': {message}")]
    InvalidModuleConfig { module: String, message: String },

    #[error("Module '{module}' failed to initialize")]
    InitializationFailed { module: String },

    #[error("Module not loaded: {module}")]
    NotLoaded { module: String },

    #[error("Module error: {message}")]
    Module { message: String },

    #[error("Event bus error: {message}")]
    EventBus { message: String },

    #[error("Watcher error: {message}")]
    Watcher { message: String },

    #[error("Template error: {message}")]
    Template { message: String },
}

impl SageError {
    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 创建模块内部错误
    pub fn module(message: &str) -> Self {
        Self::Module {
            message: message.to_string(),
        }
    }

    pub fn event_bus(message: &str) -> Self {
        Self::EventBus {
            message: message.to_string(),
        }
    }

    pub fn watcher(message: &str) -> Self {
        Self::Watcher {
            message: message.to_string(),
        }
    }

    pub fn template(message: &str) -> Self {
        Self::Template {
            message: message.to_string(),
        }
    }

    /// 模块未找到
    pub fn not_found(module: &str) -> Self {
        Self::ModuleNotFound {
            module: module.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = SageError::config("missing modules path");
        assert!(matches!(error, SageError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: missing modules path");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = SageError::from(io_error);
        assert!(matches!(error, SageError::Io(_)));
    }

    #[test]
    fn test_cycle_message() {
        let error = SageError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_sandbox_message() {
        let error = SageError::SandboxViolation {
            module: "voice".into(),
            violations: vec!["mod.rs: unsafe ".into(), "io.rs: libc::".into()],
        };
        assert!(error.to_string().contains("mod.rs: unsafe ; io.rs: libc::"));
    }
}
