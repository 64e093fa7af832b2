//! 模块元数据
//!
//! 模块包的声明式契约（`module.json`）、配置 Schema 校验与运行时 API 兼容性检查

use crate::{Result, SageError, API_VERSION};
use jsonschema::JSONSchema;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// 模块描述文件名
pub const DESCRIPTOR_FILE: &str = "module.json";
/// 模块入口文件，存在其一即视为候选模块
pub const ENTRY_FILES: &[&str] = &["mod.rs", "lib.rs"];
/// 默认模块版本
pub const DEFAULT_MODULE_VERSION: &str = "1.0.0";
/// 默认模块优先级
pub const DEFAULT_MODULE_PRIORITY: i32 = 50;

/// 模块元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMetadata {
    /// 模块名称（等于目录名）
    pub name: String,
    /// 模块版本
    pub version: String,
    /// 模块描述
    pub description: String,
    /// 必需依赖，保持声明顺序且不重复
    pub dependencies: Vec<String>,
    /// 可选依赖
    pub optional_dependencies: Vec<String>,
    /// 提供的能力标签
    pub provides: Vec<String>,
    /// 要求的运行时 API 版本（semver 要求表达式）
    pub requires_api_version: Option<String>,
    /// 是否需要沙箱检查
    pub sandboxed: bool,
    /// 是否可以安全热重载
    pub reload_safe: bool,
    /// 加载优先级
    pub priority: i32,
    /// 配置 Schema（JSON Schema）
    pub config_schema: Option<Value>,
}

impl Default for ModuleMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: DEFAULT_MODULE_VERSION.to_string(),
            description: String::new(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            provides: Vec::new(),
            requires_api_version: None,
            sandboxed: false,
            reload_safe: true,
            priority: DEFAULT_MODULE_PRIORITY,
            config_schema: None,
        }
    }
}

impl ModuleMetadata {
    /// 创建默认元数据
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// 依赖去重（保留首次出现的顺序），并移除对自身的依赖
    pub fn normalize(mut self) -> Self {
        self.dependencies = dedupe(&self.dependencies, &self.name);
        self.optional_dependencies = dedupe(&self.optional_dependencies, &self.name)
            .into_iter()
            .filter(|d| !self.dependencies.contains(d))
            .collect();
        self.provides = dedupe(&self.provides, "");
        self
    }
}

fn dedupe(items: &[String], exclude: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.iter()
        .filter(|item| item.as_str() != exclude && seen.insert(item.as_str()))
        .cloned()
        .collect()
}

/// 元数据构建器
pub struct MetadataBuilder {
    metadata: ModuleMetadata,
}

impl MetadataBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ModuleMetadata::new(name),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.metadata.dependencies.push(name.into());
        self
    }

    pub fn optional_dependency(mut self, name: impl Into<String>) -> Self {
        self.metadata.optional_dependencies.push(name.into());
        self
    }

    pub fn provides(mut self, capability: impl Into<String>) -> Self {
        self.metadata.provides.push(capability.into());
        self
    }

    pub fn requires_api_version(mut self, requirement: impl Into<String>) -> Self {
        self.metadata.requires_api_version = Some(requirement.into());
        self
    }

    pub fn sandboxed(mut self, sandboxed: bool) -> Self {
        self.metadata.sandboxed = sandboxed;
        self
    }

    pub fn reload_safe(mut self, reload_safe: bool) -> Self {
        self.metadata.reload_safe = reload_safe;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn config_schema(mut self, schema: Value) -> Self {
        self.metadata.config_schema = Some(schema);
        self
    }

    pub fn build(self) -> ModuleMetadata {
        self.metadata.normalize()
    }
}

/// 读取模块目录中的描述文件
///
/// 文件不存在时返回 `Ok(None)`；名称始终以目录名为准。
pub async fn read_descriptor(module_dir: &Path, name: &str) -> Result<Option<ModuleMetadata>> {
    let path = module_dir.join(DESCRIPTOR_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }

    let content = tokio::fs::read_to_string(&path).await?;
    let mut metadata: ModuleMetadata = serde_json::from_str(&content)?;
    metadata.name = name.to_string();
    Ok(Some(metadata.normalize()))
}

/// 验证问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// 问题类型
    pub issue_type: IssueType,
    /// 字段路径
    pub field_path: String,
    /// 问题描述
    pub message: String,
    /// 严重程度
    pub severity: IssueSeverity,
}

/// 问题类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueType {
    /// 依赖的模块不存在
    MissingDependency,
    /// 配置不符合 Schema
    SchemaMismatch,
    /// API 版本不兼容
    VersionIssue,
}

/// 问题严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    Error,
    Warning,
}

impl ValidationIssue {
    pub fn missing_dependency(module: &str, dependency: &str) -> Self {
        Self {
            issue_type: IssueType::MissingDependency,
            field_path: "dependencies".to_string(),
            message: format!("Module '{}' depends on unknown module '{}'", module, dependency),
            severity: IssueSeverity::Error,
        }
    }
}

/// 验证配置是否符合 Schema，返回所有不符合项
pub fn validate_config_against_schema(
    config: &HashMap<String, Value>,
    schema: &Value,
) -> Result<Vec<String>> {
    let compiled_schema = JSONSchema::compile(schema)
        .map_err(|e| SageError::config(&format!("Schema compilation failed: {}", e)))?;

    let instance = Value::Object(config.clone().into_iter().collect());
    let errors = match compiled_schema.validate(&instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    Ok(errors)
}

/// 检查模块要求的 API 版本是否与运行时兼容
pub fn check_api_compatibility(metadata: &ModuleMetadata) -> Result<()> {
    let Some(requirement) = &metadata.requires_api_version else {
        return Ok(());
    };

    let incompatible = || SageError::IncompatibleApiVersion {
        module: metadata.name.clone(),
        required: requirement.clone(),
        actual: API_VERSION.to_string(),
    };

    let req = VersionReq::parse(requirement).map_err(|_| incompatible())?;
    if req.matches(&API_VERSION) {
        Ok(())
    } else {
        Err(incompatible())
    }
}
