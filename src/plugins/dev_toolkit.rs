//! 模块开发工具
//!
//! 在模块根目录下生成新模块的骨架：描述文件和实现 `Module` 的入口文件

use super::metadata::{ModuleMetadata, DESCRIPTOR_FILE};
use super::registry::RegistryConfig;
use crate::{Result, SageError};
use std::path::{Path, PathBuf};
use tracing::info;

/// 模板选项
#[derive(Debug, Clone, Default)]
pub struct TemplateOptions {
    /// 模块描述
    pub description: String,
    /// 必需依赖
    pub dependencies: Vec<String>,
    /// 订阅的事件名称，例如 `voice.command`
    pub events: Vec<String>,
    /// 是否标记为需要沙箱检查
    pub sandboxed: bool,
}

/// 检查模块名称是否可以作为目录名和 Rust 标识符
pub fn validate_module_name(name: &str, registry: &RegistryConfig) -> Result<()> {
    if name.is_empty() {
        return Err(SageError::template("Module name must not be empty"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SageError::template(&format!(
            "Module name '{}' may only contain ASCII letters, digits and '_'", name
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(SageError::template(&format!("Module name '{}' must not start with a digit", name)));
    }
    if registry.is_excluded(name) {
        return Err(SageError::template(&format!(
            "Module name '{}' uses a prefix that discovery skips", name
        )));
    }
    Ok(())
}

/// 创建模块模板，返回模块目录
///
/// 目录已存在时报错，不会覆盖任何文件。
pub async fn create_module_template(
    modules_path: &Path,
    name: &str,
    options: &TemplateOptions,
) -> Result<PathBuf> {
    validate_module_name(name, &RegistryConfig::default())?;

    let module_dir = modules_path.join(name);
    if tokio::fs::try_exists(&module_dir).await? {
        return Err(SageError::template(&format!(
            "Module directory {:?} already exists", module_dir
        )));
    }
    tokio::fs::create_dir_all(&module_dir).await?;

    let mut metadata = ModuleMetadata::new(name);
    metadata.description = options.description.clone();
    metadata.dependencies = options.dependencies.clone();
    metadata.sandboxed = options.sandboxed;
    let metadata = metadata.normalize();

    let descriptor = serde_json::to_string_pretty(&metadata)?;
    tokio::fs::write(module_dir.join(DESCRIPTOR_FILE), descriptor).await?;
    tokio::fs::write(module_dir.join("mod.rs"), render_entry(name, options)).await?;

    info!("Created module template '{}' in {:?}", name, module_dir);
    Ok(module_dir)
}

fn type_name(name: &str) -> String {
    let mut out = String::new();
    for part in name.split('_').filter(|p| !p.is_empty()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out.push_str("Module");
    out
}

fn render_entry(name: &str, options: &TemplateOptions) -> String {
    let type_name = type_name(name);
    let events = options.events.iter()
        .map(|e| format!("EventType::from_name(\"{}\")", e))
        .collect::<Vec<_>>()
        .join(", ");
    let description = if options.description.is_empty() {
        format!("{} 模块", name)
    } else {
        options.description.clone()
    };

    format!(
        r#"//! {description}

use async_trait::async_trait;
use sage_runtime::{{Event, EventType, Module, ModuleContext, Result}};
use serde_json::Value;

pub struct {type_name} {{
    context: ModuleContext,
    loaded: bool,
}}

#[async_trait]
impl Module for {type_name} {{
    fn name(&self) -> &str {{
        "{name}"
    }}

    async fn initialize(&mut self) -> Result<bool> {{
        self.context.logger.info("initialized");
        self.loaded = true;
        Ok(true)
    }}

    async fn shutdown(&mut self) -> Result<()> {{
        self.loaded = false;
        Ok(())
    }}

    async fn handle_event(&mut self, event: &Event) -> Result<Option<Value>> {{
        self.context.logger.debug(&format!("received {{}}", event.event_type));
        Ok(None)
    }}

    fn is_loaded(&self) -> bool {{
        self.loaded
    }}

    fn subscribed_events(&self) -> Vec<EventType> {{
        vec![{events}]
    }}
}}

pub fn create(context: ModuleContext) -> Box<dyn Module> {{
    Box::new({type_name} {{ context, loaded: false }})
}}
"#
    )
}
