//! 模块注册表和发现系统
//!
//! 扫描模块根目录发现候选模块，读取描述文件，维护依赖图和能力索引

use super::dependency::{DependencyGraph, GraphDump, LoadOrder};
use super::metadata::{read_descriptor, ModuleMetadata, ValidationIssue, ENTRY_FILES};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 注册表配置
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 以这些前缀开头的目录不视为模块
    pub excluded_prefixes: Vec<String>,
    /// 入口文件，目录中存在其一才是候选模块
    pub entry_files: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: vec!["_".to_string(), ".".to_string()],
            entry_files: ENTRY_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl RegistryConfig {
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// 模块注册表
pub struct ModuleRegistry {
    /// 模块根目录
    root: PathBuf,
    /// 已知模块的元数据
    modules: Arc<RwLock<HashMap<String, ModuleMetadata>>>,
    /// 模块目录（未记录时为 根目录/模块名）
    locations: Arc<RwLock<HashMap<String, PathBuf>>>,
    /// 依赖关系图
    graph: Arc<RwLock<DependencyGraph>>,
    /// 能力索引
    capability_index: Arc<RwLock<HashMap<String, Vec<String>>>>,
    /// 注册表配置
    config: RegistryConfig,
}

impl ModuleRegistry {
    /// 创建新的模块注册表
    pub fn new(root: impl Into<PathBuf>, config: RegistryConfig) -> Self {
        Self {
            root: root.into(),
            modules: Arc::new(RwLock::new(HashMap::new())),
            locations: Arc::new(RwLock::new(HashMap::new())),
            graph: Arc::new(RwLock::new(DependencyGraph::new())),
            capability_index: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 扫描模块根目录，返回按名称排序的模块列表
    ///
    /// 描述文件缺失或无法解析时使用默认元数据，扫描本身不会失败。
    pub async fn discover(&self) -> Vec<String> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Modules path {:?} is not readable: {}", self.root, e);
                return Vec::new();
            }
        };

        let mut discovered = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read entry in {:?}: {}", self.root, e);
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().to_string();
            if self.config.is_excluded(&name) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() || !self.has_entry_file(&path) {
                continue;
            }

            let metadata = match read_descriptor(&path, &name).await {
                Ok(Some(metadata)) => metadata,
                Ok(None) => {
                    debug!("Module '{}' has no descriptor, using defaults", name);
                    ModuleMetadata::new(&name)
                }
                Err(e) => {
                    warn!("Failed to load metadata for module '{}': {}", name, e);
                    ModuleMetadata::new(&name)
                }
            };

            self.locations.write().await.insert(name.clone(), path);
            self.register(metadata).await;
            discovered.push(name);
        }

        discovered.sort();
        info!("Discovered {} modules in {:?}", discovered.len(), self.root);
        discovered
    }

    fn has_entry_file(&self, dir: &Path) -> bool {
        self.config.entry_files.iter().any(|f| dir.join(f).is_file())
    }

    /// 注册或替换模块元数据
    pub async fn register(&self, metadata: ModuleMetadata) {
        let metadata = metadata.normalize();
        let name = metadata.name.clone();

        let previous = self.modules.write().await.insert(name.clone(), metadata.clone());

        self.graph.write().await.set_dependencies(&name, &metadata.dependencies);

        let mut index = self.capability_index.write().await;
        if let Some(previous) = previous {
            for capability in &previous.provides {
                if let Some(providers) = index.get_mut(capability) {
                    providers.retain(|p| p != &name);
                }
            }
            index.retain(|_, providers| !providers.is_empty());
        }
        for capability in &metadata.provides {
            let providers = index.entry(capability.clone()).or_default();
            if !providers.contains(&name) {
                providers.push(name.clone());
            }
        }

        debug!("Module '{}' registered with {} dependencies", name, metadata.dependencies.len());
    }

    /// 获取模块元数据
    pub async fn get_metadata(&self, name: &str) -> Option<ModuleMetadata> {
        self.modules.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    /// 已知模块（按名称排序）
    pub async fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 模块所在目录
    pub async fn module_dir(&self, name: &str) -> PathBuf {
        self.locations.read().await
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.root.join(name))
    }

    /// 检查依赖是否都存在
    ///
    /// 每条指向未知模块的必需依赖产生一个问题，没有问题的模块不出现在结果中。
    pub async fn validate_dependencies(&self) -> HashMap<String, Vec<ValidationIssue>> {
        let modules = self.modules.read().await;
        let mut report = HashMap::new();

        for (name, metadata) in modules.iter() {
            let issues: Vec<ValidationIssue> = metadata.dependencies.iter()
                .filter(|dep| !modules.contains_key(dep.as_str()))
                .map(|dep| ValidationIssue::missing_dependency(name, dep))
                .collect();
            if !issues.is_empty() {
                report.insert(name.clone(), issues);
            }
        }
        report
    }

    /// 提供某能力的模块
    pub async fn find_by_capability(&self, capability: &str) -> Vec<String> {
        self.capability_index.read().await
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn dependents(&self, name: &str) -> Vec<String> {
        self.graph.read().await.dependents(name)
    }

    pub async fn transitive_dependents(&self, name: &str) -> Vec<String> {
        self.graph.read().await.transitive_dependents(name)
    }

    /// 计算加载顺序
    pub async fn resolve_load_order(&self, requested: &[String]) -> LoadOrder {
        self.graph.read().await.resolve_load_order(requested)
    }

    /// 计算卸载顺序
    pub async fn unload_order(&self, requested: &[String]) -> LoadOrder {
        self.graph.read().await.unload_order(requested)
    }

    /// 依赖图快照
    pub async fn graph(&self) -> GraphDump {
        self.graph.read().await.dump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::metadata::{IssueType, MetadataBuilder, DESCRIPTOR_FILE};

    async fn module_dir(root: &Path, name: &str, entry: &str, descriptor: Option<&str>) {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(entry), "// module").await.unwrap();
        if let Some(descriptor) = descriptor {
            tokio::fs::write(dir.join(DESCRIPTOR_FILE), descriptor).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_discover_filters_candidates() {
        let root = tempfile::tempdir().unwrap();
        module_dir(root.path(), "voice", "mod.rs", Some(r#"{"provides": ["speech"]}"#)).await;
        module_dir(root.path(), "nlp", "lib.rs", None).await;
        module_dir(root.path(), "calendar", "mod.rs", Some(r#"{"dependencies": ["nlp", "voice"]}"#)).await;
        module_dir(root.path(), "broken", "mod.rs", Some("{ not json")).await;
        module_dir(root.path(), "_private", "mod.rs", None).await;
        module_dir(root.path(), ".cache", "mod.rs", None).await;
        module_dir(root.path(), "docs", "README.md", None).await;
        tokio::fs::write(root.path().join("stray.rs"), "").await.unwrap();

        let registry = ModuleRegistry::new(root.path(), RegistryConfig::default());
        let names = registry.discover().await;
        assert_eq!(names, vec!["broken", "calendar", "nlp", "voice"]);

        let broken = registry.get_metadata("broken").await.unwrap();
        assert_eq!(broken, ModuleMetadata::new("broken"));

        let calendar = registry.get_metadata("calendar").await.unwrap();
        assert_eq!(calendar.dependencies, vec!["nlp".to_string(), "voice".to_string()]);
        assert_eq!(registry.dependents("voice").await, vec!["calendar".to_string()]);
        assert_eq!(registry.find_by_capability("speech").await, vec!["voice".to_string()]);
        assert_eq!(registry.module_dir("nlp").await, root.path().join("nlp"));
    }

    #[tokio::test]
    async fn test_missing_root_yields_nothing() {
        let root = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new(root.path().join("absent"), RegistryConfig::default());
        assert!(registry.discover().await.is_empty());
    }

    #[tokio::test]
    async fn test_validate_dependencies_reports_dangling_edges() {
        let registry = ModuleRegistry::new("modules", RegistryConfig::default());
        registry.register(MetadataBuilder::new("calendar").dependency("nlp").dependency("db").build()).await;
        registry.register(MetadataBuilder::new("nlp").build()).await;
        registry.register(MetadataBuilder::new("voice").dependency("audio").build()).await;

        let report = registry.validate_dependencies().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report["calendar"].len(), 1);
        assert_eq!(report["calendar"][0].issue_type, IssueType::MissingDependency);
        assert!(report["calendar"][0].message.contains("'db'"));
        assert_eq!(report["voice"].len(), 1);

        registry.register(MetadataBuilder::new("db").build()).await;
        registry.register(MetadataBuilder::new("audio").build()).await;
        assert!(registry.validate_dependencies().await.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_edges_and_capabilities() {
        let registry = ModuleRegistry::new("modules", RegistryConfig::default());
        registry.register(MetadataBuilder::new("calendar").dependency("nlp").provides("schedule").build()).await;
        registry.register(MetadataBuilder::new("calendar").dependency("voice").provides("reminder").build()).await;

        assert!(registry.dependents("nlp").await.is_empty());
        assert_eq!(registry.dependents("voice").await, vec!["calendar".to_string()]);
        assert!(registry.find_by_capability("schedule").await.is_empty());
        assert_eq!(registry.find_by_capability("reminder").await, vec!["calendar".to_string()]);
    }
}
