//! 模块加载器
//!
//! 每个模块包向加载器登记一个构造函数（工厂），加载器把模块名解析为带版本号的
//! 模块类型句柄。强制解析总会产生新的版本号，已加载的旧实例不受影响。
//!
//! 对声明 `sandboxed` 的模块，解析前会扫描其源码目录中的高风险调用。
//! 这只是针对误用的静态检查，不构成隔离边界。

use super::core::{Module, ModuleContext, ModuleFactory};
use super::metadata::ModuleMetadata;
use crate::{Result, SageError};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 沙箱检查中视为高风险的源码片段
pub const RISKY_PATTERNS: &[&str] = &[
    "std::process",
    "Command::new",
    "std::env::set_var",
    "std::env::remove_var",
    "libc::",
    "libloading",
    "std::mem::transmute",
    "*mut ",
    "unsafe ",
    "extern \"C\"",
    "std::fs::remove",
];

/// 加载器配置
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// 是否对 sandboxed 模块执行源码检查
    pub sandbox_enabled: bool,
    /// 源码检查策略
    pub sandbox: SandboxPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            sandbox: SandboxPolicy::default(),
        }
    }
}

/// 源码检查策略
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// 高风险片段
    pub patterns: Vec<String>,
    /// 允许出现的片段（从 patterns 中豁免）
    pub allow_list: Vec<String>,
    /// 需要扫描的文件扩展名
    pub extensions: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            patterns: RISKY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            allow_list: Vec::new(),
            extensions: vec!["rs".to_string()],
        }
    }
}

impl SandboxPolicy {
    fn active_patterns(&self) -> Vec<String> {
        self.patterns.iter()
            .filter(|p| !self.allow_list.contains(p))
            .cloned()
            .collect()
    }
}

/// 单条检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxFinding {
    pub file: PathBuf,
    pub line: usize,
    pub pattern: String,
}

impl fmt::Display for SandboxFinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.pattern)
    }
}

/// 源码检查报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct SandboxReport {
    pub files_scanned: usize,
    pub findings: Vec<SandboxFinding>,
}

impl SandboxReport {
    pub fn passed(&self) -> bool {
        self.findings.is_empty()
    }
}

/// 扫描模块目录中的源码
///
/// 目录不存在时视为通过。
pub async fn check_sandbox(module_dir: &Path, policy: &SandboxPolicy) -> Result<SandboxReport> {
    let files = collect_source_files(module_dir, &policy.extensions).await?;
    let patterns = policy.active_patterns();
    let files_scanned = files.len();

    let mut findings = tokio::task::spawn_blocking(move || {
        files.par_iter()
            .flat_map_iter(|path| scan_file(path, &patterns))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| SageError::module(&format!("Sandbox scan task failed: {}", e)))?;

    findings.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
    Ok(SandboxReport { files_scanned, findings })
}

async fn collect_source_files(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !tokio::fs::try_exists(root).await? {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| extensions.iter().any(|e| e == ext))
            {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn scan_file(path: &Path, patterns: &[String]) -> Vec<SandboxFinding> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for (index, line) in content.lines().enumerate() {
        for pattern in patterns {
            if line.contains(pattern.as_str()) {
                findings.push(SandboxFinding {
                    file: path.to_path_buf(),
                    line: index + 1,
                    pattern: pattern.clone(),
                });
            }
        }
    }
    findings
}

/// 带版本号的模块类型句柄
#[derive(Clone)]
pub struct ModuleType {
    pub name: String,
    /// 单调递增的版本号
    pub version: u64,
    factory: ModuleFactory,
}

impl ModuleType {
    /// 用注入的上下文构造模块实例
    pub fn instantiate(&self, context: ModuleContext) -> Box<dyn Module> {
        (self.factory)(context)
    }
}

impl fmt::Debug for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleType")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// 模块加载器
pub struct ModuleLoader {
    /// 已登记的工厂
    catalog: RwLock<HashMap<String, ModuleFactory>>,
    /// 已解析的模块类型
    resolved: RwLock<HashMap<String, ModuleType>>,
    next_version: AtomicU64,
    /// 加载器配置
    config: LoaderConfig,
}

impl ModuleLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            catalog: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// 登记模块工厂，重复登记会替换旧工厂（下次强制解析时生效）
    pub fn register_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn(ModuleContext) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.catalog.write().insert(name.to_string(), Arc::new(factory));
        debug!("Factory registered for module '{}'", name);
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.catalog.read().contains_key(name)
    }

    /// 解析模块类型
    ///
    /// 非强制时优先返回缓存的句柄；否则从工厂目录重新解析并分配新版本号。
    pub async fn load_type(
        &self,
        name: &str,
        metadata: &ModuleMetadata,
        module_dir: &Path,
        force: bool,
    ) -> Result<ModuleType> {
        if !force {
            if let Some(cached) = self.resolved.read().get(name) {
                return Ok(cached.clone());
            }
        }

        let factory = self.catalog.read()
            .get(name)
            .cloned()
            .ok_or_else(|| SageError::NoImplementationFound { module: name.to_string() })?;

        if metadata.sandboxed && self.config.sandbox_enabled {
            let report = check_sandbox(module_dir, &self.config.sandbox).await?;
            if !report.passed() {
                warn!("Module '{}' failed sandbox check with {} findings", name, report.findings.len());
                return Err(SageError::SandboxViolation {
                    module: name.to_string(),
                    violations: report.findings.iter().map(|f| f.to_string()).collect(),
                });
            }
            debug!("Module '{}' passed sandbox check ({} files)", name, report.files_scanned);
        }

        let module_type = ModuleType {
            name: name.to_string(),
            version: self.next_version.fetch_add(1, Ordering::SeqCst) + 1,
            factory,
        };
        self.resolved.write().insert(name.to_string(), module_type.clone());
        info!("Resolved module '{}' as version {}", name, module_type.version);
        Ok(module_type)
    }

    /// 丢弃缓存的模块类型
    pub fn invalidate(&self, name: &str) -> bool {
        self.resolved.write().remove(name).is_some()
    }

    /// 当前缓存的版本号
    pub fn cached_version(&self, name: &str) -> Option<u64> {
        self.resolved.read().get(name).map(|t| t.version)
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}
