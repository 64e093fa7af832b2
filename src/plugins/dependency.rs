//! 模块依赖关系图与加载顺序解析
//!
//! 正向边记录模块依赖谁，反向边记录谁依赖该模块，两者始终互为转置。
//! 加载顺序使用 Kahn 拓扑排序，只考虑请求集合内部的依赖。

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 -> 依赖的模块（声明顺序）
    forward: HashMap<String, Vec<String>>,
    /// 反向边：模块 -> 依赖它的模块
    reverse: HashMap<String, Vec<String>>,
}

/// 依赖图快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphDump {
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub dependents: BTreeMap<String, Vec<String>>,
}

/// 加载顺序
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOrder {
    /// 模块顺序
    pub order: Vec<String>,
    /// 请求集合内存在循环依赖，`order` 为按名称排序的回退结果
    pub cyclic: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点
    pub fn add_module(&mut self, name: &str) {
        self.forward.entry(name.to_string()).or_default();
        self.reverse.entry(name.to_string()).or_default();
    }

    /// 添加单条依赖：`module` 依赖 `dependency`
    pub fn add_dependency(&mut self, module: &str, dependency: &str) {
        self.add_module(module);
        self.add_module(dependency);

        if let Some(deps) = self.forward.get_mut(module) {
            if !deps.iter().any(|d| d == dependency) {
                deps.push(dependency.to_string());
            }
        }
        if let Some(dependents) = self.reverse.get_mut(dependency) {
            if !dependents.iter().any(|d| d == module) {
                dependents.push(module.to_string());
            }
        }
    }

    /// 用新的依赖列表替换模块原有的出边
    pub fn set_dependencies(&mut self, module: &str, dependencies: &[String]) {
        self.add_module(module);

        let old = self.forward.insert(module.to_string(), Vec::new()).unwrap_or_default();
        for dependency in old {
            if let Some(dependents) = self.reverse.get_mut(&dependency) {
                dependents.retain(|d| d != module);
            }
        }

        for dependency in dependencies {
            self.add_dependency(module, dependency);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.forward.contains_key(name)
    }

    /// 直接依赖
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.forward.get(name).cloned().unwrap_or_default()
    }

    /// 直接依赖方
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.reverse.get(name).cloned().unwrap_or_default()
    }

    /// 所有直接或间接依赖该模块的模块（广度优先，不含自身）
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        visited.insert(name.to_string());
        let mut queue: VecDeque<String> = self.dependents(name).into();
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            queue.extend(self.dependents(&current));
            result.push(current);
        }
        result
    }

    /// 计算请求集合的加载顺序
    ///
    /// 同一轮可加载的模块按请求中的出现顺序排列。出现循环时退回到按名称排序，
    /// 并通过 `cyclic` 标记，不会返回错误。
    pub fn resolve_load_order(&self, requested: &[String]) -> LoadOrder {
        let mut seen = HashSet::new();
        let nodes: Vec<&String> = requested.iter()
            .filter(|name| seen.insert(name.as_str()))
            .collect();
        let in_set: HashSet<&str> = nodes.iter().map(|n| n.as_str()).collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &nodes {
            let deps = self.forward.get(node.as_str());
            let count = deps.map_or(0, |deps| {
                deps.iter().filter(|d| in_set.contains(d.as_str())).count()
            });
            in_degree.insert(node.as_str(), count);

            for dep in deps.into_iter().flatten() {
                if in_set.contains(dep.as_str()) {
                    dependents.entry(dep.as_str()).or_default().push(node.as_str());
                }
            }
        }

        let mut queue: VecDeque<&str> = nodes.iter()
            .map(|n| n.as_str())
            .filter(|n| in_degree.get(n).copied() == Some(0))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() < nodes.len() {
            let mut fallback: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
            fallback.sort();
            tracing::warn!("Cyclic dependency among requested modules, falling back to name order");
            return LoadOrder { order: fallback, cyclic: true };
        }

        LoadOrder { order, cyclic: false }
    }

    /// 卸载顺序：加载顺序的逆序
    pub fn unload_order(&self, requested: &[String]) -> LoadOrder {
        let mut load_order = self.resolve_load_order(requested);
        load_order.order.reverse();
        load_order
    }

    /// 导出图快照
    pub fn dump(&self) -> GraphDump {
        GraphDump {
            dependencies: self.forward.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            dependents: self.reverse.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}
