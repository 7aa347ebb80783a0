//! Topology Resolver - 连接树的结构层
//!
//! 维护两个 ID 空间之间的映射与树形邻接结构:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  NodeId 空间（逻辑位置，重连后稳定）                          │
//! │    root ── child-a ── grandchild                            │
//! │         └─ child-b                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ConnectionId 空间（物理连接实例，重连后更替）                │
//! │    conn-7 ─→ root     conn-12 ─→ child-a   ...              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! 连接级事件只携带 ConnectionId；本模块负责反查节点并沿树边计算
//! 波及范围（cascade）。连接池的 affected_children 提示可能不完整，
//! 树遍历才是权威闭包。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{ConnectionId, NodeId};

// ============================================================================
// 核心数据结构
// ============================================================================

/// 拓扑节点 - 邻接表的基本单元
#[derive(Debug, Clone)]
pub struct TopologyNode {
    /// 唯一标识
    pub id: NodeId,

    /// 父节点 ID（None = 根节点）
    pub parent_id: Option<NodeId>,

    /// 子节点 ID 列表
    pub children_ids: Vec<NodeId>,

    /// 树深度（0 = 直连，1 = 一级跳板，...）
    pub depth: u32,

    /// 创建时间
    pub created_at: chrono::DateTime<Utc>,
}

struct TopologyInner {
    /// 所有节点（ID -> Node）
    nodes: HashMap<NodeId, TopologyNode>,

    /// 根节点 ID 列表（depth=0 的节点）
    root_ids: Vec<NodeId>,

    /// 正挂在节点上的物理连接
    node_to_conn: HashMap<NodeId, ConnectionId>,

    /// 反查表：连接级事件只知道 ConnectionId
    conn_to_node: HashMap<ConnectionId, NodeId>,

    /// 当前处于 link_down 的节点集合
    link_down: HashSet<NodeId>,
}

impl TopologyInner {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root_ids: Vec::new(),
            node_to_conn: HashMap::new(),
            conn_to_node: HashMap::new(),
            link_down: HashSet::new(),
        }
    }

    fn remove_recursive(&mut self, node_id: &NodeId, removed_ids: &mut Vec<NodeId>) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        let children_ids = node.children_ids.clone();
        let parent_id = node.parent_id.clone();

        // 先递归移除子节点
        for child_id in children_ids {
            self.remove_recursive(&child_id, removed_ids);
        }

        // 从父节点的 children_ids 中摘除
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.children_ids.retain(|id| id != node_id);
            }
        } else {
            self.root_ids.retain(|id| id != node_id);
        }

        self.nodes.remove(node_id);
        self.link_down.remove(node_id);
        if let Some(conn) = self.node_to_conn.remove(node_id) {
            self.conn_to_node.remove(&conn);
        }
        removed_ids.push(node_id.clone());
    }

    /// 广度优先收集 node_id 及其全部后代（每个节点至多一次）
    fn collect_subtree(&self, node_id: &NodeId, visited: &mut HashSet<NodeId>, out: &mut Vec<NodeId>) {
        let mut queue = VecDeque::new();
        queue.push_back(node_id.clone());
        while let Some(current) = queue.pop_front() {
            if !self.nodes.contains_key(&current) || !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for child in &node.children_ids {
                    queue.push_back(child.clone());
                }
            }
            out.push(current);
        }
    }

    fn is_last_child(&self, node: &TopologyNode) -> bool {
        if let Some(parent_id) = &node.parent_id {
            if let Some(parent) = self.nodes.get(parent_id) {
                return parent.children_ids.last() == Some(&node.id);
            }
        }
        // 根节点也检查是否是最后一个
        self.root_ids.last() == Some(&node.id)
    }

    fn flatten_recursive(&self, node_id: &NodeId, result: &mut Vec<FlatNode>) {
        if let Some(node) = self.nodes.get(node_id) {
            result.push(FlatNode {
                id: node.id.clone(),
                parent_id: node.parent_id.clone(),
                depth: node.depth,
                connection_id: self.node_to_conn.get(&node.id).cloned(),
                link_down: self.link_down.contains(&node.id),
                has_children: !node.children_ids.is_empty(),
                is_last_child: self.is_last_child(node),
            });
            for child_id in &node.children_ids {
                self.flatten_recursive(child_id, result);
            }
        }
    }
}

// ============================================================================
// Topology Resolver
// ============================================================================

/// 拓扑解析器 - 树结构 + 双向连接绑定 + link_down 集合
///
/// 结构仅由显式的增删操作改变（add/remove/clear），状态更新永远不会
/// 隐式改树。内部用一把 RwLock 保护，临界区都是纯内存操作。
pub struct TopologyResolver {
    inner: RwLock<TopologyInner>,
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyResolver {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TopologyInner::new()),
        }
    }

    /// 添加根节点（depth=0）
    pub fn insert_root(&self, node_id: NodeId) -> Result<(), TopologyError> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&node_id) {
            return Err(TopologyError::DuplicateNode(node_id.to_string()));
        }
        let node = TopologyNode {
            id: node_id.clone(),
            parent_id: None,
            children_ids: Vec::new(),
            depth: 0,
            created_at: Utc::now(),
        };
        inner.nodes.insert(node_id.clone(), node);
        inner.root_ids.push(node_id);
        Ok(())
    }

    /// 在父节点下添加子节点
    pub fn insert_child(&self, parent_id: &NodeId, node_id: NodeId) -> Result<(), TopologyError> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&node_id) {
            return Err(TopologyError::DuplicateNode(node_id.to_string()));
        }
        let depth = inner
            .nodes
            .get(parent_id)
            .ok_or_else(|| TopologyError::NodeNotFound(parent_id.to_string()))?
            .depth
            + 1;

        let node = TopologyNode {
            id: node_id.clone(),
            parent_id: Some(parent_id.clone()),
            children_ids: Vec::new(),
            depth,
            created_at: Utc::now(),
        };
        inner.nodes.insert(node_id.clone(), node);

        // 更新父节点的 children_ids
        if let Some(parent) = inner.nodes.get_mut(parent_id) {
            parent.children_ids.push(node_id);
        }
        Ok(())
    }

    /// 移除节点及其全部后代，返回被移除的 ID（子节点在前）
    ///
    /// 同时清掉这些节点的连接绑定与 link_down 标记。
    pub fn remove_subtree(&self, node_id: &NodeId) -> Result<Vec<NodeId>, TopologyError> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(node_id) {
            return Err(TopologyError::NodeNotFound(node_id.to_string()));
        }
        let mut removed_ids = Vec::new();
        inner.remove_recursive(node_id, &mut removed_ids);
        Ok(removed_ids)
    }

    /// 记录"节点当前由哪个物理连接实现"
    ///
    /// 一个节点同一时刻只绑定一个连接；重连成功后用新 ConnectionId
    /// 重新绑定，返回被替换下来的旧连接（如有）。
    pub fn bind_connection(
        &self,
        node_id: &NodeId,
        connection_id: ConnectionId,
    ) -> Result<Option<ConnectionId>, TopologyError> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(node_id) {
            return Err(TopologyError::NodeNotFound(node_id.to_string()));
        }
        let old = inner.node_to_conn.insert(node_id.clone(), connection_id.clone());
        if let Some(old_conn) = &old {
            inner.conn_to_node.remove(old_conn);
        }
        inner.conn_to_node.insert(connection_id, node_id.clone());
        Ok(old)
    }

    /// 解除节点的连接绑定，返回旧连接
    pub fn unbind_node(&self, node_id: &NodeId) -> Option<ConnectionId> {
        let mut inner = self.inner.write();
        let old = inner.node_to_conn.remove(node_id);
        if let Some(old_conn) = &old {
            inner.conn_to_node.remove(old_conn);
        }
        old
    }

    /// 反查：连接级事件处理入口
    pub fn get_node_id(&self, connection_id: &ConnectionId) -> Option<NodeId> {
        self.inner.read().conn_to_node.get(connection_id).cloned()
    }

    /// 节点当前绑定的连接
    pub fn connection_of(&self, node_id: &NodeId) -> Option<ConnectionId> {
        self.inner.read().node_to_conn.get(node_id).cloned()
    }

    /// 计算一次连接失联的波及范围，并把全部成员标记为 link_down
    ///
    /// 闭包 = 从失联连接对应节点出发的 BFS 子树，并上池侧提示
    /// （affected_children 映射到的节点及其子树）。提示只是优化：
    /// 为空或不完整时树遍历仍然给出权威结果。每个节点恰好出现一次。
    pub fn handle_link_down(
        &self,
        connection_id: &ConnectionId,
        affected_children: &[ConnectionId],
    ) -> Vec<NodeId> {
        let mut inner = self.inner.write();
        let mut visited = HashSet::new();
        let mut affected = Vec::new();

        if let Some(primary) = inner.conn_to_node.get(connection_id).cloned() {
            inner.collect_subtree(&primary, &mut visited, &mut affected);
        }
        for child_conn in affected_children {
            if let Some(node_id) = inner.conn_to_node.get(child_conn).cloned() {
                inner.collect_subtree(&node_id, &mut visited, &mut affected);
            }
        }

        for node_id in &affected {
            inner.link_down.insert(node_id.clone());
        }
        affected
    }

    /// 节点恢复后摘除 link_down 标记，返回之前是否在集合里
    pub fn clear_link_down(&self, node_id: &NodeId) -> bool {
        self.inner.write().link_down.remove(node_id)
    }

    pub fn is_link_down(&self, node_id: &NodeId) -> bool {
        self.inner.read().link_down.contains(node_id)
    }

    pub fn link_down_nodes(&self) -> Vec<NodeId> {
        self.inner.read().link_down.iter().cloned().collect()
    }

    /// 节点的直接子节点中仍处于 link_down 的部分（父恢复后补连用）
    pub fn link_down_children(&self, node_id: &NodeId) -> Vec<NodeId> {
        let inner = self.inner.read();
        match inner.nodes.get(node_id) {
            Some(node) => node
                .children_ids
                .iter()
                .filter(|id| inner.link_down.contains(*id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// 获取节点的所有祖先 ID（从父到根）
    pub fn ancestors(&self, node_id: &NodeId) -> Vec<NodeId> {
        let inner = self.inner.read();
        let mut ancestors = Vec::new();
        let mut current = node_id.clone();
        while let Some(node) = inner.nodes.get(&current) {
            match &node.parent_id {
                Some(parent_id) => {
                    ancestors.push(parent_id.clone());
                    current = parent_id.clone();
                }
                None => break,
            }
        }
        ancestors
    }

    /// 获取从根到目标节点的完整路径
    pub fn path_to_node(&self, node_id: &NodeId) -> Vec<NodeId> {
        if !self.contains(node_id) {
            return Vec::new();
        }
        let mut path = self.ancestors(node_id);
        path.reverse(); // 从根到目标
        path.push(node_id.clone());
        path
    }

    /// 获取节点的所有后代 ID（广度优先，不含自身）
    pub fn descendants(&self, node_id: &NodeId) -> Vec<NodeId> {
        let inner = self.inner.read();
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        inner.collect_subtree(node_id, &mut visited, &mut out);
        // collect_subtree 含自身，去掉第一个
        if !out.is_empty() {
            out.remove(0);
        }
        out
    }

    /// 节点自身 + 全部后代（移除流程先用它算出成员，再逐个清理）
    pub fn subtree_ids(&self, node_id: &NodeId) -> Result<Vec<NodeId>, TopologyError> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(node_id) {
            return Err(TopologyError::NodeNotFound(node_id.to_string()));
        }
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        inner.collect_subtree(node_id, &mut visited, &mut out);
        Ok(out)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<TopologyNode> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.inner.read().nodes.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.inner.read().root_ids.clone()
    }

    /// 扁平化输出（用于前端渲染）
    pub fn flatten(&self) -> Vec<FlatNode> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        for root_id in inner.root_ids.clone() {
            inner.flatten_recursive(&root_id, &mut result);
        }
        result
    }

    /// 清空整棵树（重建前调用）
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = TopologyInner::new();
    }
}

// ============================================================================
// 扁平化节点（用于前端）
// ============================================================================

/// 扁平化节点 - 用于前端渲染
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatNode {
    /// 节点 ID
    pub id: NodeId,
    /// 父节点 ID
    pub parent_id: Option<NodeId>,
    /// 树深度
    pub depth: u32,
    /// 当前绑定的连接 ID
    pub connection_id: Option<ConnectionId>,
    /// 是否处于 link_down
    pub link_down: bool,
    /// 是否有子节点
    pub has_children: bool,
    /// 是否是最后一个子节点
    pub is_last_child: bool,
}

// ============================================================================
// 错误类型
// ============================================================================

/// 拓扑错误
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum TopologyError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already exists: {0}")]
    DuplicateNode(String),
}

// ============================================================================
// 测试
// ============================================================================
