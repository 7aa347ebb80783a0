//! Sync Engine - 同步层组合根
//!
//! 参考: docs/SYNC_ARCHITECTURE.md §1
//!
//! 把拓扑、状态存储、重连编排、连接守卫粘成一台机器，并负责事件泵：
//! 订阅连接池的两条推流，把每个事件灌进流水线
//!
//! ```text
//!   ConnectionStatusEvent ──► TopologyResolver（级联闭包）
//!                               │
//!                               ▼
//!                             NodeStateStore（link_down 覆盖层）
//!                               │
//!                               ▼
//!                             ReconnectOrchestrator（排主节点）
//!
//!   NodeStateEvent ──────────► NodeStateStore（generation 门控合并）
//! ```
//!
//! 推流关闭不会 panic：引擎进入降级模式（不再有实时更新），由
//! `is_degraded()` 暴露给上层提示用户。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::guard::{ConnectionGuard, GuardError};
use crate::pool::{ConnectionPool, PoolError, ProbeOutcome};
use crate::reconnect::{ReconnectConfig, ReconnectEvent, ReconnectOrchestrator};
use crate::store::{NodeStateStore, StateSubscription, StoreError, DEFAULT_CHANNEL_CAPACITY};
use crate::topology::{TopologyError, TopologyResolver};
use crate::types::{
    ConnectionId, ConnectionStatus, ConnectionStatusEvent, NodeId, NodeReadiness, NodeState,
    NodeStateEvent,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reconnect: ReconnectConfig,
    /// 每节点状态广播通道容量
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// ============================================================================
// Introspection
// ============================================================================

/// 同步层运行时概览（诊断面板用）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub node_count: usize,
    pub readiness_counts: HashMap<NodeReadiness, usize>,
    pub link_down_count: usize,
    pub reconnect_tasks: usize,
    pub inflight_reconnects: usize,
    pub degraded: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("Node {0} is not bound to a connection")]
    NotBound(String),
}

impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct SyncEngine {
    pool: Arc<dyn ConnectionPool>,
    topology: Arc<TopologyResolver>,
    store: Arc<NodeStateStore>,
    orchestrator: Arc<ReconnectOrchestrator>,
    guard: ConnectionGuard,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    degraded: AtomicBool,
}

impl SyncEngine {
    pub fn new(pool: Arc<dyn ConnectionPool>, config: SyncConfig) -> Arc<Self> {
        let topology = Arc::new(TopologyResolver::new());
        let store = Arc::new(NodeStateStore::with_capacity(
            pool.clone(),
            config.channel_capacity,
        ));
        let orchestrator = Arc::new(ReconnectOrchestrator::new(
            pool.clone(),
            topology.clone(),
            config.reconnect,
        ));
        let guard = ConnectionGuard::new(store.clone());

        Arc::new(Self {
            pool,
            topology,
            store,
            orchestrator,
            guard,
            pump_handle: Mutex::new(None),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<NodeStateStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<TopologyResolver> {
        &self.topology
    }

    pub fn orchestrator(&self) -> &Arc<ReconnectOrchestrator> {
        &self.orchestrator
    }

    pub fn guard(&self) -> &ConnectionGuard {
        &self.guard
    }

    /// 重连进度事件出口（UI toast / 节点徽标）
    pub fn set_reconnect_event_sender(&self, tx: mpsc::UnboundedSender<ReconnectEvent>) {
        self.orchestrator.set_event_sender(tx);
    }

    // ------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------

    /// 启动事件泵：订阅两条推流并在后台任务里分发。
    /// 重复调用会替换旧泵（旧任务 abort）。
    pub fn spawn_event_pump(self: &Arc<Self>) {
        let mut status_rx = self.pool.subscribe_status();
        let mut node_rx = self.pool.subscribe_node_events();
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = status_rx.recv() => match status {
                        Ok(event) => engine.handle_status_event(event),
                        Err(RecvError::Lagged(n)) => {
                            // 状态流滞后可能错过 link_down，只能告警
                            warn!("Status stream lagged, {} events dropped", n);
                        }
                        Err(RecvError::Closed) => {
                            engine.mark_degraded("status");
                            break;
                        }
                    },
                    node_event = node_rx.recv() => match node_event {
                        Ok(event) => engine.handle_node_event(event),
                        Err(RecvError::Lagged(n)) => {
                            debug!("Node event stream lagged, {} events dropped", n);
                        }
                        Err(RecvError::Closed) => {
                            engine.mark_degraded("node event");
                            break;
                        }
                    },
                }
            }
        });

        if let Some(old) = self.pump_handle.lock().replace(handle) {
            old.abort();
        }
    }

    fn mark_degraded(&self, stream: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        error!(
            "Pool {} stream closed; sync engine degraded (no further live updates)",
            stream
        );
    }

    /// 连接级事件分发（事件泵调用，也可直接喂给引擎）
    pub fn handle_status_event(&self, event: ConnectionStatusEvent) {
        match event.status {
            ConnectionStatus::LinkDown => {
                let affected = self
                    .topology
                    .handle_link_down(&event.connection_id, &event.affected_children);
                if affected.is_empty() {
                    debug!(
                        "link_down for unknown connection {}, ignored",
                        event.connection_id
                    );
                    return;
                }
                info!(
                    "Connection {} link down, {} nodes affected",
                    event.connection_id,
                    affected.len()
                );
                for node_id in &affected {
                    self.store.mark_link_down(node_id);
                }
                // 只给级联主节点排重连；子节点等父链路恢复后补排
                self.orchestrator.schedule_reconnect(&affected[0]);
            }
            ConnectionStatus::Connected => match self.topology.get_node_id(&event.connection_id) {
                Some(node_id) => {
                    info!("Connection {} restored (node {})", event.connection_id, node_id);
                    self.orchestrator.handle_recovery(&node_id);
                }
                None => {
                    debug!(
                        "connected for unknown connection {}, ignored",
                        event.connection_id
                    );
                }
            },
            ConnectionStatus::Disconnected => match self.topology.get_node_id(&event.connection_id) {
                Some(node_id) => {
                    // 主动断开：撤任务、解绑；readiness 本身由节点事件流送达
                    self.orchestrator.cancel_reconnect(&node_id);
                    self.topology.unbind_node(&node_id);
                    self.topology.clear_link_down(&node_id);
                }
                None => {
                    debug!(
                        "disconnected for unknown connection {}, ignored",
                        event.connection_id
                    );
                }
            },
        }
    }

    /// 节点级事件分发：映射成增量后走 generation 门控
    pub fn handle_node_event(&self, event: NodeStateEvent) {
        let (node_id, generation, delta) = event.into_delta();
        self.store.apply_update(&node_id, delta, generation);
    }

    // ------------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------------

    pub fn add_root_node(&self, node_id: NodeId) -> Result<(), SyncError> {
        self.topology.insert_root(node_id.clone())?;
        self.store.track(&node_id);
        Ok(())
    }

    pub fn add_child_node(&self, parent_id: &NodeId, node_id: NodeId) -> Result<(), SyncError> {
        self.topology.insert_child(parent_id, node_id.clone())?;
        self.store.track(&node_id);
        Ok(())
    }

    /// 移除节点及其整棵子树，返回所有被移除的节点 id。
    ///
    /// 🔴 顺序是硬性约定：撤重连任务 → 关订阅/删状态 → 最后拆边和绑定。
    /// 反过来会让在途任务往已删除的表里写数据。
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Vec<NodeId>, SyncError> {
        let subtree = self.topology.subtree_ids(node_id)?;
        for id in &subtree {
            self.orchestrator.cancel_reconnect(id);
        }
        for id in &subtree {
            self.store.remove(id);
        }
        let removed = self.topology.remove_subtree(node_id)?;
        info!("Removed node {} ({} nodes total)", node_id, removed.len());
        Ok(removed)
    }

    /// 建立物理连接并绑定
    pub async fn connect_node(&self, node_id: &NodeId) -> Result<ConnectionId, SyncError> {
        if !self.topology.contains(node_id) {
            return Err(TopologyError::NodeNotFound(node_id.to_string()).into());
        }
        let connection_id = self.pool.connect(node_id).await?;
        if let Err(e) = self.topology.bind_connection(node_id, connection_id.clone()) {
            // connect 在途时节点被移除：新连接按孤儿释放，不能泄漏
            debug!("Node {} vanished during connect, releasing connection", node_id);
            if let Err(release_err) = self.pool.disconnect(node_id).await {
                warn!(
                    "Failed to release orphaned connection for {}: {}",
                    node_id, release_err
                );
            }
            return Err(e.into());
        }
        Ok(connection_id)
    }

    /// 用户主动断开
    pub async fn disconnect_node(&self, node_id: &NodeId) -> Result<(), SyncError> {
        self.orchestrator.cancel_reconnect(node_id);
        self.pool.disconnect(node_id).await?;
        self.topology.unbind_node(node_id);
        self.topology.clear_link_down(node_id);
        Ok(())
    }

    /// 按绑定连接做健康探测。
    ///
    /// 探测救活链路时，池侧会推正常事件流（connected + 新 generation），
    /// 状态收敛走标准管道，这里不做任何本地改写。
    pub async fn probe_node(&self, node_id: &NodeId) -> Result<ProbeOutcome, SyncError> {
        let connection_id = self
            .topology
            .connection_of(node_id)
            .ok_or_else(|| SyncError::NotBound(node_id.to_string()))?;
        Ok(self.pool.probe(&connection_id).await)
    }

    /// 手动重试（重连耗尽后的用户动作）
    pub fn retry_node(&self, node_id: &NodeId) -> bool {
        if !self.topology.contains(node_id) {
            return false;
        }
        self.orchestrator.schedule_reconnect(node_id)
    }

    /// 订阅节点状态并触发水合：订阅立即返回，快照在后台经 `>=` 门控汇入
    pub fn subscribe_node(&self, node_id: &NodeId) -> Result<StateSubscription, SyncError> {
        let subscription = self.store.subscribe(node_id)?;
        let store = self.store.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.get_snapshot(&node_id).await {
                debug!("Hydration for node {} skipped: {}", node_id, e);
            }
        });
        Ok(subscription)
    }

    /// 等待节点可操作（守卫透传）
    pub async fn wait_for_active(
        &self,
        node_id: &NodeId,
        timeout_ms: u64,
    ) -> Result<NodeState, SyncError> {
        Ok(self.guard.wait_for_active(node_id, timeout_ms).await?)
    }

    // ------------------------------------------------------------------
    // Introspection & teardown
    // ------------------------------------------------------------------

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            node_count: self.topology.node_count(),
            readiness_counts: self.store.readiness_counts(),
            link_down_count: self.topology.link_down_nodes().len(),
            reconnect_tasks: self.orchestrator.task_count(),
            inflight_reconnects: self.orchestrator.inflight_count(),
            degraded: self.is_degraded(),
        }
    }

    /// 停泵并撤掉所有重连任务
    pub fn shutdown(&self) {
        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
        self.orchestrator.cancel_all();
        info!("Sync engine shut down");
    }
}

// ============================================================================
// 测试
// ============================================================================
