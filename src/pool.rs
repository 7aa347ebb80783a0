//! Connection Pool Seam
//!
//! This module defines the boundary to the external connection-pool service
//! (the backend that owns real SSH connections).
//!
//! # Architecture
//!
//! The engine never touches transport. Everything it knows about the outside
//! world arrives through this trait:
//!
//! - request/response calls: `connect` / `disconnect` / `probe` / `fetch_snapshot`
//! - two push streams, subscribed as broadcast receivers:
//!   connection-level `ConnectionStatusEvent` and node-level `NodeStateEvent`
//!
//! Generation numbers are assigned by the pool; the engine only compares them.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{ConnectionId, ConnectionStatusEvent, NodeId, NodeStateEvent, NodeStateSnapshot};

// ============================================================================
// Pool Error
// ============================================================================

/// 连接池调用错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Node unknown to pool: {0}")]
    NodeUnknown(String),

    #[error("Pool call timed out: {0}")]
    Timeout(String),
}

impl serde::Serialize for PoolError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// Probe Outcome
// ============================================================================

/// 探活结果，区分不同的失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 连接正常（link_down 的连接探活成功后由池侧发事件恢复）
    Alive,
    /// 超时（可能是网络延迟，可重试）
    Timeout,
    /// 探活失败（物理连接断开，应走重连）
    Failed(String),
}

// ============================================================================
// ConnectionPool Trait
// ============================================================================

/// 外部连接池的抽象
///
/// 对象安全：引擎以 `Arc<dyn ConnectionPool>` 持有。
/// probe 发现 link_down 连接实际存活时，恢复同样走池侧推送的
/// generation-gated 事件，该接口上没有任何本地改状态的旁路。
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// 为节点建立（或重建）物理连接，返回新的 ConnectionId
    async fn connect(&self, node_id: &NodeId) -> Result<ConnectionId, PoolError>;

    /// 断开节点的物理连接
    async fn disconnect(&self, node_id: &NodeId) -> Result<(), PoolError>;

    /// 健康探测（按连接）
    async fn probe(&self, connection_id: &ConnectionId) -> ProbeOutcome;

    /// 节点状态快照（权威侧读取，携带 generation）
    async fn fetch_snapshot(&self, node_id: &NodeId) -> Result<NodeStateSnapshot, PoolError>;

    /// 订阅连接级状态事件
    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatusEvent>;

    /// 订阅节点级状态事件
    fn subscribe_node_events(&self) -> broadcast::Receiver<NodeStateEvent>;
}

// ============================================================================
// Scripted test pool
// ============================================================================
