//! 连接守卫：操作前的事件驱动等待
//!
//! 参考: docs/SYNC_ARCHITECTURE.md §6
//!
//! 终端 I/O、SFTP 列目录这类操作要求节点处于可操作状态。守卫把
//! "等到节点可用" 做成一次订阅 + select，全程零轮询：
//!
//! - 节点已可操作 → 立即返回
//! - 节点处于过渡态（connecting / link_down / reconnecting / disconnecting）
//!   → 订阅状态变更，直到可操作、终态或超时
//! - 节点不存在 → NotFound；终态 → Disconnected；到点 → Timeout
//!
//! 订阅在所有返回路径上随 RAII 释放，不会留下悬挂回调。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::store::NodeStateStore;
use crate::types::{NodeId, NodeState};

// ============================================================================
// 错误
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Timed out after {waited_ms}ms waiting for node {node_id}")]
    Timeout { node_id: String, waited_ms: u64 },

    #[error("Node {0} is disconnected")]
    Disconnected(String),
}

impl serde::Serialize for GuardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// 守卫
// ============================================================================

/// 事件驱动的节点可用性守卫
pub struct ConnectionGuard {
    store: Arc<NodeStateStore>,
}

impl ConnectionGuard {
    pub fn new(store: Arc<NodeStateStore>) -> Self {
        Self { store }
    }

    /// 等待节点进入可操作状态（active / idle），最多 `timeout_ms` 毫秒。
    ///
    /// 语义（settle once, clean up always）：
    /// - 恰好以一种方式结束：Ok(最新状态) / NotFound / Disconnected / Timeout
    /// - 无论哪条路径，订阅都在返回前释放
    ///
    /// 已处于终态（disconnected / error）的节点立即失败，不消耗超时。
    pub async fn wait_for_active(
        &self,
        node_id: &NodeId,
        timeout_ms: u64,
    ) -> Result<NodeState, GuardError> {
        let started = Instant::now();

        // 🔴 先订阅、后读当前值：反过来会在缝隙里丢掉唤醒
        let mut subscription = self
            .store
            .subscribe(node_id)
            .map_err(|_| GuardError::NotFound(node_id.to_string()))?;

        match self.store.get(node_id) {
            None => return Err(GuardError::NotFound(node_id.to_string())),
            Some((state, _generation)) => {
                if state.readiness.is_operable() {
                    return Ok(state);
                }
                if state.readiness.is_terminal() {
                    return Err(GuardError::Disconnected(node_id.to_string()));
                }
                debug!(
                    "Node {} is {:?}, waiting up to {}ms",
                    node_id, state.readiness, timeout_ms
                );
            }
        }

        let timeout = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                change = subscription.recv() => match change {
                    Some(change) => {
                        if change.state.readiness.is_operable() {
                            return Ok(change.state);
                        }
                        if change.state.readiness.is_terminal() {
                            return Err(GuardError::Disconnected(node_id.to_string()));
                        }
                        // 过渡态之间的跳变不结束等待
                    }
                    // 通道关闭 = 节点在等待期间被移除
                    None => return Err(GuardError::Disconnected(node_id.to_string())),
                },
                _ = &mut timeout => {
                    return Err(GuardError::Timeout {
                        node_id: node_id.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }
}

// ============================================================================
// 测试
// ============================================================================
