//! Node State Store - 节点状态缓存（generation 门控合并）
//!
//! 参考: docs/SYNC_ARCHITECTURE.md §3
//!
//! 客户端对每个节点同时面对两个数据源：一次性快照（fetch_snapshot）
//! 和持续的活事件流。两者并发进行，竞态不用锁解决，用 generation
//! 比较解决：
//!
//! - 活事件：generation 严格大于已见最大值才应用（重放/乱序保护）
//! - 快照：generation >= 已见最大值即应用。平局快照赢：它反映读取
//!   时刻的权威状态，且可能携带活事件不带的字段
//!
//! 被丢弃的过期更新不是错误，只记 debug 日志。
//!
//! 订阅通过每节点的 broadcast channel 广播 StateChange；发送都发生在
//! 该节点的互斥临界区内，保证单节点内按合并顺序投递。丢掉订阅句柄
//! 即取消订阅。

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::pool::ConnectionPool;
use crate::types::{Generation, NodeId, NodeReadiness, NodeState, StateDelta};

/// 默认每节点广播缓冲（状态转移是低频事件）
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// State Change / Subscription
// ============================================================================

/// 推送给订阅者的一次状态转移
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: NodeState,
    pub generation: Generation,
}

/// 单节点状态订阅句柄
///
/// drop 即退订（broadcast receiver 语义）。节点被移除时 recv 返回
/// None，订阅者据此结束等待。
pub struct StateSubscription {
    node_id: NodeId,
    rx: broadcast::Receiver<StateChange>,
}

impl StateSubscription {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// 等待下一次状态转移；None 表示节点已被移除
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // 慢订阅者丢掉中间转移，继续取最新的即可
                    debug!(
                        "State subscription for node {} lagged, skipped {} transitions",
                        self.node_id, skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞取一条（测试用）；队列空或节点已移除都返回 None
    pub fn try_recv(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Node State Store
// ============================================================================

struct EntryInner {
    state: NodeState,
    /// 已见最大 generation，0 = 从未收到任何权威更新
    max_seen: Generation,
    /// 初始快照是否已落地（成功或失败被吸收都算）
    hydrated: bool,
}

struct NodeEntry {
    inner: Mutex<EntryInner>,
    tx: broadcast::Sender<StateChange>,
}

impl NodeEntry {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(EntryInner {
                state: NodeState::default(),
                max_seen: 0,
                hydrated: false,
            }),
            tx,
        }
    }
}

/// 节点状态缓存：NodeState 的唯一写入者
///
/// 其余组件只读或通过连接池间接请求状态转移。条目随拓扑增删：
/// 节点加入拓扑时 track，移除时 remove（关闭全部订阅）。
pub struct NodeStateStore {
    pool: Arc<dyn ConnectionPool>,
    nodes: DashMap<NodeId, Arc<NodeEntry>>,
    channel_capacity: usize,
}

impl NodeStateStore {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self::with_capacity(pool, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(pool: Arc<dyn ConnectionPool>, channel_capacity: usize) -> Self {
        Self {
            pool,
            nodes: DashMap::new(),
            channel_capacity,
        }
    }

    /// 建立默认条目（disconnected, generation 0）；已存在则什么都不做
    pub(crate) fn track(&self, node_id: &NodeId) {
        self.nodes
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(NodeEntry::new(self.channel_capacity)));
    }

    /// 移除条目并关闭其全部订阅
    pub(crate) fn remove(&self, node_id: &NodeId) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// 订阅节点状态转移
    ///
    /// 必须在发起快照拉取**之前**调用，拉取往返期间到达的事件才不会
    /// 丢失（合并由 generation 规则兜底）。
    pub fn subscribe(&self, node_id: &NodeId) -> Result<StateSubscription, StoreError> {
        let entry = self
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))?;
        Ok(StateSubscription {
            node_id: node_id.clone(),
            rx: entry.tx.subscribe(),
        })
    }

    /// 当前缓存的 (state, generation)
    pub fn get(&self, node_id: &NodeId) -> Option<(NodeState, Generation)> {
        let entry = self.nodes.get(node_id)?;
        let inner = entry.inner.lock();
        Some((inner.state.clone(), inner.max_seen))
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn is_hydrated(&self, node_id: &NodeId) -> bool {
        match self.nodes.get(node_id) {
            Some(entry) => entry.inner.lock().hydrated,
            None => false,
        }
    }

    /// 应用一条活事件增量（严格大于才接受）
    ///
    /// 返回是否被接受。过期/重复投递静默丢弃，只记 debug。
    pub(crate) fn apply_update(
        &self,
        node_id: &NodeId,
        delta: StateDelta,
        generation: Generation,
    ) -> bool {
        let Some(entry) = self.nodes.get(node_id).map(|e| e.clone()) else {
            debug!("Dropping update for untracked node {} (gen {})", node_id, generation);
            return false;
        };
        let mut inner = entry.inner.lock();
        if generation <= inner.max_seen {
            debug!(
                "Discarding stale update for node {} (gen {} <= max {})",
                node_id, generation, inner.max_seen
            );
            return false;
        }
        inner.max_seen = generation;
        inner.state.apply_delta(delta);
        // 不变式兜底：非 operable 状态下会话相关字段无意义
        if !inner.state.readiness.is_operable() {
            inner.state.sftp_ready = false;
            inner.state.sftp_cwd = None;
            inner.state.terminal_endpoint = None;
        }
        let _ = entry.tx.send(StateChange {
            state: inner.state.clone(),
            generation,
        });
        true
    }

    /// 应用一次快照（>= 即接受，平局快照赢）
    pub(crate) fn apply_snapshot(
        &self,
        node_id: &NodeId,
        state: NodeState,
        generation: Generation,
    ) -> bool {
        let Some(entry) = self.nodes.get(node_id).map(|e| e.clone()) else {
            debug!("Dropping snapshot for untracked node {} (gen {})", node_id, generation);
            return false;
        };
        let mut inner = entry.inner.lock();
        if generation < inner.max_seen {
            debug!(
                "Discarding stale snapshot for node {} (gen {} < max {})",
                node_id, generation, inner.max_seen
            );
            return false;
        }
        inner.max_seen = generation;
        inner.state = state;
        // 与活事件路径相同的不变式兜底：快照也可能携带失效的会话字段
        if !inner.state.readiness.is_operable() {
            inner.state.sftp_ready = false;
            inner.state.sftp_cwd = None;
            inner.state.terminal_endpoint = None;
        }
        let _ = entry.tx.send(StateChange {
            state: inner.state.clone(),
            generation,
        });
        true
    }

    /// 从权威侧拉取一次快照并按合并规则落地，返回落地后的缓存值
    ///
    /// 拉取失败会被就地吸收（保持当前/默认状态），同样标记 hydrated，
    /// 调用方永远不会因为一次读失败被卡住。
    pub async fn get_snapshot(
        &self,
        node_id: &NodeId,
    ) -> Result<(NodeState, Generation), StoreError> {
        if !self.contains(node_id) {
            return Err(StoreError::NodeNotFound(node_id.to_string()));
        }
        match self.pool.fetch_snapshot(node_id).await {
            Ok(snapshot) => {
                self.apply_snapshot(node_id, snapshot.state, snapshot.generation);
            }
            Err(e) => {
                warn!("Snapshot fetch failed for node {}: {} (falling back)", node_id, e);
            }
        }
        self.mark_hydrated(node_id);
        self.get(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))
    }

    fn mark_hydrated(&self, node_id: &NodeId) {
        if let Some(entry) = self.nodes.get(node_id) {
            entry.inner.lock().hydrated = true;
        }
    }

    /// 级联 link_down 的本地覆盖转移
    ///
    /// 连接级事件不携带 generation，客户端也从不分配 generation，
    /// 所以这次转移不推进 max_seen：投递给订阅者时带当前已见值，
    /// 任何更新的权威事件都能正常覆盖它。节点已是 link_down 时去重
    /// 为 no-op。
    pub(crate) fn mark_link_down(&self, node_id: &NodeId) -> bool {
        let Some(entry) = self.nodes.get(node_id).map(|e| e.clone()) else {
            return false;
        };
        let mut inner = entry.inner.lock();
        if inner.state.readiness == NodeReadiness::LinkDown {
            return false;
        }
        inner.state.set_readiness(NodeReadiness::LinkDown, None);
        let _ = entry.tx.send(StateChange {
            state: inner.state.clone(),
            generation: inner.max_seen,
        });
        true
    }

    /// 清空状态与已见 generation（节点新生命周期）
    ///
    /// 旧生命周期攒下的高 generation 不应挡住新生命周期的低值。
    /// 订阅通道保留，存活的订阅者会收到回到初始态的转移。
    pub fn reset(&self, node_id: &NodeId) -> bool {
        let Some(entry) = self.nodes.get(node_id).map(|e| e.clone()) else {
            return false;
        };
        let mut inner = entry.inner.lock();
        inner.state = NodeState::default();
        inner.max_seen = 0;
        inner.hydrated = false;
        let _ = entry.tx.send(StateChange {
            state: inner.state.clone(),
            generation: 0,
        });
        true
    }

    /// 当前活跃订阅数（测试/诊断用）
    pub fn subscriber_count(&self, node_id: &NodeId) -> usize {
        match self.nodes.get(node_id) {
            Some(entry) => entry.tx.receiver_count(),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    /// 按就绪状态统计节点数（诊断面板用）
    pub fn readiness_counts(&self) -> HashMap<NodeReadiness, usize> {
        let mut counts = HashMap::new();
        for entry in self.nodes.iter() {
            let readiness = entry.value().inner.lock().state.readiness;
            *counts.entry(readiness).or_insert(0) += 1;
        }
        counts
    }
}

// ============================================================================
// 错误类型
// ============================================================================

/// 状态缓存错误
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
pub enum StoreError {
    #[error("Node not tracked: {0}")]
    NodeNotFound(String),
}

// ============================================================================
// 测试
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::testing::ScriptedPool;
    use crate::types::TerminalEndpoint;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    fn store() -> (Arc<ScriptedPool>, NodeStateStore) {
        let pool = ScriptedPool::new();
        let store = NodeStateStore::new(pool.clone());
        (pool, store)
    }

    fn readiness_delta(readiness: NodeReadiness) -> StateDelta {
        StateDelta::Readiness {
            readiness,
            reason: None,
        }
    }

    fn active_state() -> NodeState {
        let mut state = NodeState::default();
        state.set_readiness(NodeReadiness::Active, None);
        state
    }

    #[test]
    fn test_track_creates_default_entry() {
        let (_pool, store) = store();
        store.track(&node("n"));

        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(state.readiness, NodeReadiness::Disconnected);
        assert_eq!(generation, 0);
        assert!(!store.is_hydrated(&node("n")));

        // 重复 track 不重置已有条目
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 3);
        store.track(&node("n"));
        assert_eq!(store.get(&node("n")).unwrap().1, 3);
    }

    #[test]
    fn test_live_update_requires_strictly_greater() {
        let (_pool, store) = store();
        store.track(&node("n"));

        assert!(store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 1));
        // 重复投递同一事件是幂等的
        assert!(!store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 1));
        // 乱序到达的旧事件被丢弃
        assert!(store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 5));
        assert!(!store.apply_update(&node("n"), readiness_delta(NodeReadiness::Idle), 3));

        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(state.readiness, NodeReadiness::Active);
        assert_eq!(generation, 5);
    }

    #[test]
    fn test_snapshot_wins_ties() {
        let (_pool, store) = store();
        store.track(&node("n"));
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 5);

        // 平局：快照赢
        assert!(store.apply_snapshot(&node("n"), active_state(), 5));
        assert_eq!(store.get(&node("n")).unwrap().0.readiness, NodeReadiness::Active);

        // 严格小于：快照被丢弃
        let mut idle = NodeState::default();
        idle.set_readiness(NodeReadiness::Idle, None);
        assert!(!store.apply_snapshot(&node("n"), idle, 4));
        assert_eq!(store.get(&node("n")).unwrap().0.readiness, NodeReadiness::Active);
    }

    #[test]
    fn test_snapshot_clears_session_fields_when_not_operable() {
        let (_pool, store) = store();
        store.track(&node("n"));

        // 权威侧可能给出 link_down 却仍带会话字段的快照：落地时一并清掉
        let mut down = NodeState::default();
        down.readiness = NodeReadiness::LinkDown;
        down.sftp_ready = true;
        down.sftp_cwd = Some("/var/log".to_string());
        down.terminal_endpoint = Some(TerminalEndpoint {
            port: 4020,
            token: "tok".to_string(),
            session_id: "sess".to_string(),
        });

        assert!(store.apply_snapshot(&node("n"), down, 5));
        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(generation, 5);
        assert_eq!(state.readiness, NodeReadiness::LinkDown);
        assert!(!state.sftp_ready);
        assert!(state.sftp_cwd.is_none());
        assert!(state.terminal_endpoint.is_none());
    }

    #[test]
    fn test_live_event_beats_older_snapshot() {
        // 规格场景：gen 6 的活事件先到，gen 5 的快照后到 → 快照作废
        let (_pool, store) = store();
        store.track(&node("n"));

        assert!(store.apply_update(&node("n"), readiness_delta(NodeReadiness::LinkDown), 6));
        assert!(!store.apply_snapshot(&node("n"), active_state(), 5));

        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(state.readiness, NodeReadiness::LinkDown);
        assert_eq!(generation, 6);
    }

    #[test]
    fn test_convergence_is_order_independent() {
        // 同一批更新以不同交错到达，最终状态都等于最大 generation 的那条
        let updates: Vec<(u64, NodeReadiness)> = vec![
            (1, NodeReadiness::Connecting),
            (3, NodeReadiness::Active),
            (2, NodeReadiness::Idle),
        ];
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![2, 1, 0],
            vec![1, 0, 2],
            vec![2, 0, 1],
        ];

        for order in orders {
            let (_pool, store) = store();
            store.track(&node("n"));
            // 快照（gen 2, active）插在不同位置也不改变收敛结果
            store.apply_snapshot(&node("n"), active_state(), 2);
            for index in order {
                let (generation, readiness) = updates[index];
                store.apply_update(&node("n"), readiness_delta(readiness), generation);
            }
            let (state, generation) = store.get(&node("n")).unwrap();
            assert_eq!(generation, 3);
            assert_eq!(state.readiness, NodeReadiness::Active);
        }
    }

    #[test]
    fn test_sftp_delta_only_sticks_when_operable() {
        let (_pool, store) = store();
        store.track(&node("n"));

        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 1);
        // connecting 状态下 SFTP 字段无意义，但 generation 照常前进
        assert!(store.apply_update(
            &node("n"),
            StateDelta::SftpChannel {
                ready: true,
                cwd: Some("/srv".to_string()),
            },
            2
        ));
        let (state, generation) = store.get(&node("n")).unwrap();
        assert!(!state.sftp_ready);
        assert_eq!(generation, 2);

        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 3);
        assert!(store.apply_update(
            &node("n"),
            StateDelta::SftpChannel {
                ready: true,
                cwd: Some("/srv".to_string()),
            },
            4
        ));
        let (state, _) = store.get(&node("n")).unwrap();
        assert!(state.sftp_ready);
        assert_eq!(state.sftp_cwd.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_readiness_change_clears_endpoint() {
        let (_pool, store) = store();
        store.track(&node("n"));
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 1);
        store.apply_update(
            &node("n"),
            StateDelta::TerminalEndpoint {
                endpoint: Some(TerminalEndpoint {
                    port: 9001,
                    token: "tok".to_string(),
                    session_id: "sess".to_string(),
                }),
            },
            2,
        );
        assert!(store.get(&node("n")).unwrap().0.terminal_endpoint.is_some());

        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Reconnecting), 3);
        assert!(store.get(&node("n")).unwrap().0.terminal_endpoint.is_none());
    }

    #[test]
    fn test_subscription_delivers_in_generation_order() {
        let (_pool, store) = store();
        store.track(&node("n"));
        let mut sub = store.subscribe(&node("n")).unwrap();

        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 1);
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Idle), 3);
        // 被拒绝的更新不产生投递
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Error), 2);

        let mut seen = Vec::new();
        while let Some(change) = sub.try_recv() {
            seen.push(change.generation);
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn test_subscribe_unknown_node() {
        let (_pool, store) = store();
        assert!(matches!(
            store.subscribe(&node("ghost")),
            Err(StoreError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_fetch_races_live_events() {
        // 订阅先行，快照在途时活事件已把 generation 推到 6，
        // 迟到的 gen 5 快照必须被丢弃
        let (pool, store) = store();
        let store = Arc::new(store);
        store.track(&node("n"));
        pool.put_snapshot(&node("n"), NodeReadiness::Active, 5);
        pool.set_snapshot_delay(Duration::from_millis(40));

        let mut sub = store.subscribe(&node("n")).unwrap();
        let fetch = {
            let store = store.clone();
            let id = node("n");
            tokio::spawn(async move { store.get_snapshot(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::LinkDown), 6);

        let (state, generation) = fetch.await.unwrap().unwrap();
        assert_eq!(generation, 6);
        assert_eq!(state.readiness, NodeReadiness::LinkDown);
        assert!(store.is_hydrated(&node("n")));

        // 订阅者只看到 gen 6 一次，没有快照的重复投递
        let change = sub.try_recv().unwrap();
        assert_eq!(change.generation, 6);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_fetch_failure_absorbed() {
        let (pool, store) = store();
        store.track(&node("n"));
        pool.set_fail_snapshots(true);

        let (state, generation) = store.get_snapshot(&node("n")).await.unwrap();
        assert_eq!(state.readiness, NodeReadiness::Disconnected);
        assert_eq!(generation, 0);
        // 失败被吸收后仍然标记就绪，调用方不会永远等待
        assert!(store.is_hydrated(&node("n")));
    }

    #[test]
    fn test_mark_link_down_overlay() {
        let (_pool, store) = store();
        store.track(&node("n"));
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 5);
        let mut sub = store.subscribe(&node("n")).unwrap();

        // 覆盖转移：状态变、generation 不前进
        assert!(store.mark_link_down(&node("n")));
        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(state.readiness, NodeReadiness::LinkDown);
        assert_eq!(generation, 5);

        let change = sub.try_recv().unwrap();
        assert_eq!(change.generation, 5);
        assert_eq!(change.state.readiness, NodeReadiness::LinkDown);

        // 已经 link_down 再标记是 no-op，不重复投递
        assert!(!store.mark_link_down(&node("n")));
        assert!(sub.try_recv().is_none());

        // 更新的权威事件正常覆盖
        assert!(store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 6));
        assert_eq!(store.get(&node("n")).unwrap().0.readiness, NodeReadiness::Active);
    }

    #[test]
    fn test_reset_allows_fresh_lifetime() {
        let (_pool, store) = store();
        store.track(&node("n"));
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 40);

        assert!(store.reset(&node("n")));
        let (state, generation) = store.get(&node("n")).unwrap();
        assert_eq!(state.readiness, NodeReadiness::Disconnected);
        assert_eq!(generation, 0);

        // 新生命周期的低 generation 不再被旧值挡住
        assert!(store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), 1));
    }

    #[tokio::test]
    async fn test_remove_closes_subscriptions() {
        let (_pool, store) = store();
        store.track(&node("n"));
        let mut sub = store.subscribe(&node("n")).unwrap();

        assert!(store.remove(&node("n")));
        assert!(sub.recv().await.is_none());
        assert!(store.get(&node("n")).is_none());
    }

    #[test]
    fn test_subscriber_count_tracks_drops() {
        let (_pool, store) = store();
        store.track(&node("n"));
        assert_eq!(store.subscriber_count(&node("n")), 0);

        let sub_a = store.subscribe(&node("n")).unwrap();
        let sub_b = store.subscribe(&node("n")).unwrap();
        assert_eq!(store.subscriber_count(&node("n")), 2);

        drop(sub_a);
        assert_eq!(store.subscriber_count(&node("n")), 1);
        drop(sub_b);
        assert_eq!(store.subscriber_count(&node("n")), 0);
    }

    #[test]
    fn test_lagged_subscriber_still_sees_latest() {
        let pool = ScriptedPool::new();
        let store = NodeStateStore::with_capacity(pool, 2);
        store.track(&node("n"));
        let mut sub = store.subscribe(&node("n")).unwrap();

        for generation in 1..=6 {
            store.apply_update(&node("n"), readiness_delta(NodeReadiness::Connecting), generation);
        }
        store.apply_update(&node("n"), readiness_delta(NodeReadiness::Active), 7);

        let mut last = None;
        while let Some(change) = sub.try_recv() {
            last = Some(change);
        }
        let last = last.unwrap();
        assert_eq!(last.generation, 7);
        assert_eq!(last.state.readiness, NodeReadiness::Active);
    }

    #[test]
    fn test_readiness_counts() {
        let (_pool, store) = store();
        store.track(&node("a"));
        store.track(&node("b"));
        store.track(&node("c"));
        store.apply_update(&node("a"), readiness_delta(NodeReadiness::Active), 1);
        store.apply_update(&node("b"), readiness_delta(NodeReadiness::Active), 1);

        let counts = store.readiness_counts();
        assert_eq!(counts.get(&NodeReadiness::Active), Some(&2));
        assert_eq!(counts.get(&NodeReadiness::Disconnected), Some(&1));
    }
}
