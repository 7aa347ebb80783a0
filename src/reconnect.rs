//! Reconnect Orchestrator
//!
//! Decides, for each node marked link_down, whether and when to attempt
//! reconnection, and serializes attempts per node: at most one live
//! ReconnectTask per node, bounded exponential backoff with jitter, and a
//! mandatory attempt ceiling (no silent retry storms).
//!
//! # Supersession
//!
//! Every task carries an attempt id. The backoff loop re-validates itself
//! against the task table at each wake-up, so cancellation and replacement
//! are safe at any suspension point. An outcome that arrives after its task
//! was cancelled or its node removed is discarded from bookkeeping; if the
//! node is gone and the attempt had produced a connection, that connection
//! is released back to the pool so nothing leaks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::pool::ConnectionPool;
use crate::topology::TopologyResolver;
use crate::types::{ConnectionId, NodeId};

// ============================================================================
// Configuration
// ============================================================================

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Delay before the first attempt (ms) - fast path for transient blips
    pub first_delay_ms: u64,
    /// Base delay for the second attempt onwards (ms), doubled per attempt
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (ms)
    pub max_delay_ms: u64,
    /// Jitter added to every delay (ms), uniform in [min, max)
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Whether to enable automatic reconnection
    pub enabled: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            first_delay_ms: 200,
            initial_delay_ms: 500,
            max_delay_ms: 30_000, // 30 seconds
            jitter_min_ms: 50,
            jitter_max_ms: 200,
            enabled: true,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a given attempt (1-based), without jitter.
    ///
    /// attempt 1 -> first_delay, attempt n -> initial_delay * 2^(n-2), capped.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        if attempt <= 1 {
            return self.first_delay_ms.min(self.max_delay_ms);
        }
        let shift = (attempt - 2).min(20);
        self.initial_delay_ms
            .checked_shl(shift)
            .unwrap_or(self.max_delay_ms)
            .min(self.max_delay_ms)
    }

    /// 🔴 随机抖动：避免一批节点同时发起重连（重连风暴）
    pub fn jitter_ms(&self) -> u64 {
        let span = self.jitter_max_ms.saturating_sub(self.jitter_min_ms).max(1);
        rand::random::<u64>() % span + self.jitter_min_ms
    }
}

// ============================================================================
// Task state
// ============================================================================

/// Per-node task phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReconnectPhase {
    /// Waiting out the backoff delay
    Scheduled = 0,
    /// Connect call in flight
    Attempting = 1,
    /// Ceiling reached; parked until manual retry or removal
    Exhausted = 2,
}

impl ReconnectPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Attempting,
            2 => Self::Exhausted,
            _ => Self::Scheduled,
        }
    }
}

/// Per-node scheduling record
struct ReconnectTask {
    node_id: NodeId,
    /// Supersession token: loop wake-ups compare this against the task table
    attempt_id: u64,
    attempt_count: AtomicU32,
    in_flight: AtomicBool,
    phase: AtomicU8,
    last_attempt_at: Mutex<Option<DateTime<Utc>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectTask {
    fn new(node_id: NodeId, attempt_id: u64) -> Self {
        Self {
            node_id,
            attempt_id,
            attempt_count: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            phase: AtomicU8::new(ReconnectPhase::Scheduled as u8),
            last_attempt_at: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    fn phase(&self) -> ReconnectPhase {
        ReconnectPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ReconnectPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Read-only task view (diagnostics / UI)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectTaskView {
    pub node_id: NodeId,
    pub attempt_count: u32,
    pub in_flight: bool,
    pub phase: ReconnectPhase,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Result of one pool connect attempt
#[derive(Debug, Clone)]
pub enum ReconnectOutcome {
    Succeeded(ConnectionId),
    Failed(String),
}

// ============================================================================
// Progress events
// ============================================================================

/// Events emitted during reconnection (UI toasts / badges)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReconnectEvent {
    #[serde(rename_all = "camelCase")]
    Scheduled {
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Attempting {
        node_id: NodeId,
        attempt: u32,
        max_attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    AttemptFailed {
        node_id: NodeId,
        attempt: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Succeeded {
        node_id: NodeId,
        connection_id: ConnectionId,
        attempt: u32,
    },
    #[serde(rename_all = "camelCase")]
    Exhausted {
        node_id: NodeId,
        total_attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { node_id: NodeId },
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Reconnect orchestrator: one live task per node, deduped scheduling.
///
/// 级联策略：link_down 波及集只给主节点排重连；仍然 link_down 的子节点
/// 等父节点恢复后再补排（带抖动），父节点不在时给子节点排任务只会白跑。
pub struct ReconnectOrchestrator {
    pool: Arc<dyn ConnectionPool>,
    topology: Arc<TopologyResolver>,
    config: ReconnectConfig,
    tasks: DashMap<NodeId, Arc<ReconnectTask>>,
    next_attempt_id: AtomicU64,
    event_tx: Mutex<Option<mpsc::UnboundedSender<ReconnectEvent>>>,
}

impl ReconnectOrchestrator {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        topology: Arc<TopologyResolver>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            pool,
            topology,
            config,
            tasks: DashMap::new(),
            next_attempt_id: AtomicU64::new(0),
            event_tx: Mutex::new(None),
        }
    }

    /// Set event sender for monitoring reconnection progress
    pub fn set_event_sender(&self, tx: mpsc::UnboundedSender<ReconnectEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn emit(&self, event: ReconnectEvent) {
        if let Some(tx) = &*self.event_tx.lock() {
            let _ = tx.send(event);
        }
    }

    /// Schedule a reconnect for a node. Returns false when deduped (a task is
    /// already scheduled or in flight) or reconnection is disabled.
    ///
    /// A task parked in `Exhausted` is replaced by a fresh cycle - this is the
    /// manual-retry path.
    pub fn schedule_reconnect(self: &Arc<Self>, node_id: &NodeId) -> bool {
        if !self.config.enabled {
            debug!("Reconnect disabled, not scheduling node {}", node_id);
            return false;
        }

        let attempt_id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Arc::new(ReconnectTask::new(node_id.clone(), attempt_id));

        // 入表在先、spawn 在后；entry 锁内判重，避免并发双排
        match self.tasks.entry(node_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().phase() != ReconnectPhase::Exhausted {
                    debug!("Reconnect already scheduled for node {}, deduped", node_id);
                    return false;
                }
                occupied.insert(task.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(task.clone());
            }
        }

        let handle = tokio::spawn({
            let orchestrator = self.clone();
            let task = task.clone();
            async move {
                orchestrator.run_attempt_loop(task).await;
            }
        });
        *task.handle.lock() = Some(handle);

        info!("Scheduled reconnect for node {}", node_id);
        true
    }

    /// Cancel a pending or in-flight task (user disconnect / node removal)
    pub fn cancel_reconnect(&self, node_id: &NodeId) -> bool {
        if self.remove_task(node_id, "cancelled") {
            info!("Cancelled reconnect for node {}", node_id);
            self.emit(ReconnectEvent::Cancelled {
                node_id: node_id.clone(),
            });
            true
        } else {
            false
        }
    }

    /// Abort every task (component teardown)
    pub fn cancel_all(&self) {
        let node_ids: Vec<NodeId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            self.remove_task(&node_id, "shutdown");
        }
    }

    /// 节点恢复（探活救回 / 父链路重建）：撤掉自己的排队任务，
    /// 给仍然 link_down 的直接子节点补排重连
    pub fn handle_recovery(self: &Arc<Self>, node_id: &NodeId) {
        self.topology.clear_link_down(node_id);
        self.remove_task(node_id, "recovered");
        for child in self.topology.link_down_children(node_id) {
            // 每个任务的首个退避延迟自带抖动，天然错开子节点的重连时刻
            self.schedule_reconnect(&child);
        }
    }

    pub fn task_snapshot(&self, node_id: &NodeId) -> Option<ReconnectTaskView> {
        let task = self.tasks.get(node_id)?;
        // 锁的读取放在结构体字面量外：尾表达式里的临时 guard 会活过 task 引用
        let last_attempt_at = *task.last_attempt_at.lock();
        Some(ReconnectTaskView {
            node_id: task.node_id.clone(),
            attempt_count: task.attempt_count.load(Ordering::SeqCst),
            in_flight: task.in_flight.load(Ordering::SeqCst),
            phase: task.phase(),
            last_attempt_at,
        })
    }

    pub fn phase(&self, node_id: &NodeId) -> Option<ReconnectPhase> {
        self.tasks.get(node_id).map(|t| t.phase())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|e| e.value().in_flight.load(Ordering::SeqCst))
            .count()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn is_current(&self, task: &ReconnectTask) -> bool {
        self.tasks
            .get(&task.node_id)
            .map(|t| t.attempt_id == task.attempt_id)
            .unwrap_or(false)
    }

    /// Remove a task entry and abort its loop. Returns whether one existed.
    ///
    /// Aborting may drop the loop inside a pool call; pool implementations
    /// are required to be cancel safe. An outcome already past its await is
    /// handled by the supersession check in on_reconnect_outcome.
    fn remove_task(&self, node_id: &NodeId, reason: &str) -> bool {
        match self.tasks.remove(node_id) {
            Some((_, task)) => {
                if let Some(handle) = task.handle.lock().take() {
                    handle.abort();
                }
                debug!("Removed reconnect task for node {} ({})", node_id, reason);
                true
            }
            None => false,
        }
    }

    async fn run_attempt_loop(self: Arc<Self>, task: Arc<ReconnectTask>) {
        let node_id = task.node_id.clone();
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            let delay_ms = self.config.backoff_delay_ms(attempt) + self.config.jitter_ms();
            task.set_phase(ReconnectPhase::Scheduled);
            self.emit(ReconnectEvent::Scheduled {
                node_id: node_id.clone(),
                attempt,
                delay_ms,
            });
            sleep(Duration::from_millis(delay_ms)).await;

            // 检查点：睡醒后任务可能已被取消或替换
            if !self.is_current(&task) {
                debug!("Reconnect loop for node {} superseded during delay", node_id);
                return;
            }

            task.attempt_count.store(attempt, Ordering::SeqCst);
            task.in_flight.store(true, Ordering::SeqCst);
            task.set_phase(ReconnectPhase::Attempting);
            *task.last_attempt_at.lock() = Some(Utc::now());
            self.emit(ReconnectEvent::Attempting {
                node_id: node_id.clone(),
                attempt,
                max_attempts,
            });
            info!(
                "Node {}: reconnect attempt {}/{}",
                node_id, attempt, max_attempts
            );

            let outcome = match self.pool.connect(&node_id).await {
                Ok(connection_id) => ReconnectOutcome::Succeeded(connection_id),
                Err(e) => ReconnectOutcome::Failed(e.to_string()),
            };
            task.in_flight.store(false, Ordering::SeqCst);

            let retry = self
                .on_reconnect_outcome(&node_id, task.attempt_id, outcome)
                .await;
            if !retry {
                return;
            }
        }
    }

    /// Process one attempt outcome. Returns whether another attempt should run.
    ///
    /// Tie-break policy: an outcome whose task entry is gone or superseded is
    /// discarded from bookkeeping. If the node itself was removed from the
    /// topology and the attempt had succeeded, the fresh connection is
    /// released back to the pool.
    pub(crate) async fn on_reconnect_outcome(
        self: &Arc<Self>,
        node_id: &NodeId,
        attempt_id: u64,
        outcome: ReconnectOutcome,
    ) -> bool {
        let current = self
            .tasks
            .get(node_id)
            .map(|t| t.attempt_id == attempt_id)
            .unwrap_or(false);

        if !current {
            if let ReconnectOutcome::Succeeded(connection_id) = &outcome {
                if !self.topology.contains(node_id) {
                    // 节点已被移除：挂起的成功结果要把连接放回池子，不能泄漏
                    debug!(
                        "Releasing orphaned connection {} for removed node {}",
                        connection_id, node_id
                    );
                    if let Err(e) = self.pool.disconnect(node_id).await {
                        warn!("Failed to release orphaned connection for {}: {}", node_id, e);
                    }
                }
            }
            debug!("Discarding stale reconnect outcome for node {}", node_id);
            return false;
        }

        match outcome {
            ReconnectOutcome::Succeeded(connection_id) => {
                let attempt = self
                    .tasks
                    .get(node_id)
                    .map(|t| t.attempt_count.load(Ordering::SeqCst))
                    .unwrap_or(0);
                self.tasks.remove(node_id);

                match self.topology.bind_connection(node_id, connection_id.clone()) {
                    Ok(_) => {
                        info!(
                            "Node {}: reconnect succeeded on attempt {} (connection {})",
                            node_id, attempt, connection_id
                        );
                        self.emit(ReconnectEvent::Succeeded {
                            node_id: node_id.clone(),
                            connection_id,
                            attempt,
                        });
                        // 后续收敛状态（active 等）由连接池的正常事件流带来
                        self.handle_recovery(node_id);
                    }
                    Err(_) => {
                        // 绑定窗口内节点被移除，同样按孤儿结果释放
                        debug!("Node {} vanished before rebind, releasing connection", node_id);
                        if let Err(e) = self.pool.disconnect(node_id).await {
                            warn!("Failed to release orphaned connection for {}: {}", node_id, e);
                        }
                    }
                }
                false
            }
            ReconnectOutcome::Failed(error) => {
                let attempt = self
                    .tasks
                    .get(node_id)
                    .map(|t| t.attempt_count.load(Ordering::SeqCst))
                    .unwrap_or(0);
                if attempt >= self.config.max_attempts {
                    // 达到上限：任务停在 exhausted，节点保持 link_down，等用户手动处理
                    if let Some(task) = self.tasks.get(node_id) {
                        task.set_phase(ReconnectPhase::Exhausted);
                    }
                    error!(
                        "Node {}: reconnect exhausted after {} attempts (last error: {})",
                        node_id, attempt, error
                    );
                    self.emit(ReconnectEvent::Exhausted {
                        node_id: node_id.clone(),
                        total_attempts: attempt,
                    });
                    false
                } else {
                    warn!(
                        "Node {}: reconnect attempt {} failed: {}",
                        node_id, attempt, error
                    );
                    self.emit(ReconnectEvent::AttemptFailed {
                        node_id: node_id.clone(),
                        attempt,
                        error,
                    });
                    true
                }
            }
        }
    }
}

// ============================================================================
// 测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::ScriptedPool;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    /// 退避时间压缩到毫秒级、抖动归零的测试配置
    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 5,
            first_delay_ms: 10,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            enabled: true,
        }
    }

    fn setup(
        config: ReconnectConfig,
    ) -> (
        Arc<ScriptedPool>,
        Arc<TopologyResolver>,
        Arc<ReconnectOrchestrator>,
    ) {
        let pool = ScriptedPool::new();
        let topology = Arc::new(TopologyResolver::new());
        let orchestrator = Arc::new(ReconnectOrchestrator::new(
            pool.clone(),
            topology.clone(),
            config,
        ));
        (pool, topology, orchestrator)
    }

    async fn wait_until<F: Fn() -> bool>(deadline_ms: u64, check: F) -> bool {
        let mut waited = 0;
        while waited < deadline_ms {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
            waited += 10;
        }
        check()
    }

    #[test]
    fn test_reconnect_config_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.first_delay_ms, 200);
        assert_eq!(config.initial_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!(config.enabled);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = ReconnectConfig::default();

        // First attempt: fast path
        assert_eq!(config.backoff_delay_ms(1), 200);
        // Then 500ms doubled per attempt
        assert_eq!(config.backoff_delay_ms(2), 500);
        assert_eq!(config.backoff_delay_ms(3), 1000);
        assert_eq!(config.backoff_delay_ms(4), 2000);
        assert_eq!(config.backoff_delay_ms(5), 4000);
        // Capped at the ceiling
        assert_eq!(config.backoff_delay_ms(9), 30_000);
        assert_eq!(config.backoff_delay_ms(40), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = ReconnectConfig::default();
        for _ in 0..200 {
            let jitter = config.jitter_ms();
            assert!((50..200).contains(&jitter), "jitter {} out of bounds", jitter);
        }
    }

    #[tokio::test]
    async fn test_schedule_dedupes_while_live() {
        let (pool, topology, orchestrator) = setup(fast_config());
        topology.insert_root(node("n")).unwrap();
        pool.set_connect_delay(Duration::from_millis(60));

        assert!(orchestrator.schedule_reconnect(&node("n")));
        // 排队中再排：去重
        assert!(!orchestrator.schedule_reconnect(&node("n")));
        sleep(Duration::from_millis(30)).await;
        // attempt 在途时再排：仍去重
        assert!(!orchestrator.schedule_reconnect(&node("n")));

        assert!(wait_until(1000, || orchestrator.task_count() == 0).await);
        // 两次重复调用没有放大为多次 connect
        assert_eq!(pool.connect_count(), 1);
        // 成功后换绑了新连接
        assert!(topology.connection_of(&node("n")).is_some());
    }

    #[tokio::test]
    async fn test_failure_then_success_rebinds() {
        let (pool, topology, orchestrator) = setup(fast_config());
        topology.insert_root(node("n")).unwrap();
        pool.script_connect_failures(1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.set_event_sender(tx);

        assert!(orchestrator.schedule_reconnect(&node("n")));
        assert!(wait_until(1000, || orchestrator.task_count() == 0).await);
        assert_eq!(pool.connect_count(), 2);

        let mut saw_failed = false;
        let mut saw_succeeded = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ReconnectEvent::AttemptFailed { attempt, .. } => {
                    assert_eq!(attempt, 1);
                    saw_failed = true;
                }
                ReconnectEvent::Succeeded { attempt, .. } => {
                    assert_eq!(attempt, 2);
                    saw_succeeded = true;
                }
                _ => {}
            }
        }
        assert!(saw_failed && saw_succeeded);
    }

    #[tokio::test]
    async fn test_exhaustion_parks_task() {
        let mut config = fast_config();
        config.max_attempts = 2;
        let (pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("n")).unwrap();
        pool.script_connect_failures(5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.set_event_sender(tx);

        assert!(orchestrator.schedule_reconnect(&node("n")));
        assert!(
            wait_until(1000, || {
                orchestrator.phase(&node("n")) == Some(ReconnectPhase::Exhausted)
            })
            .await
        );

        // 上限是硬性的：正好两次，不再有后续尝试
        assert_eq!(pool.connect_count(), 2);
        sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.connect_count(), 2);

        let view = orchestrator.task_snapshot(&node("n")).unwrap();
        assert_eq!(view.attempt_count, 2);
        assert!(!view.in_flight);
        assert!(view.last_attempt_at.is_some());

        let mut saw_exhausted = false;
        while let Ok(event) = rx.try_recv() {
            if let ReconnectEvent::Exhausted { total_attempts, .. } = event {
                assert_eq!(total_attempts, 2);
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn test_task_snapshot_during_backoff() {
        let mut config = fast_config();
        config.first_delay_ms = 5_000; // 任务停在 scheduled 相位
        let (_pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("n")).unwrap();

        assert!(orchestrator.schedule_reconnect(&node("n")));
        let view = orchestrator.task_snapshot(&node("n")).unwrap();
        assert_eq!(view.node_id, node("n"));
        assert_eq!(view.attempt_count, 0);
        assert!(!view.in_flight);
        assert_eq!(view.phase, ReconnectPhase::Scheduled);
        // 首个 attempt 发出前没有时间戳
        assert!(view.last_attempt_at.is_none());

        assert!(orchestrator.task_snapshot(&node("ghost")).is_none());
        orchestrator.cancel_all();
    }

    #[tokio::test]
    async fn test_manual_retry_after_exhaustion() {
        let mut config = fast_config();
        config.max_attempts = 1;
        let (pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("n")).unwrap();
        pool.script_connect_failures(1);

        orchestrator.schedule_reconnect(&node("n"));
        assert!(
            wait_until(1000, || {
                orchestrator.phase(&node("n")) == Some(ReconnectPhase::Exhausted)
            })
            .await
        );

        // exhausted 任务不挡手动重试：开启全新周期并成功清空
        assert!(orchestrator.schedule_reconnect(&node("n")));
        assert!(wait_until(1000, || orchestrator.task_count() == 0).await);
        assert_eq!(pool.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let mut config = fast_config();
        config.first_delay_ms = 100;
        let (pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("n")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.set_event_sender(tx);

        assert!(orchestrator.schedule_reconnect(&node("n")));
        sleep(Duration::from_millis(20)).await;
        assert!(orchestrator.cancel_reconnect(&node("n")));
        assert!(!orchestrator.cancel_reconnect(&node("n")));

        sleep(Duration::from_millis(150)).await;
        // 退避期内取消：attempt 根本没有发出
        assert_eq!(pool.connect_count(), 0);
        assert_eq!(orchestrator.task_count(), 0);

        let mut saw_cancelled = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ReconnectEvent::Cancelled { .. }) {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn test_orphaned_success_releases_connection() {
        let (pool, topology, orchestrator) = setup(fast_config());
        // 节点不在拓扑里：移除后才送达的成功结果
        let outcome = ReconnectOutcome::Succeeded(ConnectionId::from("conn-late"));
        let retry = orchestrator
            .on_reconnect_outcome(&node("ghost"), 42, outcome)
            .await;

        assert!(!retry);
        // 结果仍被处理：连接释放回池子
        assert_eq!(pool.disconnect_calls(), vec![node("ghost")]);
        // 但不复活任务表
        assert_eq!(orchestrator.task_count(), 0);
        assert!(topology.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_outcome_for_live_node_keeps_connection() {
        let (pool, topology, orchestrator) = setup(fast_config());
        topology.insert_root(node("n")).unwrap();

        let outcome = ReconnectOutcome::Succeeded(ConnectionId::from("conn-x"));
        let retry = orchestrator.on_reconnect_outcome(&node("n"), 42, outcome).await;

        assert!(!retry);
        // 节点还活着：不能拆它的连接
        assert!(pool.disconnect_calls().is_empty());
        assert_eq!(orchestrator.task_count(), 0);
    }

    #[tokio::test]
    async fn test_recovery_schedules_down_children() {
        let mut config = fast_config();
        config.first_delay_ms = 5_000; // 任务保持在 scheduled，便于断言
        let (_pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("root")).unwrap();
        topology.insert_child(&node("root"), node("a")).unwrap();
        topology.insert_child(&node("root"), node("b")).unwrap();
        topology
            .bind_connection(&node("root"), ConnectionId::from("conn-root"))
            .unwrap();

        topology.handle_link_down(&ConnectionId::from("conn-root"), &[]);
        assert!(topology.is_link_down(&node("a")));

        orchestrator.handle_recovery(&node("root"));

        assert!(!topology.is_link_down(&node("root")));
        // 子节点保持 link_down 标记（由各自恢复时清除），但都有了任务
        assert!(orchestrator.phase(&node("a")).is_some());
        assert!(orchestrator.phase(&node("b")).is_some());
        assert_eq!(orchestrator.task_count(), 2);

        orchestrator.cancel_all();
        assert_eq!(orchestrator.task_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_config_never_schedules() {
        let mut config = fast_config();
        config.enabled = false;
        let (pool, topology, orchestrator) = setup(config);
        topology.insert_root(node("n")).unwrap();

        assert!(!orchestrator.schedule_reconnect(&node("n")));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.connect_count(), 0);
        assert_eq!(orchestrator.task_count(), 0);
    }
}
