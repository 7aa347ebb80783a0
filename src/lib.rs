//! OxideSync - 跳板机终端的节点状态同步与重连编排引擎
//!
//! 连接池（应用后端）持有物理 SSH 连接并给状态事件编号（generation）；
//! 本 crate 是它的客户端一致性层：
//!
//! - [`store::NodeStateStore`] - 快照 + 实时事件的 generation 门控合并
//! - [`topology::TopologyResolver`] - 节点↔连接绑定与级联闭包（blast radius）
//! - [`reconnect::ReconnectOrchestrator`] - 去重、退避、封顶的重连任务机
//! - [`guard::ConnectionGuard`] - 操作前的事件驱动可用性等待
//! - [`engine::SyncEngine`] - 组合根：事件泵 + 节点生命周期门面
//!
//! 外部世界只通过 [`pool::ConnectionPool`] trait 进入。

pub mod engine;
pub mod guard;
pub mod pool;
pub mod reconnect;
pub mod store;
pub mod topology;
pub mod types;

// 常用类型平铺导出，上层 use oxidesync::SyncEngine 即可
pub use engine::{SyncConfig, SyncEngine, SyncError, SyncStats};
pub use guard::{ConnectionGuard, GuardError};
pub use pool::{ConnectionPool, PoolError, ProbeOutcome};
pub use reconnect::{
    ReconnectConfig, ReconnectEvent, ReconnectOrchestrator, ReconnectPhase, ReconnectTaskView,
};
pub use store::{NodeStateStore, StateChange, StateSubscription, StoreError};
pub use topology::{FlatNode, TopologyError, TopologyNode, TopologyResolver};
pub use types::{
    ConnectionId, ConnectionStatus, ConnectionStatusEvent, Generation, NodeId, NodeReadiness,
    NodeState, NodeStateEvent, NodeStateSnapshot, StateDelta, TerminalEndpoint,
};
