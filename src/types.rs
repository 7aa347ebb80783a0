//! 同步层类型定义
//!
//! 参考: docs/SYNC_ARCHITECTURE.md §2

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// 节点 ID：连接树上的逻辑位置，重连后保持不变
///
/// 与 ConnectionId 解耦：一个节点的物理连接可以被替换（重连产生新
/// ConnectionId），但 NodeId 在整棵树的生命周期内稳定。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// 生成随机节点 ID（UUID v4）
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 连接 ID：一次已协商的物理连接实例，重连后作废并被新 ID 取代
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 每节点单调递增的版本号，由连接池（权威侧）分配
///
/// 客户端只比较、从不分配。0 表示"从未收到任何更新"。
pub type Generation = u64;

// ============================================================================
// Node Readiness
// ============================================================================

/// 节点就绪状态
///
/// 序列化为 snake_case 字符串: "disconnected" | "connecting" | "active" |
/// "idle" | "link_down" | "reconnecting" | "disconnecting" | "error"
///
/// 错误详情通过 NodeState.error 或 NodeStateEvent.reason 传递。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeReadiness {
    /// 已断开（初始状态 / 用户显式断开）
    Disconnected,
    /// 正在建立连接
    Connecting,
    /// 完全就绪，可执行所有操作
    Active,
    /// 就绪但空闲
    Idle,
    /// 底层连接疑似失联（尚未被用户断开）
    LinkDown,
    /// 正在重连
    Reconnecting,
    /// 正在断开
    Disconnecting,
    /// 连接错误（详情见 NodeState.error）
    Error,
}

impl NodeReadiness {
    /// 可执行操作的状态（SFTP / exec / 终端挂载）
    pub fn is_operable(&self) -> bool {
        matches!(self, NodeReadiness::Active | NodeReadiness::Idle)
    }

    /// 过渡状态：等待有望收敛到 operable
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            NodeReadiness::Connecting
                | NodeReadiness::LinkDown
                | NodeReadiness::Reconnecting
                | NodeReadiness::Disconnecting
        )
    }

    /// 终态：不再自发恢复，需要用户介入
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeReadiness::Disconnected | NodeReadiness::Error)
    }
}

// ============================================================================
// Terminal Endpoint
// ============================================================================

/// 终端 WebSocket 端点信息（重连后 port/token 可能变化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEndpoint {
    pub port: u16,
    pub token: String,
    pub session_id: String,
}

// ============================================================================
// Node State (前端消费)
// ============================================================================

/// 节点完整状态（useNodeState 消费）
///
/// 不变式：sftp_ready / sftp_cwd / terminal_endpoint 仅在 readiness 为
/// active/idle 时有意义，切换到其他状态时一并清空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub readiness: NodeReadiness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sftp_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp_cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_endpoint: Option<TerminalEndpoint>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            readiness: NodeReadiness::Disconnected,
            error: None,
            sftp_ready: false,
            sftp_cwd: None,
            terminal_endpoint: None,
        }
    }
}

impl NodeState {
    /// 切换就绪状态并维护依赖字段的清空不变式
    pub fn set_readiness(&mut self, readiness: NodeReadiness, reason: Option<String>) {
        self.readiness = readiness;
        self.error = if readiness == NodeReadiness::Error {
            reason.or_else(|| Some("unknown error".to_string()))
        } else {
            None
        };
        if !readiness.is_operable() {
            self.sftp_ready = false;
            self.sftp_cwd = None;
            self.terminal_endpoint = None;
        }
    }

    /// 应用一条增量更新（合并规则见 NodeStateStore）
    pub fn apply_delta(&mut self, delta: StateDelta) {
        match delta {
            StateDelta::Readiness { readiness, reason } => {
                self.set_readiness(readiness, reason);
            }
            StateDelta::SftpChannel { ready, cwd } => {
                self.sftp_ready = ready;
                self.sftp_cwd = cwd;
            }
            StateDelta::TerminalEndpoint { endpoint } => {
                self.terminal_endpoint = endpoint;
            }
        }
    }
}

/// 状态 + 当前 generation（快照对齐）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateSnapshot {
    pub state: NodeState,
    pub generation: Generation,
}

/// 单条状态增量（NodeStateEvent 解包后的内部表示）
#[derive(Debug, Clone, PartialEq)]
pub enum StateDelta {
    Readiness {
        readiness: NodeReadiness,
        reason: Option<String>,
    },
    SftpChannel {
        ready: bool,
        cwd: Option<String>,
    },
    TerminalEndpoint {
        endpoint: Option<TerminalEndpoint>,
    },
}

// ============================================================================
// Node State Event (连接池推送，按节点定序)
// ============================================================================

/// 连接池的节点级状态变更事件（取代 refreshConnections 轮询）
///
/// 有序性保证：每个事件携带 generation（每节点单调递增计数器），
/// 客户端必须丢弃 generation <= 已见最大值的事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeStateEvent {
    /// 连接状态变更
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        node_id: NodeId,
        generation: Generation,
        readiness: NodeReadiness,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// SFTP 就绪状态变更
    #[serde(rename_all = "camelCase")]
    SftpReady {
        node_id: NodeId,
        generation: Generation,
        ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// 终端 WebSocket 信息变更（重连后 port/token 可能变化）
    #[serde(rename_all = "camelCase")]
    TerminalEndpointChanged {
        node_id: NodeId,
        generation: Generation,
        port: u16,
        token: String,
        session_id: String,
    },
}

impl NodeStateEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            NodeStateEvent::ConnectionStateChanged { node_id, .. } => node_id,
            NodeStateEvent::SftpReady { node_id, .. } => node_id,
            NodeStateEvent::TerminalEndpointChanged { node_id, .. } => node_id,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            NodeStateEvent::ConnectionStateChanged { generation, .. } => *generation,
            NodeStateEvent::SftpReady { generation, .. } => *generation,
            NodeStateEvent::TerminalEndpointChanged { generation, .. } => *generation,
        }
    }

    /// 解包为 (node_id, generation, delta)
    pub fn into_delta(self) -> (NodeId, Generation, StateDelta) {
        match self {
            NodeStateEvent::ConnectionStateChanged {
                node_id,
                generation,
                readiness,
                reason,
            } => (node_id, generation, StateDelta::Readiness { readiness, reason }),
            NodeStateEvent::SftpReady {
                node_id,
                generation,
                ready,
                cwd,
            } => (node_id, generation, StateDelta::SftpChannel { ready, cwd }),
            NodeStateEvent::TerminalEndpointChanged {
                node_id,
                generation,
                port,
                token,
                session_id,
            } => (
                node_id,
                generation,
                StateDelta::TerminalEndpoint {
                    endpoint: Some(TerminalEndpoint {
                        port,
                        token,
                        session_id,
                    }),
                },
            ),
        }
    }
}

// ============================================================================
// Connection Status Event (连接池推送，连接级)
// ============================================================================

/// 连接级状态
///
/// 注意与 NodeReadiness 的区分：这是物理连接的三态摘要，
/// 节点级的细分状态走 NodeStateEvent。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    LinkDown,
    Disconnected,
}

/// 连接级状态变更事件
///
/// affected_children 是连接池对受影响子连接的**提示**（可能不完整），
/// 权威的波及范围由 TopologyResolver 沿树边计算。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusEvent {
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub affected_children: Vec<ConnectionId>,
    /// Unix 毫秒时间戳
    pub timestamp: u64,
}

impl ConnectionStatusEvent {
    pub fn now(
        connection_id: ConnectionId,
        status: ConnectionStatus,
        affected_children: Vec<ConnectionId>,
    ) -> Self {
        Self {
            connection_id,
            status,
            affected_children,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        }
    }
}
