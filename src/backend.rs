//! Contract between the network facade and the mesh library it wraps.
//!
//! Everything behind this trait (topology maintenance, time sync, routing,
//! retransmission) belongs to the backend. The facade only configures it,
//! pumps it and reads from it.

use std::net::Ipv4Addr;

use anyhow::Result;
use common::{DebugMsgTypes, NodeId, WifiMode};

use crate::scheduler::Scheduler;

/// Invoked for every message delivered to this node
pub type ReceivedCallback = Box<dyn FnMut(NodeId, &str)>;

/// Invoked when the set of connected nodes changes, with the new
/// (unordered) set
pub type ChangedConnectionsCallback = Box<dyn FnMut(&[NodeId])>;

pub trait MeshBackend {
    /// Must be set before `init` to see startup output
    fn set_debug_msg_types(&mut self, types: DebugMsgTypes);

    fn init(
        &mut self,
        prefix: &str,
        password: &str,
        port: u16,
        mode: WifiMode,
        channel: u8,
        scheduler: &mut Scheduler,
    ) -> Result<()>;

    /// Connect the station interface to a fixed upstream access point
    fn station_manual(&mut self, ssid: &str, password: &str);

    fn set_hostname(&mut self, hostname: &str);

    fn ap_ip(&self) -> Ipv4Addr;

    /// `0.0.0.0` while the station link has no lease
    fn station_ip(&self) -> Ipv4Addr;

    fn node_id(&self) -> NodeId;

    /// Currently connected nodes, excluding this one. No ordering.
    fn node_list(&self) -> Vec<NodeId>;

    /// Queue a message for every node. Returns whether it was handed to at
    /// least one connection; delivery is not acknowledged.
    fn send_broadcast(&mut self, message: &str, include_self: bool) -> bool;

    /// Replaces any previously registered receive callback
    fn on_receive(&mut self, callback: ReceivedCallback);

    /// Replaces any previously registered topology callback
    fn on_changed_connections(&mut self, callback: ChangedConnectionsCallback);

    /// Service protocol timers and deliver pending messages. Never blocks.
    fn update(&mut self);
}
