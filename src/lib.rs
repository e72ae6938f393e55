pub mod backend;
pub mod config;
pub mod device;
pub mod dns;
pub mod logging;
pub mod network;
pub mod portal;
pub mod scheduler;
pub mod sim;

pub use common::{DebugMsgType, DebugMsgTypes, NodeId, WifiMode};

pub mod prelude {
    pub use crate::{
        backend::*, config::*, device::*, dns::DnsServer, network::*, portal::PortalServer,
        scheduler::*, sim::*,
    };
    pub use common::{DebugMsgType, DebugMsgTypes, NodeId, WifiMode, MESH_CHANNEL, MESH_PORT};
}
