//! Mesh network facade for the gateway node.
//!
//! Wraps a [`MeshBackend`] and the device services. Configures the backend
//! once, pumps it from the run loop and keeps the captive DNS responder
//! pointed at whatever station IP the device currently has.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use common::{NodeId, WifiMode, MESH_PORT};
use log::{debug, info, warn};

use crate::backend::MeshBackend;
use crate::config::Config;
use crate::device::{
    portal_channel, CaptiveDns, DeviceContext, PortalEvent, PortalReceiver, PortalSender, WebPortal,
};
use crate::dns::DnsServer;
use crate::portal::PortalServer;
use crate::scheduler::Scheduler;

/// String form of the station IP before any lease
const NO_IP: &str = "0.0.0.0";

/// Prefix put in front of text coming from the web form
const PORTAL_BROADCAST_PREFIX: &str = "REQST ";

pub type TopologyHandler = Box<dyn FnMut(&[NodeId])>;

/// Default receive callback
pub fn received_cb(transmitter: NodeId, msg: &str) {
    info!("Data received from node: {}; msg: {}", transmitter, msg);
}

fn refresh_nodes(
    nodes_present: &RefCell<Vec<NodeId>>,
    subscriber: &RefCell<Option<TopologyHandler>>,
    nodes: &[NodeId],
) {
    info!("Connections Changed");

    let mut sorted = nodes.to_vec();
    sorted.sort_unstable();
    *nodes_present.borrow_mut() = sorted.clone();

    if let Some(handler) = subscriber.borrow_mut().as_mut() {
        handler(&sorted);
    }
}

pub struct MeshNetwork<M, D = DnsServer, W = PortalServer> {
    mesh: M,
    device: DeviceContext<D, W>,
    config: Config,
    cur_ip: String,
    nodes_present: Rc<RefCell<Vec<NodeId>>>,
    topology_handler: Rc<RefCell<Option<TopologyHandler>>>,
    portal_tx: PortalSender,
    portal_rx: PortalReceiver,
}

impl<M, D, W> MeshNetwork<M, D, W>
where
    M: MeshBackend,
    D: CaptiveDns,
    W: WebPortal,
{
    pub const PORT: u16 = MESH_PORT;

    /// Construct only. Call [`MeshNetwork::initialize`] once logging is up
    /// so the startup output is visible.
    pub fn new(mut mesh: M, device: DeviceContext<D, W>, config: Config) -> Self {
        let nodes_present = Rc::new(RefCell::new(Vec::new()));
        let topology_handler: Rc<RefCell<Option<TopologyHandler>>> = Rc::new(RefCell::new(None));

        mesh.on_receive(Box::new(received_cb));

        let cache = nodes_present.clone();
        let subscriber = topology_handler.clone();
        mesh.on_changed_connections(Box::new(move |nodes| {
            refresh_nodes(&cache, &subscriber, nodes)
        }));

        let (portal_tx, portal_rx) = portal_channel();

        Self {
            mesh,
            device,
            config,
            cur_ip: NO_IP.to_string(),
            nodes_present,
            topology_handler,
            portal_tx,
            portal_rx,
        }
    }

    pub fn initialize(
        &mut self,
        prefix: &str,
        password: &str,
        scheduler: &mut Scheduler,
    ) -> Result<()> {
        self.device.dns.set_ttl(self.config.dns.ttl);
        self.device
            .dns
            .set_error_reply_code(self.config.dns.error_reply_code);

        // Before init() so that the startup messages show up
        let debug_types = self.config.mesh.debug_msg_types();
        info!("Mesh debug output: {}", debug_types);
        self.mesh.set_debug_msg_types(debug_types);

        self.mesh
            .init(
                prefix,
                password,
                self.config.mesh.port,
                WifiMode::ApSta,
                self.config.mesh.channel,
                scheduler,
            )
            .context("Failed to initialise mesh")?;
        self.mesh
            .station_manual(&self.config.station.ssid, &self.config.station.password);
        self.mesh.set_hostname(&self.config.mesh.hostname);

        info!(
            "Mesh node {} up, AP IP {}",
            self.mesh.node_id(),
            self.mesh.ap_ip()
        );

        self.device
            .portal
            .begin(self.portal_tx.clone())
            .context("Failed to start web portal")?;

        Ok(())
    }

    /// Pump the backend and follow station IP changes. Call from the run
    /// loop as often as possible; never blocks.
    pub fn update(&mut self) {
        self.mesh.update();

        let new_ip = self.mesh.station_ip();
        let str_ip = new_ip.to_string();
        if str_ip != self.cur_ip {
            info!("{}", str_ip);
            self.cur_ip = str_ip;
            if self.cur_ip != NO_IP {
                self.device.dns.stop();
            }
            if let Err(e) =
                self.device
                    .dns
                    .start(self.config.dns.port, &self.config.dns.domain, new_ip)
            {
                warn!("Failed to start DNS responder: {:#}", e);
            }
        }

        if let Err(e) = self.device.dns.process_next_request() {
            warn!("DNS request failed: {:#}", e);
        }

        while let Ok(event) = self.portal_rx.try_recv() {
            match event {
                PortalEvent::Broadcast(msg) => {
                    let message = format!("{}{}", PORTAL_BROADCAST_PREFIX, msg);
                    if !self.send_broadcast(&message) {
                        debug!("Portal broadcast reached no nodes");
                    }
                }
            }
        }
    }

    /// Fire-and-forget broadcast to every other node
    pub fn send_broadcast(&mut self, message: &str) -> bool {
        debug!("Broadcasting message: {}", message);
        self.mesh.send_broadcast(message, false)
    }

    pub fn my_node_id(&self) -> NodeId {
        self.mesh.node_id()
    }

    pub fn node_list(&self) -> Vec<NodeId> {
        self.mesh.node_list()
    }

    /// Fresh ascending copy of the node list
    pub fn sorted_node_vector(&self) -> Vec<NodeId> {
        let mut nodes = self.node_list();
        nodes.sort_unstable();
        nodes
    }

    /// Node list as of the last topology change
    pub fn nodes_present(&self) -> Vec<NodeId> {
        self.nodes_present.borrow().clone()
    }

    /// Replace the receive callback, including the default logger
    pub fn on_receive<F>(&mut self, callback: F)
    where
        F: FnMut(NodeId, &str) + 'static,
    {
        self.mesh.on_receive(Box::new(callback));
    }

    /// Run `handler` with the sorted node list after each topology change
    pub fn on_topology_changed<F>(&mut self, handler: F)
    where
        F: FnMut(&[NodeId]) + 'static,
    {
        *self.topology_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Recompute the cached node list from the backend
    pub fn changed_cb(&self) {
        refresh_nodes(
            &self.nodes_present,
            &self.topology_handler,
            &self.mesh.node_list(),
        );
    }

    /// Station IP as last seen by `update`
    pub fn station_ip(&self) -> &str {
        &self.cur_ip
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut M {
        &mut self.mesh
    }

    pub fn device(&self) -> &DeviceContext<D, W> {
        &self.device
    }
}
