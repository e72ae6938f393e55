//! In-process stand-in for the mesh library.
//!
//! Several [`SimulatedMesh`] nodes share one [`SimAir`]. Nodes that joined
//! with the same mesh prefix and password see each other, and broadcasts
//! reach every such peer on its next `update`. The air can also host
//! upstream access points, which give out the station IP a node reports
//! once its station task has associated.
//!
//! Only the backend contract is modelled. There is no routing, time sync or
//! retransmission here.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Result};
use common::{DebugMsgType, DebugMsgTypes, NodeId, WifiMode};
use log::{debug, error};

use crate::backend::{ChangedConnectionsCallback, MeshBackend, ReceivedCallback};
use crate::scheduler::{Iterations, Scheduler};

pub const DEFAULT_ASSOCIATION_INTERVAL: Duration = Duration::from_secs(1);

type Inbox = Rc<RefCell<VecDeque<(NodeId, String)>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Credentials {
    prefix: String,
    password: String,
}

struct Member {
    id: NodeId,
    credentials: Credentials,
    inbox: Inbox,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub password: String,
    /// Address leased to any station that associates
    pub lease: Ipv4Addr,
}

#[derive(Default)]
struct AirState {
    // Join order, so node lists come back unsorted like the real library's
    members: Vec<Member>,
    access_points: Vec<AccessPoint>,
}

/// Shared medium connecting simulated nodes and access points
#[derive(Clone, Default)]
pub struct SimAir {
    state: Rc<RefCell<AirState>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_access_point(&self, ssid: &str, password: &str, lease: Ipv4Addr) {
        let mut state = self.state.borrow_mut();
        state.access_points.retain(|ap| ap.ssid != ssid);
        state.access_points.push(AccessPoint {
            ssid: ssid.to_string(),
            password: password.to_string(),
            lease,
        });
    }

    pub fn remove_access_point(&self, ssid: &str) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.access_points.len();
        state.access_points.retain(|ap| ap.ssid != ssid);
        state.access_points.len() != before
    }

    pub fn member_count(&self) -> usize {
        self.state.borrow().members.len()
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.state.borrow().members.iter().any(|m| m.id == id)
    }

    fn join(&self, member: Member) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.members.iter().any(|m| m.id == member.id) {
            bail!("Node {} is already on the air", member.id);
        }
        state.members.push(member);
        Ok(())
    }

    fn leave(&self, id: NodeId) {
        self.state.borrow_mut().members.retain(|m| m.id != id);
    }

    fn peers(&self, id: NodeId, credentials: &Credentials) -> Vec<NodeId> {
        self.state
            .borrow()
            .members
            .iter()
            .filter(|m| m.id != id && m.credentials == *credentials)
            .map(|m| m.id)
            .collect()
    }

    /// Queue `message` on every matching inbox. Returns the recipient count.
    fn deliver(
        &self,
        from: NodeId,
        credentials: &Credentials,
        message: &str,
        include_self: bool,
    ) -> usize {
        let state = self.state.borrow();
        let mut delivered = 0;

        for member in state.members.iter() {
            if member.credentials != *credentials || (member.id == from && !include_self) {
                continue;
            }
            member
                .inbox
                .borrow_mut()
                .push_back((from, message.to_string()));
            delivered += 1;
        }

        delivered
    }

    fn lease_for(&self, ssid: &str, password: &str) -> Option<Ipv4Addr> {
        self.state
            .borrow()
            .access_points
            .iter()
            .find(|ap| ap.ssid == ssid && ap.password == password)
            .map(|ap| ap.lease)
    }
}

#[derive(Default)]
struct Station {
    credentials: Option<(String, String)>,
    ip: Option<Ipv4Addr>,
}

/// AP address painlessMesh derives from a node id: `10.<id[15:8]>.<id[7:0]>.1`
pub fn ap_ip_for(node_id: NodeId) -> Ipv4Addr {
    Ipv4Addr::new(10, ((node_id >> 8) & 0xFF) as u8, (node_id & 0xFF) as u8, 1)
}

fn log_enabled(types: DebugMsgTypes, ty: DebugMsgType, args: fmt::Arguments) {
    if !types.enables(ty) {
        return;
    }
    match ty {
        DebugMsgType::Error => error!(target: "mesh", "{}: {}", ty, args),
        _ => debug!(target: "mesh", "{}: {}", ty, args),
    }
}

pub struct SimulatedMesh {
    air: SimAir,
    node_id: NodeId,
    debug_types: DebugMsgTypes,
    credentials: Option<Credentials>,
    hostname: Option<String>,
    ap_ip: Ipv4Addr,
    station: Rc<RefCell<Station>>,
    inbox: Inbox,
    known_peers: Vec<NodeId>,
    received_cb: Option<ReceivedCallback>,
    changed_cb: Option<ChangedConnectionsCallback>,
    association_interval: Duration,
}

impl SimulatedMesh {
    pub fn new(air: SimAir, node_id: NodeId) -> Self {
        Self {
            air,
            node_id,
            debug_types: DebugMsgTypes::ERROR,
            credentials: None,
            hostname: None,
            ap_ip: Ipv4Addr::UNSPECIFIED,
            station: Rc::new(RefCell::new(Station::default())),
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            known_peers: Vec::new(),
            received_cb: None,
            changed_cb: None,
            association_interval: DEFAULT_ASSOCIATION_INTERVAL,
        }
    }

    /// Node with a random non-zero id that is not yet on the air
    pub fn with_random_id(air: SimAir) -> Self {
        let node_id = loop {
            let candidate: NodeId = rand::random();
            if candidate != 0 && !air.is_member(candidate) {
                break candidate;
            }
        };
        Self::new(air, node_id)
    }

    /// Period of the station association task registered by `init`
    pub fn with_association_interval(mut self, interval: Duration) -> Self {
        self.association_interval = interval;
        self
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.credentials.is_some()
    }

    /// Drop off the mesh. Peers see a topology change on their next update.
    pub fn leave(&mut self) {
        if self.credentials.take().is_some() {
            self.air.leave(self.node_id);
            self.log(DebugMsgType::Connection, format_args!("Node {} left the mesh", self.node_id));
        }
        let mut station = self.station.borrow_mut();
        station.credentials = None;
        station.ip = None;
    }

    fn log(&self, ty: DebugMsgType, args: fmt::Arguments) {
        log_enabled(self.debug_types, ty, args);
    }
}

impl MeshBackend for SimulatedMesh {
    fn set_debug_msg_types(&mut self, types: DebugMsgTypes) {
        self.debug_types = types;
    }

    fn init(
        &mut self,
        prefix: &str,
        password: &str,
        port: u16,
        mode: WifiMode,
        channel: u8,
        scheduler: &mut Scheduler,
    ) -> Result<()> {
        if self.credentials.is_some() {
            bail!("Mesh node {} is already initialised", self.node_id);
        }

        let credentials = Credentials {
            prefix: prefix.to_string(),
            password: password.to_string(),
        };
        self.air.join(Member {
            id: self.node_id,
            credentials: credentials.clone(),
            inbox: self.inbox.clone(),
        })?;
        self.credentials = Some(credentials);

        self.ap_ip = match mode {
            WifiMode::Sta => Ipv4Addr::UNSPECIFIED,
            WifiMode::Ap | WifiMode::ApSta => ap_ip_for(self.node_id),
        };

        self.log(
            DebugMsgType::Startup,
            format_args!(
                "init(): node {} on mesh '{}' port {} channel {} mode {:?}",
                self.node_id, prefix, port, channel, mode
            ),
        );

        let air = self.air.clone();
        let station = self.station.clone();
        let debug_types = self.debug_types;
        scheduler.add_task(
            "station",
            self.association_interval,
            Iterations::Forever,
            move || {
                let mut station = station.borrow_mut();
                let lease = station
                    .credentials
                    .as_ref()
                    .and_then(|(ssid, password)| air.lease_for(ssid, password));

                if lease != station.ip {
                    match lease {
                        Some(ip) => log_enabled(
                            debug_types,
                            DebugMsgType::Connection,
                            format_args!("Station associated, got {}", ip),
                        ),
                        None => log_enabled(
                            debug_types,
                            DebugMsgType::Connection,
                            format_args!("Station lost its upstream access point"),
                        ),
                    }
                    station.ip = lease;
                }
            },
        );

        Ok(())
    }

    fn station_manual(&mut self, ssid: &str, password: &str) {
        self.log(
            DebugMsgType::Startup,
            format_args!("stationManual(): connecting to '{}'", ssid),
        );
        self.station.borrow_mut().credentials = Some((ssid.to_string(), password.to_string()));
    }

    fn set_hostname(&mut self, hostname: &str) {
        self.hostname = Some(hostname.to_string());
    }

    fn ap_ip(&self) -> Ipv4Addr {
        self.ap_ip
    }

    fn station_ip(&self) -> Ipv4Addr {
        self.station.borrow().ip.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn node_id(&self) -> NodeId {
        if self.is_initialized() {
            self.node_id
        } else {
            0
        }
    }

    fn node_list(&self) -> Vec<NodeId> {
        match self.credentials.as_ref() {
            Some(credentials) => self.air.peers(self.node_id, credentials),
            None => Vec::new(),
        }
    }

    fn send_broadcast(&mut self, message: &str, include_self: bool) -> bool {
        let Some(credentials) = self.credentials.as_ref() else {
            self.log(DebugMsgType::Error, format_args!("sendBroadcast(): mesh not initialised"));
            return false;
        };

        let delivered = self
            .air
            .deliver(self.node_id, credentials, message, include_self);
        self.log(
            DebugMsgType::Communication,
            format_args!("sendBroadcast(): {} bytes to {} node(s)", message.len(), delivered),
        );

        delivered > 0
    }

    fn on_receive(&mut self, callback: ReceivedCallback) {
        self.received_cb = Some(callback);
    }

    fn on_changed_connections(&mut self, callback: ChangedConnectionsCallback) {
        self.changed_cb = Some(callback);
    }

    fn update(&mut self) {
        if !self.is_initialized() {
            return;
        }

        let peers = self.node_list();
        let mut current = peers.clone();
        current.sort_unstable();
        let mut known = self.known_peers.clone();
        known.sort_unstable();

        if current != known {
            self.log(
                DebugMsgType::Connection,
                format_args!("Changed connections: {} peer(s)", peers.len()),
            );
            self.known_peers = peers.clone();
            if let Some(callback) = self.changed_cb.as_mut() {
                callback(&peers);
            }
        }

        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some((from, message)) = next else {
                break;
            };

            self.log(
                DebugMsgType::Communication,
                format_args!("Received {} bytes from {}", message.len(), from),
            );
            if let Some(callback) = self.received_cb.as_mut() {
                callback(from, &message);
            }
        }
    }
}

impl Drop for SimulatedMesh {
    fn drop(&mut self) {
        if self.credentials.is_some() {
            self.air.leave(self.node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn node(air: &SimAir, id: NodeId, scheduler: &mut Scheduler) -> SimulatedMesh {
        let mut mesh = SimulatedMesh::new(air.clone(), id);
        mesh.init("meshPrefix", "meshPassword", 5555, WifiMode::ApSta, 6, scheduler)
            .unwrap();
        mesh
    }

    #[test]
    fn test_uninitialised_node_is_empty() {
        let mut mesh = SimulatedMesh::new(SimAir::new(), 42);
        assert_eq!(mesh.node_id(), 0);
        assert!(mesh.node_list().is_empty());
        assert_eq!(mesh.station_ip(), Ipv4Addr::UNSPECIFIED);
        assert!(!mesh.send_broadcast("hi", false));
    }

    #[test]
    fn test_node_list_keeps_join_order() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let gateway = node(&air, 100, &mut scheduler);
        let _peers: Vec<_> = [7, 3, 19, 1]
            .into_iter()
            .map(|id| node(&air, id, &mut scheduler))
            .collect();

        assert_eq!(gateway.node_id(), 100);
        assert_eq!(gateway.node_list(), vec![7, 3, 19, 1]);
        assert_eq!(gateway.ap_ip(), Ipv4Addr::new(10, 0, 100, 1));
    }

    #[test]
    fn test_different_mesh_is_invisible() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let gateway = node(&air, 1, &mut scheduler);

        let mut stranger = SimulatedMesh::new(air.clone(), 2);
        stranger
            .init("otherMesh", "meshPassword", 5555, WifiMode::ApSta, 6, &mut scheduler)
            .unwrap();

        assert!(gateway.node_list().is_empty());
        assert_eq!(air.member_count(), 2);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let _first = node(&air, 5, &mut scheduler);

        let mut second = SimulatedMesh::new(air.clone(), 5);
        assert!(second
            .init("meshPrefix", "meshPassword", 5555, WifiMode::ApSta, 6, &mut scheduler)
            .is_err());
    }

    #[test]
    fn test_broadcast_delivery() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let mut sender = node(&air, 1, &mut scheduler);
        let mut receiver = node(&air, 2, &mut scheduler);

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        receiver.on_receive(Box::new(move |from, msg| {
            sink.borrow_mut().push((from, msg.to_string()))
        }));

        let echoed = Rc::new(RefCell::new(Vec::new()));
        let sink = echoed.clone();
        sender.on_receive(Box::new(move |from, msg| {
            sink.borrow_mut().push((from, msg.to_string()))
        }));

        assert!(sender.send_broadcast("hello", false));
        sender.update();
        receiver.update();

        assert_eq!(*received.borrow(), vec![(1, "hello".to_string())]);
        assert!(echoed.borrow().is_empty());

        sender.send_broadcast("me too", true);
        sender.update();
        assert_eq!(*echoed.borrow(), vec![(1, "me too".to_string())]);
    }

    #[test]
    fn test_broadcast_to_nobody() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let mut lonely = node(&air, 1, &mut scheduler);
        assert!(!lonely.send_broadcast("anyone?", false));
    }

    #[test]
    fn test_topology_callback_fires_on_change_only() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let mut gateway = node(&air, 10, &mut scheduler);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        gateway.on_changed_connections(Box::new(move |nodes| {
            sink.borrow_mut().push(nodes.to_vec())
        }));

        gateway.update();
        assert!(seen.borrow().is_empty());

        let mut peer = node(&air, 20, &mut scheduler);
        gateway.update();
        gateway.update();
        assert_eq!(*seen.borrow(), vec![vec![20]]);

        peer.leave();
        gateway.update();
        assert_eq!(*seen.borrow(), vec![vec![20], vec![]]);

        {
            let _late = node(&air, 30, &mut scheduler);
            gateway.update();
        }
        // Dropping a node takes it off the air
        gateway.update();
        assert_eq!(seen.borrow().len(), 4);
        assert_eq!(seen.borrow()[3], Vec::<NodeId>::new());
    }

    #[test]
    fn test_station_association_follows_access_point() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let mut gateway = SimulatedMesh::new(air.clone(), 1)
            .with_association_interval(Duration::from_millis(10));
        gateway
            .init("meshPrefix", "meshPassword", 5555, WifiMode::ApSta, 6, &mut scheduler)
            .unwrap();
        gateway.station_manual("upstream", "secret");

        let mut now = Instant::now();
        let mut tick = |scheduler: &mut Scheduler| {
            now += Duration::from_millis(20);
            scheduler.execute_at(now);
        };

        tick(&mut scheduler);
        assert_eq!(gateway.station_ip(), Ipv4Addr::UNSPECIFIED);

        air.add_access_point("upstream", "secret", Ipv4Addr::new(192, 168, 1, 50));
        tick(&mut scheduler);
        assert_eq!(gateway.station_ip(), Ipv4Addr::new(192, 168, 1, 50));

        air.remove_access_point("upstream");
        tick(&mut scheduler);
        assert_eq!(gateway.station_ip(), Ipv4Addr::UNSPECIFIED);

        // Wrong password never associates
        air.add_access_point("upstream", "other", Ipv4Addr::new(192, 168, 1, 51));
        tick(&mut scheduler);
        assert_eq!(gateway.station_ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_random_ids_are_unique_and_non_zero() {
        let air = SimAir::new();
        let mut scheduler = Scheduler::new();
        let mut nodes = Vec::new();
        for _ in 0..8 {
            let mut mesh = SimulatedMesh::with_random_id(air.clone());
            mesh.init("meshPrefix", "meshPassword", 5555, WifiMode::ApSta, 6, &mut scheduler)
                .unwrap();
            assert_ne!(mesh.node_id(), 0);
            nodes.push(mesh);
        }
        assert_eq!(air.member_count(), 8);
    }
}
