use std::time::Duration;

use anyhow::Result;
use log::info;
use mesh_portal::logging;
use mesh_portal::prelude::*;

/// How often the first simulated peer says hello
const PEER_GREETING_PERIOD: Duration = Duration::from_secs(15);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE.to_string());
    let mut config = Config::load_or_default(&path)?;
    config.apply_env_overrides();

    logging::init(&config.logging.filter)?;
    info!("Starting mesh gateway with config '{}'", path);

    // No radio on this host, so the mesh and the upstream router are simulated
    let air = SimAir::new();
    if let Some(lease) = config.simulation.upstream_lease {
        air.add_access_point(&config.station.ssid, &config.station.password, lease);
    }

    let gateway = match config.simulation.node_id {
        Some(id) => SimulatedMesh::new(air.clone(), id),
        None => SimulatedMesh::with_random_id(air.clone()),
    }
    .with_association_interval(config.simulation.association_interval());

    let device = DeviceContext::new(
        DnsServer::with_bind_ip(config.dns.bind),
        PortalServer::new(config.portal.addr(), config.portal.forward_broadcasts),
    );

    let prefix = config.mesh.prefix.clone();
    let password = config.mesh.password.clone();
    let peer_count = config.simulation.peers;
    let update_interval = config.simulation.update_interval();

    let mut scheduler = Scheduler::new();
    let mut network = MeshNetwork::new(gateway, device, config);
    network.on_topology_changed(|nodes| {
        info!("Mesh now has {} other node(s): {:?}", nodes.len(), nodes)
    });
    network.initialize(&prefix, &password, &mut scheduler)?;

    let mut peers = Vec::new();
    for _ in 0..peer_count {
        let mut peer = SimulatedMesh::with_random_id(air.clone());
        peer.init(
            &prefix,
            &password,
            MESH_PORT,
            WifiMode::ApSta,
            MESH_CHANNEL,
            &mut scheduler,
        )?;
        let id = peer.node_id();
        peer.on_receive(Box::new(move |from, msg| {
            info!("Peer {} got '{}' from {}", id, msg, from)
        }));
        peers.push(peer);
    }

    let mut tick = tokio::time::interval(update_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut greeting = tokio::time::interval(PEER_GREETING_PERIOD);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                scheduler.execute();
                network.update();
                for peer in peers.iter_mut() {
                    peer.update();
                }
            }
            _ = greeting.tick() => {
                if let Some(peer) = peers.first_mut() {
                    let message = format!("hello from {}", peer.node_id());
                    peer.send_broadcast(&message, false);
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
