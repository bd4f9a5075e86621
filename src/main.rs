//! Ringcast demo: in-memory announcement run.
//!
//! Builds a small opennet of in-memory nodes, then has a newcomer
//! announce itself toward a target location through a single seed node.
//! Every reply noderef the newcomer collects is printed as it arrives.

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ringcast::{
    AnnounceConfig, Announcer, CallbackEvent, ChannelCallback, HtlPolicy, Location, MemoryHub,
    MessageRouter, NodeContext, NodeRef, Peer, PeerId, PeerTable, PoolConfig, TempBucketPool,
};
use std::sync::Arc;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ringcast", version, about = "Ringcast: announcement demo")]
struct Args {
    /// Established opennet nodes to simulate
    #[arg(short, long, default_value = "8")]
    nodes: usize,

    /// Target location in [0,1); random if not set
    #[arg(short, long)]
    target: Option<f64>,

    /// RNG seed for reproducible topologies
    #[arg(short, long, default_value = "7")]
    seed: u64,

    /// Maximum hops-to-live
    #[arg(long, default_value = "10")]
    max_htl: u16,
}

fn build_node(
    hub: &MemoryHub,
    id: PeerId,
    location: Location,
    cfg: &AnnounceConfig,
) -> (Announcer<ringcast::MemoryTransport>, PeerTable) {
    let (transport, events) = hub.register(id);
    let (router, requests) = MessageRouter::start(Arc::new(transport), events);
    let peers = PeerTable::new();
    let ctx = NodeContext {
        router,
        peers: peers.clone(),
        pool: TempBucketPool::new(PoolConfig::default()),
        cfg: cfg.clone(),
        htl: HtlPolicy::new(cfg),
        my_ref: NodeRef::new(id, location, Vec::new()),
        opennet_enabled: true,
    };
    (Announcer::start(ctx, requests), peers)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringcast=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let target = args
        .target
        .and_then(Location::new)
        .unwrap_or_else(|| Location::random(&mut rng));

    info!("ringcast {}: {} nodes, target {}", VERSION, args.nodes, target);

    let cfg = AnnounceConfig {
        max_htl: args.max_htl,
        ..AnnounceConfig::default()
    };
    let hub = MemoryHub::new();

    // Established nodes in a full mesh.
    let mut nodes = Vec::new();
    for i in 0..args.nodes {
        let id = PeerId(i as u64 + 1);
        let location = Location::random(&mut rng);
        let (announcer, peers) = build_node(&hub, id, location, &cfg);
        nodes.push((id, location, announcer, peers));
    }
    for (id, _, _, peers) in &nodes {
        for (other_id, other_loc, _, _) in &nodes {
            if other_id != id {
                hub.connect(*id, *other_id);
                peers.insert(Peer::new(*other_id, *other_loc));
            }
        }
    }

    // The newcomer knows exactly one seed node.
    let newcomer_id = PeerId(1000);
    let newcomer_loc = Location::random(&mut rng);
    let (newcomer, newcomer_peers) = build_node(&hub, newcomer_id, newcomer_loc, &cfg);
    let (seed_id, seed_loc) = (nodes[0].0, nodes[0].1);
    hub.connect(newcomer_id, seed_id);
    newcomer_peers.insert(Peer::new(seed_id, seed_loc));

    info!(
        "newcomer {} at {} announcing via seed {}",
        newcomer_id, newcomer_loc, seed_id
    );

    let (callback, mut events) = ChannelCallback::new();
    let uid = newcomer.spawn_local(target, callback, None);

    let mut added = 0;
    while let Some(event) = events.recv().await {
        match event {
            CallbackEvent::AddedNode(peer) => {
                added += 1;
                println!("  + gained peer {}", peer);
            }
            CallbackEvent::NodeNotAdded => println!("  - reply refused (table full)"),
            CallbackEvent::NodeNotWanted => println!("  - a hop did not want us"),
            CallbackEvent::NodeFailed(peer, reason) => {
                println!("  ! hop {} failed: {}", peer, reason)
            }
            CallbackEvent::BogusNoderef(reason) => println!("  ! bogus reply: {}", reason),
            CallbackEvent::NoMoreNodes => println!("  ! ran out of routes"),
            CallbackEvent::Completed => {
                println!(
                    "announcement {} complete: {} new peers, {} known in total",
                    uid,
                    added,
                    newcomer_peers.len()
                );
                break;
            }
        }
    }
}
