//! Tessella demo driver.
//!
//! Spins up an in-process overlay of N peers, publishes quadruples (from a
//! file or synthetically generated), runs atomic and composite queries, a
//! subscription round-trip and a graceful leave, printing the shape of the
//! overlay along the way.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::Level;

use tessella::config::OverlayConfig;
use tessella::core::{CompositeQuery, Quadruple, QuadruplePattern};
use tessella::overlay::{OverlayClient, PeerHandle};
use tessella::reasoning::ConjunctiveReasoner;
use tessella::storage::MemoryDataset;
use tessella::{Error, Result};

#[derive(Parser)]
#[command(name = "tessella", about = "CAN overlay demo for RDF quadruples")]
struct Args {
    /// Number of peers in the overlay.
    #[arg(long, default_value_t = 8)]
    peers: usize,

    /// Number of synthetic quadruples to publish (ignored with --data).
    #[arg(long, default_value_t = 200)]
    quads: usize,

    /// Data file with one quadruple per line: four terms, whitespace
    /// separated, e.g. `<g> <alice> <knows> <bob>`.
    #[arg(long)]
    data: Option<PathBuf>,

    /// JSON overlay configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit debug-level peer logs.
    #[arg(long)]
    verbose: bool,
}

fn load_quads(args: &Args) -> Result<Vec<Quadruple>> {
    match &args.data {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| {
                    Quadruple::parse(line)
                        .ok_or_else(|| Error::Other(format!("unparseable quadruple: {}", line)))
                })
                .collect()
        }
        None => Ok((0..args.quads)
            .map(|i| {
                Quadruple::parse(&format!(
                    "<g{}> <person{}> <knows> <person{}>",
                    i % 4,
                    i % 50,
                    (i * 7) % 50
                ))
                .expect("synthetic quadruple is well-formed")
            })
            .collect()),
    }
}

async fn print_overlay(peers: &[PeerHandle]) -> Result<()> {
    for peer in peers {
        let state = peer.state().await?;
        println!(
            "  peer {} [{}] zone {} ({} quads, {} neighbors, {} splits)",
            state.id,
            state.status,
            state.zone.map_or_else(|| "-".to_string(), |z| z.to_string()),
            state.stored_quadruples,
            state.neighbors.len(),
            state.history_len,
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = Arc::new(match &args.config {
        Some(path) => OverlayConfig::from_file(path)?,
        None => OverlayConfig::default(),
    });

    println!("Building a {}-peer overlay ({} dimensions)", args.peers, config.dimensions);
    let bootstrap = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new()))?;
    let mut peers = vec![bootstrap];
    for _ in 1..args.peers.max(1) {
        let joined = PeerHandle::join(
            config.clone(),
            Arc::new(MemoryDataset::new()),
            peers[0].stub(),
        )
        .await?;
        peers.push(joined);
    }

    let client = OverlayClient::new(
        peers[0].stub().clone(),
        config.clone(),
        Arc::new(ConjunctiveReasoner::new()),
    );

    // Subscribe before publishing so notifications flow for matching quads.
    let pattern = QuadruplePattern::parse("?g ?s <knows> ?o")
        .ok_or_else(|| Error::Other("bad subscription pattern".to_string()))?;
    let mut notifications = client
        .subscribe("demo-knows".to_string(), vec![pattern.clone()])
        .await?;

    let quads = load_quads(&args)?;
    println!("Publishing {} quadruples", quads.len());
    let start = Instant::now();
    let mut hops_total = 0u64;
    for quad in &quads {
        hops_total += u64::from(client.publish(quad.clone()).await?);
    }
    println!(
        "Published in {:.3} ms ({:.2} hops/quad average)",
        start.elapsed().as_secs_f64() * 1000.0,
        hops_total as f64 / quads.len().max(1) as f64,
    );

    let mut notified = 0usize;
    while notifications.try_recv().is_ok() {
        notified += 1;
    }
    println!("Subscription received {} notifications", notified);

    println!("\nOverlay after publishing:");
    print_overlay(&peers).await?;

    let start = Instant::now();
    let outcome = client.query(pattern.clone()).await?;
    println!(
        "\nAtomic query matched {} quadruples across {} peers in {:.3} ms",
        outcome.quads.len(),
        outcome.peers_visited,
        start.elapsed().as_secs_f64() * 1000.0,
    );

    let composite = CompositeQuery::new(vec![
        QuadruplePattern::parse("?g ?s <knows> ?friend")
            .ok_or_else(|| Error::Other("bad pattern".to_string()))?,
        QuadruplePattern::parse("?g ?friend <knows> ?other")
            .ok_or_else(|| Error::Other("bad pattern".to_string()))?,
    ]);
    let start = Instant::now();
    let outcome = client.composite_query(&composite).await?;
    println!(
        "Composite query matched {} quadruples in {:.3} ms",
        outcome.quads.len(),
        start.elapsed().as_secs_f64() * 1000.0,
    );

    client.unsubscribe("demo-knows".to_string()).await?;

    if peers.len() > 1 {
        let leaver = peers.pop().expect("at least two peers");
        println!("\nPeer {} leaving gracefully", leaver.id());
        leaver.leave().await?;
        println!("Overlay after the leave:");
        print_overlay(&peers).await?;
    }

    let outcome = client.shutdown().await?;
    println!("\nShutdown reached {} peers", outcome.peers_visited);
    Ok(())
}
