use clap::Parser;
use log::{info, warn};
use peer::{platformer_config, Swarm};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser)]
#[command(name = "peer")]
#[command(about = "Runs a swarm of lockstep mesh peers over an in-process network")]
struct Args {
    /// Number of peers, including the host
    #[arg(short, long, default_value = "4")]
    peers: usize,

    /// Ticks to run before exiting
    #[arg(short, long, default_value = "1800")]
    ticks: u64,

    /// Simulation rate in ticks per second
    #[arg(long, default_value = "60")]
    tick_rate: u32,

    /// Frames of local input delay
    #[arg(long, default_value = "2")]
    frame_delay: i32,

    /// One-way latency of every simulated link
    #[arg(short, long, default_value = "30")]
    latency_ms: u64,

    /// Kill the coordinator at this tick to exercise host migration
    #[arg(short, long)]
    kill_coordinator_at: Option<u64>,

    /// Run as fast as possible instead of in real time
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!(
        "Starting {} peers at {} Hz with {} ms latency",
        args.peers, args.tick_rate, args.latency_ms
    );
    info!("Use RUST_LOG=debug to see mesh traffic");

    let config = platformer_config(args.tick_rate, args.frame_delay);
    let mut swarm = Swarm::new(config.clone(), Duration::from_millis(args.latency_ms));
    swarm.host("peer-0");
    for index in 1..args.peers.max(1) {
        swarm.join(&format!("peer-{}", index))?;
    }

    let mut timer = interval(config.tick_duration());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let report_every = u64::from(args.tick_rate.max(1));

    loop {
        tokio::select! {
            _ = timer.tick(), if !args.fast => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = tokio::task::yield_now(), if args.fast => {}
        }

        if Some(swarm.steps()) == args.kill_coordinator_at {
            match swarm.coordinator() {
                Some(index) => swarm.kill(index),
                None => warn!("No coordinator to kill at tick {}", swarm.steps()),
            }
        }
        swarm.step();

        if swarm.steps() % report_every == 0 {
            report(&mut swarm);
        }
        if swarm.steps() >= args.ticks {
            break;
        }
    }

    report(&mut swarm);
    for index in 0..swarm.len() {
        if swarm.is_alive(index) {
            swarm.session_mut(index).disconnect();
        }
    }
    swarm.step();
    Ok(())
}

fn report(swarm: &mut Swarm) {
    let frame = swarm.common_frame();
    let converged = swarm.converged();
    for index in 0..swarm.len() {
        if !swarm.is_alive(index) {
            continue;
        }
        let session = swarm.session(index);
        info!(
            "{}: {:?} ncf={} sim={} players={}",
            swarm.name(index),
            session.state(),
            session.ncf(),
            session.simulation_frame(),
            session.simulation().players().len()
        );
    }
    match frame {
        Some(frame) if converged => info!("Tick {}: agree at frame {}", swarm.steps(), frame),
        Some(frame) => warn!("Tick {}: no agreement at frame {}", swarm.steps(), frame),
        None => warn!("Tick {}: no running peers", swarm.steps()),
    }
}
