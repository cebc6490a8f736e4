//! Performance benchmarks for the hot paths of a mesh tick

use peer::{platformer_config, Buttons, Platformer, Swarm};
use shared::input_codec::{self, InputBatch};
use shared::{ConsistencyReport, InputVector, Simulation, StateHash, Timeline, MAX_INPUT_SLOTS};
use std::time::{Duration, Instant};

/// Benchmarks appending to and querying a frame timeline
#[test]
fn benchmark_timeline_append_and_lookup() {
    let frames = 100_000;
    let start = Instant::now();

    let mut timeline = Timeline::new();
    for frame in 0..frames {
        timeline.add(frame, frame as u32).unwrap();
    }
    let mut hits = 0;
    for frame in (0..frames).step_by(7) {
        if timeline.get(frame).is_some() {
            hits += 1;
        }
    }
    timeline.trim_before(frames / 2);

    let duration = start.elapsed();
    println!(
        "Timeline: {} appends in {:?} ({:.2} ns/frame)",
        frames,
        duration,
        duration.as_nanos() as f64 / frames as f64
    );

    assert_eq!(hits, (frames as usize + 6) / 7);
    assert_eq!(timeline.len(), frames as usize / 2);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks both input wire forms: live coalesced batches carrying a
/// report and run-length catch-up batches
#[test]
fn benchmark_input_codec() {
    let bits = 3;
    let mut live_values = vec![5; 12];
    live_values.push(2);
    let live = InputBatch::new(1000, live_values);
    let catch_up = InputBatch::new(400, (0..600).map(|i| (i / 5) % 8).collect());
    let report = ConsistencyReport {
        ncf: 990,
        jle_epoch: 4,
        coordinator: 1,
        hash: StateHash(0xdead_beef),
    };

    let iterations = 20_000;
    let start = Instant::now();
    let mut live_bytes = 0;
    let mut catch_up_bytes = 0;
    for _ in 0..iterations {
        let encoded = input_codec::encode(&live, bits, Some(&report));
        live_bytes += encoded.len();
        let (decoded, carried) = input_codec::decode(&encoded, bits).unwrap();
        assert_eq!(decoded, live);
        assert_eq!(carried, Some(report));

        let encoded = input_codec::encode_rle(&catch_up, bits);
        catch_up_bytes += encoded.len();
        let (decoded, carried) = input_codec::decode(&encoded, bits).unwrap();
        assert_eq!(decoded.frame_after(), catch_up.frame_after());
        assert!(carried.is_none());
    }

    let duration = start.elapsed();
    println!(
        "Input codec: {} round trips in {:?} ({:.2} μs/iter, {} + {} bytes/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        live_bytes / iterations,
        catch_up_bytes / iterations
    );

    // 600 frames in runs of five pack into 120 nine-bit pairs.
    assert!(catch_up_bytes / iterations < 600 / 4);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks hashing serialized snapshots
#[test]
fn benchmark_state_hash() {
    let snapshot: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let iterations = 500;

    let start = Instant::now();
    let mut last = StateHash(0);
    for _ in 0..iterations {
        last = StateHash::of(&snapshot);
    }
    let duration = start.elapsed();
    println!(
        "State hash: {} x 64 KiB in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(last, StateHash::of(&snapshot));
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks stepping and snapshotting the demo simulation with a full lobby
#[test]
fn benchmark_platformer_step_and_snapshot() {
    let mut game = Platformer::new(60);
    for slot in 0..MAX_INPUT_SLOTS as u8 {
        game.player_join(slot, &format!("p{}", slot), &[], true);
    }
    let mut inputs: InputVector = [0; MAX_INPUT_SLOTS];

    let iterations = 10_000;
    let start = Instant::now();
    for i in 0..iterations {
        for (slot, value) in inputs.iter_mut().enumerate() {
            *value = Buttons::from_bits(((i / 10 + slot) % 8) as u32).to_bits();
        }
        game.step(&inputs, true);
        let snapshot = game.serialize();
        assert!(!snapshot.is_empty());
    }

    let duration = start.elapsed();
    println!(
        "Platformer: {} steps in {:?} ({:.2} μs/step)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(game.frame(), iterations as u64);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks a four-peer session over the loopback transport
#[test]
fn benchmark_four_peer_session() {
    let mut swarm = Swarm::new(platformer_config(60, 2), Duration::from_millis(20));
    swarm.host("host");
    for index in 0..3 {
        swarm.join(&format!("member-{}", index)).unwrap();
    }

    let ticks = 1200;
    let start = Instant::now();
    swarm.run(ticks);
    let duration = start.elapsed();
    println!(
        "Session: {} ticks x 4 peers in {:?} ({:.2} μs/tick)",
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    assert_eq!(swarm.running().len(), 4);
    assert!(swarm.converged());
    assert!(duration.as_secs() < 20);
}
