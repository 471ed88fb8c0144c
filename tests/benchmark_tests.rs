//! Performance smoke tests for the hot paths of a room tick and a client frame

use shared::{
    Direction, FrameInput, GameConfig, Input, InputProvider, Map, Packet, Simulation, WanderBot,
    WorldView,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Benchmarks a full four-player round driven by bots
#[test]
fn benchmark_simulation_advance() {
    let config = GameConfig::default();
    let mut sim = Simulation::new(config, 99);
    let spawns = sim.map().spawn_cells();
    let mut bots: Vec<(u32, WanderBot)> = (1..=4u32)
        .map(|id| {
            sim.add_player(id, spawns[(id - 1) as usize]);
            (id, WanderBot::new(id as u64).with_bomb_chance(0.1))
        })
        .collect();

    let iterations = 3_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut inputs = BTreeMap::new();
        for (id, bot) in bots.iter_mut() {
            let view = WorldView {
                frame: sim.frame(),
                player_id: *id,
                simulation: &sim,
            };
            inputs.insert(*id, bot.decide(&view));
        }
        sim.advance(&inputs);
    }

    let duration = start.elapsed();
    println!(
        "Simulation: 4 players × {} frames in {:?} ({:.2} μs/frame)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Fifty seconds of play should simulate well under real time
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks map generation, which every client repeats on join and round reset
#[test]
fn benchmark_map_generation() {
    let config = GameConfig::default();
    let iterations = 10_000;
    let start = Instant::now();

    for seed in 0..iterations {
        let map = Map::generate(&config, seed);
        assert!(map.hidden_door().is_some());
    }

    let duration = start.elapsed();
    println!(
        "Map generation: {} maps in {:?} ({:.2} μs/map)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks snapshot encoding, done once per room tick
#[test]
fn benchmark_snapshot_serialization() {
    let config = GameConfig::default();
    let mut sim = Simulation::new(config, 5);
    for (i, cell) in sim.map().spawn_cells().into_iter().enumerate() {
        sim.add_player(i as u32 + 1, cell);
    }
    let snapshot = shared::Snapshot {
        frame: 1234,
        phase: shared::Phase::Running,
        seed: 5,
        server_time_ms: 1_700_000_000_000,
        players: sim.players().cloned().collect(),
        bombs: Vec::new(),
        explosions: Vec::new(),
        tile_changes: Vec::new(),
        last_processed_input: (1..=4).map(|id| (id, id * 100)).collect::<HashMap<_, _>>(),
        full: false,
    };
    let packet = Packet::Snapshot(snapshot);

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = shared::framing::encode_packet(&packet).unwrap();
        let payload = shared::framing::split_frame(&frame).unwrap();
        let _decoded = Packet::decode(payload).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot serialization: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks reconciliation with a full ring of pending inputs
#[test]
fn benchmark_reconciliation_replay() {
    use client::config::ClientConfig;
    use client::prediction::ClientPredictor;
    use client::reconciliation::ReconciliationEngine;
    use shared::Player;

    let config = GameConfig::default();
    let mut predictor = ClientPredictor::new(1, config, 8);
    let (x, y) = config.cell_origin((1, 1));
    let authoritative = Player::new(1, x, y, &config);
    let directions = [
        Direction::Right,
        Direction::Down,
        Direction::Left,
        Direction::Up,
    ];
    let pending: Vec<FrameInput> = (1..=120u32)
        .map(|sequence| FrameInput {
            sequence,
            frame: sequence,
            input: Input::moving(directions[(sequence / 16) as usize % 4]),
        })
        .collect();
    let mut engine = ReconciliationEngine::new(&ClientConfig::default());

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        engine.reconcile(&mut predictor, &authoritative, &pending);
    }

    let duration = start.elapsed();
    println!(
        "Reconciliation: {} replays of {} inputs in {:?} ({:.2} μs/replay)",
        iterations,
        pending.len(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // A replay has to fit comfortably inside one 16ms frame
    assert!(duration.as_millis() < 5000);
}
