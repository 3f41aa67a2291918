//! Performance benchmarks for the replication hot paths

use shared::components::{standard_schema, CharacterState, DisplayName, CHARACTER_STATE};
use shared::messages::Envelope;
use shared::pack::pack_component;
use shared::policy::AuthorityCheck;
use shared::wire::{encode_frame, FrameDecoder};
use shared::world::NetId;
use std::time::Instant;

/// Benchmarks the framed codec roundtrip for a typical delta envelope
#[test]
fn benchmark_frame_codec() {
    let registry = standard_schema();
    let spec = registry.component_named(CHARACTER_STATE).unwrap();
    let state = CharacterState {
        position: [12.0, 64.5, -3.25],
        velocity: [0.5, 0.0, 1.5],
        stamina: 80.0,
        look_yaw: 1.25,
    };
    let check = AuthorityCheck {
        owned: false,
        entity_initial: false,
    };
    let packed = pack_component(spec, &state, &check, false).unwrap().unwrap();
    let envelope = Envelope::EntityUpdate {
        net_id: NetId(7),
        owned: None,
        removed: vec![],
        added: vec![],
        changed: vec![packed],
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = encode_frame(&envelope).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} roundtrips in {:?} ({:.2} μs/roundtrip)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks packing a full component snapshot
#[test]
fn benchmark_initial_snapshot_pack() {
    let registry = standard_schema();
    let spec = registry.component_named(CHARACTER_STATE).unwrap();
    let state = CharacterState {
        position: [1.0, 2.0, 3.0],
        velocity: [0.1, 0.0, -0.1],
        stamina: 64.0,
        look_yaw: 0.5,
    };
    let check = AuthorityCheck {
        owned: true,
        entity_initial: true,
    };

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(pack_component(spec, &state, &check, true).unwrap().is_some());
    }

    let duration = start.elapsed();
    println!(
        "Initial pack: {} snapshots in {:?} ({:.2} μs/snapshot)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks applying field deltas to the client mirror
#[test]
fn benchmark_mirror_apply() {
    use client::remote::RemoteWorld;
    use std::sync::Arc;

    let registry = Arc::new(standard_schema());
    let spec = registry.component_named(CHARACTER_STATE).unwrap();
    let initial_check = AuthorityCheck {
        owned: false,
        entity_initial: true,
    };
    let snapshot = pack_component(spec, &CharacterState::default(), &initial_check, true)
        .unwrap()
        .unwrap();

    let mut mirror = RemoteWorld::new(Arc::clone(&registry));
    mirror
        .apply_create(NetId(1), None, false, vec![snapshot])
        .unwrap();

    let moved = CharacterState {
        position: [4.0, 2.0, 0.0],
        velocity: [1.0, 0.0, 0.0],
        stamina: 55.0,
        look_yaw: 0.75,
    };
    let delta_check = AuthorityCheck {
        owned: false,
        entity_initial: false,
    };
    let delta = pack_component(spec, &moved, &delta_check, false)
        .unwrap()
        .unwrap();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        mirror
            .apply_update(NetId(1), None, vec![], vec![], vec![delta.clone()])
            .unwrap();
        mirror.take_world_events();
    }

    let duration = start.elapsed();
    println!(
        "Mirror apply: {} deltas in {:?} ({:.2} μs/delta)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks full flush cycles over a large always-replicated scene
#[test]
fn benchmark_flush_with_many_entities() {
    use server::connection::{ConnId, NetEvent};
    use server::replication::{ReclaimPolicy, ReplicationConfig, ReplicationServer};
    use shared::messages::PROTOCOL_VERSION;
    use shared::policy::ReplicateMode;
    use shared::world::{NetworkComponent, World};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    let config = ReplicationConfig {
        server_name: "bench".to_string(),
        max_peers: 4,
        queue_capacity: 2048,
        handshake_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(30),
        keepalive_interval_ticks: 0,
        reclaim: ReclaimPolicy::Despawn,
        tick_ms: 50,
    };
    let mut server = ReplicationServer::new(config, Arc::new(standard_schema()));
    let mut world = World::new();

    let entity_count = 200;
    let mut entities = Vec::new();
    for _ in 0..entity_count {
        let entity = world.spawn();
        world.set_network(entity, NetworkComponent::new(ReplicateMode::Always));
        world.insert(entity, CharacterState::default());
        entities.push(entity);
    }
    world.drain_events();
    for &entity in &entities {
        server.register_entity(&mut world, entity).unwrap();
    }

    let conn = ConnId(1);
    let (tx, mut rx) = mpsc::channel(4096);
    server.handle_event(
        &mut world,
        NetEvent::Connected {
            conn,
            addr: "127.0.0.1:43001".parse().unwrap(),
            outbound: tx,
        },
    );
    server.handle_event(
        &mut world,
        NetEvent::Message {
            conn,
            envelope: Envelope::HandshakeRequest {
                protocol_version: PROTOCOL_VERSION,
                player_name: "bench".to_string(),
                schema: standard_schema().table(),
            },
        },
    );
    let _ = rx.try_recv();
    server.handle_event(
        &mut world,
        NetEvent::Message {
            conn,
            envelope: Envelope::JoinRequest { view_distance: 1 },
        },
    );
    let _ = rx.try_recv();

    // Initial sweep: every scene entity plus the avatar.
    server.flush(&mut world);
    let mut initial = 0;
    while rx.try_recv().is_ok() {
        initial += 1;
    }
    assert!(initial > entity_count);

    let cycles = 100;
    let start = Instant::now();

    for cycle in 0..cycles {
        for &entity in &entities {
            let _ = world.modify(entity, CHARACTER_STATE, |state: &mut CharacterState| {
                state.stamina = cycle as f32;
            });
        }
        server.flush(&mut world);
        while rx.try_recv().is_ok() {}
    }

    let duration = start.elapsed();
    println!(
        "Flush: {} cycles over {} entities in {:?} ({:.2} ms/cycle)",
        cycles,
        entity_count,
        duration,
        duration.as_millis() as f64 / cycles as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks ownership chain walks through a deep forest
#[test]
fn benchmark_owner_chain_walks() {
    use server::ledger::Ledger;
    use shared::policy::ReplicateMode;
    use shared::world::{NetworkComponent, World};

    let mut world = World::new();
    let mut ledger = Ledger::new();
    let root = world.spawn();
    world.set_network(root, NetworkComponent::new(ReplicateMode::Always));
    ledger.register(&mut world, root).unwrap();

    let mut previous = root;
    let mut deepest = root;
    for _ in 0..40 {
        let child = world.spawn();
        world.set_network(
            child,
            NetworkComponent::owned_by(ReplicateMode::Always, previous),
        );
        ledger.register(&mut world, child).unwrap();
        deepest = child;
        previous = child;
    }

    let iterations = 20_000;
    let start = Instant::now();

    let mut hits = 0;
    for _ in 0..iterations {
        if ledger.owner_chain_contains(&world, deepest, root) {
            hits += 1;
        }
    }

    let duration = start.elapsed();
    assert_eq!(hits, iterations);
    println!(
        "Owner chain: {} walks of depth 41 in {:?} ({:.2} ns/walk)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Stress tests the initial sweep fanning out to many peers at once
#[test]
fn stress_test_wide_fanout() {
    use server::connection::{ConnId, NetEvent};
    use server::replication::{ReclaimPolicy, ReplicationConfig, ReplicationServer};
    use shared::messages::PROTOCOL_VERSION;
    use shared::policy::ReplicateMode;
    use shared::world::{NetworkComponent, World};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    let config = ReplicationConfig {
        server_name: "bench".to_string(),
        max_peers: 32,
        queue_capacity: 2048,
        handshake_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(30),
        keepalive_interval_ticks: 0,
        reclaim: ReclaimPolicy::Despawn,
        tick_ms: 50,
    };
    let mut server = ReplicationServer::new(config, Arc::new(standard_schema()));
    let mut world = World::new();

    let entity_count: usize = 50;
    for i in 0..entity_count {
        let entity = world.spawn();
        world.set_network(entity, NetworkComponent::new(ReplicateMode::Always));
        world.insert(
            entity,
            DisplayName {
                name: format!("prop-{}", i),
            },
        );
        world.drain_events();
        server.register_entity(&mut world, entity).unwrap();
    }

    let peer_count = 16;
    let mut receivers = Vec::new();
    for n in 1..=peer_count {
        let conn = ConnId(n);
        let (tx, mut rx) = mpsc::channel(2048);
        server.handle_event(
            &mut world,
            NetEvent::Connected {
                conn,
                addr: format!("127.0.0.1:{}", 43100 + n).parse().unwrap(),
                outbound: tx,
            },
        );
        server.handle_event(
            &mut world,
            NetEvent::Message {
                conn,
                envelope: Envelope::HandshakeRequest {
                    protocol_version: PROTOCOL_VERSION,
                    player_name: format!("bench-{}", n),
                    schema: standard_schema().table(),
                },
            },
        );
        let _ = rx.try_recv();
        server.handle_event(
            &mut world,
            NetEvent::Message {
                conn,
                envelope: Envelope::JoinRequest { view_distance: 1 },
            },
        );
        let _ = rx.try_recv();
        receivers.push(rx);
    }

    let start = Instant::now();
    server.flush(&mut world);
    let duration = start.elapsed();

    let mut creates: usize = 0;
    for rx in &mut receivers {
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope, Envelope::EntityCreate { .. }) {
                creates += 1;
            }
        }
    }

    // Every peer receives the scene plus its own avatar and nothing else.
    assert_eq!(creates, peer_count as usize * (entity_count + 1));
    println!(
        "Fanout: {} creates across {} peers in {:?}",
        creates, peer_count, duration
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}
