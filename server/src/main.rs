mod connection;
mod ledger;
mod peer;
mod replication;
mod utils;

use clap::Parser;
use connection::{run_listener, NetEvent};
use log::{debug, info, warn};
use rand::Rng;
use replication::{ReclaimPolicy, ReplicationConfig, ReplicationServer};
use shared::components::{
    standard_schema, Announcement, CharacterState, DisplayName, Health, Inventory, Notify,
    PerformAction, CHARACTER_STATE, EVENT_ANNOUNCEMENT, EVENT_NOTIFY, EVENT_PERFORM_ACTION,
    INVENTORY,
};
use shared::pack::{decode_payload, encode_payload};
use shared::policy::ReplicateMode;
use shared::world::{Entity, NetworkComponent, SpatialAnchor, World};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Peers within this horizontal distance of a relevance-gated entity's
/// anchor receive it.
const RELEVANCE_RADIUS: f32 = 96.0;

/// Main-method of the application.
/// Parses command-line arguments, then runs the listener and the
/// replication loop until one of them stops or ctrl-c arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Server name announced in the handshake
        #[clap(long, default_value = "waystation-ridge")]
        name: String,
        /// Maximum number of joined peers
        #[clap(long, default_value = "32")]
        max_peers: usize,
        /// Outbound frames buffered per connection before it is dropped
        #[clap(long, default_value = "256")]
        queue_capacity: usize,
        /// What happens to a departing peer's entities: despawn or reassign
        #[clap(long, default_value = "despawn")]
        reclaim: ReclaimPolicy,
        /// Seconds a joined peer may stay silent before being dropped
        #[clap(long, default_value = "30")]
        idle_timeout: u64,
        /// Number of wandering critters to populate the world with
        #[clap(long, default_value = "6")]
        critters: usize,
    }

    env_logger::init();
    let args = Args::parse();

    let config = ReplicationConfig {
        server_name: args.name.clone(),
        max_peers: args.max_peers,
        queue_capacity: args.queue_capacity,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        reclaim: args.reclaim,
        ..ReplicationConfig::default()
    };

    let mut world = World::new();
    let mut replication = ReplicationServer::new(config, Arc::new(standard_schema()));
    replication.set_relevance(near_anchor);
    let scene = populate_world(&mut world, &mut replication, args.critters);

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;
    info!("'{}' listening on {}", args.name, address);

    let (events_tx, events_rx) = mpsc::channel::<NetEvent>(1024);
    let listener_handle = tokio::spawn(run_listener(listener, events_tx, args.queue_capacity));
    let loop_handle = tokio::spawn(run_replication_loop(world, replication, events_rx, scene));

    // Handle shutdown gracefully
    tokio::select! {
        result = listener_handle => {
            if let Err(e) = result {
                eprintln!("Listener task panicked: {}", e);
            }
        }
        result = loop_handle => {
            if let Err(e) = result {
                eprintln!("Replication loop panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}

/// The demo scene: a couple of fixed structures plus the roaming critters.
struct Scene {
    waystation: Entity,
    critters: Vec<Entity>,
}

fn populate_world(world: &mut World, replication: &mut ReplicationServer, critters: usize) -> Scene {
    // An anchored structure everyone sees. Anchored entities are referenced
    // by position on the wire, so the anchor goes in before registration.
    let waystation = world.spawn();
    world.set_network(waystation, NetworkComponent::new(ReplicateMode::Always));
    world.set_anchor(waystation, SpatialAnchor::new(12, 0, -4));
    world.insert(
        waystation,
        DisplayName {
            name: "waystation".to_string(),
        },
    );
    world.insert(
        waystation,
        Health {
            current: 500.0,
            max: 500.0,
        },
    );
    replication.register_entity(world, waystation);

    // A far-off beacon only nearby peers receive.
    let beacon = world.spawn();
    world.set_network(beacon, NetworkComponent::new(ReplicateMode::Relevant));
    world.set_anchor(beacon, SpatialAnchor::new(64, 0, 64));
    world.insert(
        beacon,
        DisplayName {
            name: "far beacon".to_string(),
        },
    );
    replication.register_entity(world, beacon);

    let mut rng = rand::thread_rng();
    let mut roaming = Vec::with_capacity(critters);
    for i in 0..critters {
        let critter = world.spawn();
        world.set_network(critter, NetworkComponent::new(ReplicateMode::Always));
        world.insert(
            critter,
            DisplayName {
                name: format!("critter-{}", i + 1),
            },
        );
        world.insert(
            critter,
            CharacterState {
                position: [rng.gen_range(-20.0..20.0), 0.0, rng.gen_range(-20.0..20.0)],
                velocity: [0.0; 3],
                stamina: 100.0,
                look_yaw: rng.gen_range(0.0..std::f32::consts::TAU),
            },
        );
        world.insert(critter, Health::default());
        replication.register_entity(world, critter);
        roaming.push(critter);
    }

    // World construction predates any session; nothing here is a delta.
    world.drain_events();
    Scene {
        waystation,
        critters: roaming,
    }
}

/// Relevance predicate for the beacon: compare the peer avatar's position
/// against the entity's anchor.
fn near_anchor(world: &World, entity: Entity, client: Entity) -> bool {
    let Some(anchor) = world.anchor(entity) else {
        return true;
    };
    let Some(state) = world.get::<CharacterState>(client, CHARACTER_STATE) else {
        return false;
    };
    let dx = state.position[0] - anchor.x as f32;
    let dz = state.position[2] - anchor.z as f32;
    dx * dx + dz * dz <= RELEVANCE_RADIUS * RELEVANCE_RADIUS
}

/// Starts the replication loop.
async fn run_replication_loop(
    mut world: World,
    mut replication: ReplicationServer,
    mut events: mpsc::Receiver<NetEvent>,
    scene: Scene,
) {
    let tick_ms = replication.config().tick_ms;
    let mut ticker = interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first tick since it fires immediately
    ticker.tick().await;

    let dt = tick_ms as f32 / 1000.0;
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => replication.handle_event(&mut world, event),
                None => {
                    warn!("transport channel closed, stopping");
                    return;
                }
            },
            _ = ticker.tick() => {
                ticks += 1;
                step_critters(&mut world, &scene.critters, dt);
                handle_peer_actions(&mut world, &mut replication);
                if ticks % 600 == 0 {
                    broadcast_flavor(&world, &mut replication, scene.waystation);
                }
                replication.flush(&mut world);
                if ticks % 200 == 0 {
                    info!(
                        "tick {} | {} entities, {} replicated | {} peers on {} connections",
                        ticks,
                        world.len(),
                        replication.ledger().len(),
                        replication.joined_peers(),
                        replication.connections()
                    );
                }
            }
        }
    }
}

/// Wanders every critter a little: occasional heading changes, constant
/// amble, stamina that drains and resets.
fn step_critters(world: &mut World, critters: &[Entity], dt: f32) {
    let mut rng = rand::thread_rng();
    for &critter in critters {
        let turn = if rng.gen_bool(0.05) {
            rng.gen_range(-1.2..1.2f32)
        } else {
            0.0
        };
        let _ = world.modify(critter, CHARACTER_STATE, |state: &mut CharacterState| {
            state.look_yaw = (state.look_yaw + turn).rem_euclid(std::f32::consts::TAU);
            let speed = 1.5;
            state.velocity = [
                state.look_yaw.cos() * speed,
                0.0,
                state.look_yaw.sin() * speed,
            ];
            state.position[0] += state.velocity[0] * dt;
            state.position[2] += state.velocity[2] * dt;
            state.stamina = if state.stamina <= 0.0 {
                100.0
            } else {
                state.stamina - dt * 2.0
            };
        });
    }
}

/// Applies peer-raised actions that passed the driver's ownership and
/// policy checks.
fn handle_peer_actions(world: &mut World, replication: &mut ReplicationServer) {
    for event in replication.take_inbound_events() {
        if event.name != EVENT_PERFORM_ACTION {
            continue;
        }
        let action: PerformAction = match decode_payload(&event.payload) {
            Ok(action) => action,
            Err(e) => {
                warn!("{} sent an undecodable {} payload: {}", event.peer, event.name, e);
                continue;
            }
        };
        let item = world
            .modify(event.target, INVENTORY, |inv: &mut Inventory| {
                inv.selected = action.slot;
                inv.slots.get(action.slot as usize).cloned()
            })
            .flatten();
        match item {
            Some(item) => {
                debug!("{} readies the {} on entity {}", event.peer, item, event.target);
                if let Ok(payload) = encode_payload(&Notify {
                    text: format!("you ready the {}", item),
                }) {
                    replication.send_event(world, event.target, EVENT_NOTIFY, payload);
                }
            }
            None => debug!("{} used an empty inventory slot", event.peer),
        }
    }
}

fn broadcast_flavor(world: &World, replication: &mut ReplicationServer, waystation: Entity) {
    if let Ok(payload) = encode_payload(&Announcement {
        text: "the waystation light sweeps the ridge".to_string(),
    }) {
        replication.send_event(world, waystation, EVENT_ANNOUNCEMENT, payload);
    }
}
