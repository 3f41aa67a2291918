//! Session driver for one connection to the authority.
//!
//! [`Client`] owns the TCP stream, walks the handshake to the joined
//! state, and then runs a select loop that applies inbound entity traffic
//! to the [`RemoteWorld`] mirror and flushes locally edited owned state
//! back out once per tick. The tick rate is whatever the authority
//! announced in its handshake accept, so every client paces itself to the
//! same clock.
//!
//! The handshake is strictly sequential: request, accept (or reject),
//! join, response. Each step runs under a timeout so a stalled or silent
//! server surfaces as an error instead of a hang.

use crate::remote::RemoteWorld;
use log::{debug, info, warn};
use rand::Rng;
use shared::components::{
    standard_schema, Announcement, CharacterState, DisplayName, Inventory, Notify, PerformAction,
    CHARACTER_STATE, DISPLAY_NAME, EVENT_ANNOUNCEMENT, EVENT_NOTIFY, EVENT_PERFORM_ACTION,
    INVENTORY,
};
use shared::entity_ref::WireRef;
use shared::error::{ConnectionError, DisconnectReason};
use shared::messages::{ConnectionState, Envelope, NET_TICK_MS, PROTOCOL_VERSION};
use shared::pack::{decode_payload, encode_payload};
use shared::schema::{EventId, SchemaRegistry};
use shared::wire::{encode_frame, FrameDecoder};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Time allowed for each handshake step before giving up.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// One session against an authority, from TCP connect to farewell.
pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    registry: Arc<SchemaRegistry>,
    remote: RemoteWorld,
    state: ConnectionState,
    player_name: String,
    server_name: String,
    tick_ms: u64,
    server_tick: u64,
    ping_ms: u64,
    wander: bool,
}

impl Client {
    /// Opens the transport. The session is not live until
    /// [`Client::connect`] completes the handshake.
    pub async fn new(
        server_addr: &str,
        player_name: &str,
        wander: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        info!("connecting to authority at {}", server_addr);
        let stream = TcpStream::connect(server_addr).await?;
        let registry = Arc::new(standard_schema());

        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            registry: Arc::clone(&registry),
            remote: RemoteWorld::new(registry),
            state: ConnectionState::Connecting,
            player_name: player_name.to_string(),
            server_name: String::new(),
            tick_ms: NET_TICK_MS,
            server_tick: 0,
            ping_ms: 0,
            wander,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn remote(&self) -> &RemoteWorld {
        &self.remote
    }

    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    /// Walks the handshake: version and schema exchange, then the join
    /// step that spawns our client entity on the authority.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.state = ConnectionState::Authenticating;
        self.send(&Envelope::HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            player_name: self.player_name.clone(),
            schema: self.registry.table(),
        })
        .await?;

        match self.recv_step().await? {
            Envelope::HandshakeAccept {
                server_name,
                tick_ms,
                schema,
            } => {
                if !self.registry.matches(&schema) {
                    return Err(ConnectionError::SchemaMismatch);
                }
                self.server_name = server_name;
                self.tick_ms = tick_ms.max(1);
            }
            Envelope::HandshakeReject { reason, detail } => {
                return Err(ConnectionError::Rejected { reason, detail });
            }
            other => {
                return Err(ConnectionError::UnexpectedMessage {
                    state: self.state.name(),
                    got: other.kind(),
                });
            }
        }

        self.state = ConnectionState::AwaitingJoin;
        self.send(&Envelope::JoinRequest { view_distance: 2 })
            .await?;

        match self.recv_step().await? {
            Envelope::JoinResponse {
                client_net_id,
                tick,
            } => {
                self.remote.set_client_net_id(client_net_id);
                self.server_tick = tick;
                self.state = ConnectionState::Joined;
                info!(
                    "joined '{}' as {} (net id {}, server tick {})",
                    self.server_name, self.player_name, client_net_id, tick
                );
                Ok(())
            }
            Envelope::Disconnect { reason } => Err(ConnectionError::Rejected {
                reason,
                detail: String::new(),
            }),
            other => Err(ConnectionError::UnexpectedMessage {
                state: self.state.name(),
                got: other.kind(),
            }),
        }
    }

    /// Runs the session until the authority closes it or we are
    /// interrupted. Sends a farewell on the way out so the authority can
    /// reclaim immediately instead of waiting out its idle window.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut tick = interval(Duration::from_millis(self.tick_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keepalive = interval(Duration::from_secs(5));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut chunk = [0u8; 4096];

        loop {
            if matches!(self.state, ConnectionState::Disconnected(_)) {
                break;
            }
            tokio::select! {
                read = self.stream.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("authority closed the connection");
                        self.state = ConnectionState::Disconnected(DisconnectReason::Quit);
                    }
                    Ok(n) => {
                        self.decoder.feed(&chunk[..n]);
                        while let Some(envelope) = self.decoder.next_frame()? {
                            self.handle_envelope(envelope)?;
                        }
                    }
                    Err(err) => return Err(err.into()),
                },
                _ = tick.tick() => {
                    let action = if self.wander { self.wander_step() } else { None };
                    for envelope in self.remote.take_owned_updates()? {
                        self.send(&envelope).await?;
                    }
                    if let Some(envelope) = action {
                        self.send(&envelope).await?;
                    }
                    // A renderer would consume these; the headless client
                    // just keeps the mirror from hoarding them.
                    self.remote.take_world_events();
                }
                _ = keepalive.tick() => {
                    let envelope = Envelope::TimeSync {
                        tick: self.server_tick,
                        server_time_ms: now_ms(),
                    };
                    self.send(&envelope).await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt, leaving");
                    break;
                }
            }
        }

        if !matches!(self.state, ConnectionState::Disconnected(_)) {
            let _ = self
                .send(&Envelope::Disconnect {
                    reason: DisconnectReason::Quit,
                })
                .await;
        }
        Ok(())
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ConnectionError> {
        match envelope {
            Envelope::EntityCreate {
                net_id,
                anchor,
                owned,
                components,
            } => {
                self.remote.apply_create(net_id, anchor, owned, components)?;
                let label = self
                    .remote
                    .get::<DisplayName>(net_id, DISPLAY_NAME)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| "unnamed".to_string());
                info!(
                    "{} entered view (net id {}, owned: {})",
                    label,
                    net_id,
                    self.remote.is_owned(net_id)
                );
            }
            Envelope::EntityUpdate {
                net_id,
                owned,
                removed,
                added,
                changed,
            } => {
                self.remote
                    .apply_update(net_id, owned, removed, added, changed)?;
            }
            Envelope::EntityRemove { net_id } => {
                info!("net id {} left view", net_id);
                self.remote.apply_remove(net_id);
            }
            Envelope::Event {
                target,
                event_id,
                payload,
            } => self.handle_event(target, event_id, &payload),
            Envelope::TimeSync {
                tick,
                server_time_ms,
            } => {
                self.server_tick = tick;
                // Meaningful when both ends share a clock; a demo measure,
                // not time synchronization.
                self.ping_ms = now_ms().saturating_sub(server_time_ms);
            }
            Envelope::Disconnect { reason } => {
                info!("authority ended the session: {}", reason);
                self.state = ConnectionState::Disconnected(reason);
            }
            other => {
                warn!("unexpected {} message after join", other.kind());
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, target: WireRef, event_id: EventId, payload: &[u8]) {
        let Some(spec) = self.registry.event(event_id) else {
            warn!("event with unknown id {}", event_id.0);
            return;
        };
        let target = self.remote.resolve_ref(target);
        match spec.name {
            name if name == EVENT_NOTIFY => match decode_payload::<Notify>(payload) {
                Ok(notify) => info!("[notify] {}", notify.text),
                Err(err) => warn!("bad notify payload: {}", err),
            },
            name if name == EVENT_ANNOUNCEMENT => match decode_payload::<Announcement>(payload) {
                Ok(announcement) => info!("[announcement] {}", announcement.text),
                Err(err) => warn!("bad announcement payload: {}", err),
            },
            other => debug!("unhandled event '{}' against {:?}", other, target),
        }
    }

    /// Drifts our avatar's view and gear so the authority has something
    /// to relay. Stands in for real input; occasionally returns an action
    /// event to send.
    fn wander_step(&mut self) -> Option<Envelope> {
        let id = self.remote.client_net_id()?;
        let mut rng = rand::thread_rng();

        let turn = rng.gen_range(-0.4..0.4f32);
        self.remote
            .modify(id, CHARACTER_STATE, |state: &mut CharacterState| {
                state.look_yaw = (state.look_yaw + turn).rem_euclid(TAU);
            })?;
        if rng.gen_bool(0.02) {
            self.remote.modify(id, INVENTORY, |inventory: &mut Inventory| {
                inventory.selected = inventory.selected.wrapping_add(1);
            })?;
        }

        if !rng.gen_bool(0.01) {
            return None;
        }
        let selected = self.remote.get::<Inventory>(id, INVENTORY)?.selected;
        let event_id = self.registry.event_named(EVENT_PERFORM_ACTION)?.id;
        let payload = encode_payload(&PerformAction { slot: selected }).ok()?;
        Some(Envelope::Event {
            target: WireRef::Network(id),
            event_id,
            payload,
        })
    }

    async fn recv_step(&mut self) -> Result<Envelope, ConnectionError> {
        timeout(STEP_TIMEOUT, self.recv())
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
    }

    async fn recv(&mut self) -> Result<Envelope, ConnectionError> {
        loop {
            if let Some(envelope) = self.decoder.next_frame()? {
                return Ok(envelope);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
            self.decoder.feed(&chunk[..n]);
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let frame = encode_frame(envelope)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}
