//! TCP server for hosting a peer room
//!
//! The host runs this server and is itself the room's first member.
//! Each connection gets a reader task and a writer task. Readers forward
//! into one bounded channel consumed by a single room task, which is the
//! only place the member table changes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use skillsync_core::ActionEvent;

use crate::error::{Error, Result};
use crate::frame::{write_frame, FrameReader};
use crate::protocol::WireMessage;
use crate::registry::{ConnectionId, PeerRoom};
use crate::session::SessionEvent;

/// Queue depth between readers and the room task
const ROOM_INBOX: usize = 256;

/// Per-member outgoing queue
const OUTBOX: usize = 64;

const EVENTS: usize = 256;

/// Work for the room task
enum RoomInput {
    Joined {
        id: ConnectionId,
        name: String,
        outbox: mpsc::Sender<WireMessage>,
    },
    Message {
        id: ConnectionId,
        msg: WireMessage,
    },
    Gone {
        id: ConnectionId,
    },
    /// Event published by the host itself
    Local(ActionEvent),
}

/// Peer room server handle
pub struct HostServer {
    addr: SocketAddr,
    room: Arc<Mutex<PeerRoom>>,
    inbox: mpsc::Sender<RoomInput>,
    events: mpsc::Receiver<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HostServer {
    /// Start listening on `port` (0 picks a free port)
    pub async fn start(port: u16, host_name: impl Into<String>) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        let host_name = host_name.into();

        info!(addr = %bound_addr, host = %host_name, "Host listening");

        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbox_tx, inbox_rx) = mpsc::channel(ROOM_INBOX);
        let (event_tx, event_rx) = mpsc::channel(EVENTS);

        let room = Arc::new(Mutex::new(PeerRoom::new(host_name)));

        tokio::spawn(room_task(
            room.clone(),
            inbox_rx,
            event_tx,
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(accept_loop(
            listener,
            inbox_tx.clone(),
            shutdown_tx.clone(),
        ));

        Ok(HostServer {
            addr: bound_addr,
            room,
            inbox: inbox_tx,
            events: event_rx,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Send the host's own event to every member
    pub async fn broadcast(&self, event: ActionEvent) -> Result<()> {
        self.inbox
            .send(RoomInput::Local(event))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Current member names, host first
    pub async fn members(&self) -> Vec<String> {
        self.room.lock().await.names()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Close the room and every connection; safe to call twice
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_ok() {
            info!(addr = %self.addr, "Host shutting down");
        }
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<RoomInput>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            inbox.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Reader side of one connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inbox: mpsc::Sender<RoomInput>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(reader);
    let id = ConnectionId::new();

    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX);
    let mut writer_handle = tokio::spawn(writer_task(writer, outbox_rx));

    // Handed to the room on join; until then it keeps the writer alive
    let mut outbox = Some(outbox_tx);
    let mut joined = false;

    loop {
        tokio::select! {
            result = reader.read_frame() => {
                match result {
                    Ok(WireMessage::Join { player }) => {
                        let Some(outbox) = outbox.take() else {
                            debug!(conn = %id, "Ignoring repeated join");
                            continue;
                        };
                        info!(addr = %addr, conn = %id, player = %player, "Peer joined");
                        joined = true;
                        let input = RoomInput::Joined { id, name: player, outbox };
                        if inbox.send(input).await.is_err() {
                            break;
                        }
                    }
                    Ok(WireMessage::Leave {}) if joined => {
                        debug!(conn = %id, "Peer sent leave");
                        break;
                    }
                    Ok(msg) if joined => {
                        if inbox.send(RoomInput::Message { id, msg }).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        debug!(addr = %addr, "Dropping message before join");
                    }
                    Err(Error::MalformedFrame(reason)) => {
                        warn!(conn = %id, reason = %reason, "Skipping malformed line");
                    }
                    Err(Error::PeerDisconnected) => {
                        debug!(conn = %id, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(conn = %id, error = %e, "Read error");
                        break;
                    }
                }
            }
            // Room dropped us (full room, dead writer) or closed
            _ = &mut writer_handle => {
                debug!(conn = %id, "Writer finished");
                break;
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    if joined {
        let _ = inbox.send(RoomInput::Gone { id }).await;
    }
    drop(outbox);
    info!(addr = %addr, conn = %id, "Peer disconnected");
}

/// Writer task - sends queued messages to one member
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<WireMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Single consumer for every room mutation
async fn room_task(
    room: Arc<Mutex<PeerRoom>>,
    mut inbox: mpsc::Receiver<RoomInput>,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let input = tokio::select! {
            input = inbox.recv() => match input {
                Some(input) => input,
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        };

        // Events are delivered after the guard is released
        let mut pending = Vec::new();
        let mut guard = room.lock().await;
        let room = &mut *guard;
        let changed = match input {
            RoomInput::Joined { id, name, outbox } => match room.add(id, name.clone(), outbox) {
                Ok(()) => true,
                Err(e) => {
                    warn!(conn = %id, player = %name, error = %e, "Refusing member");
                    false
                }
            },
            RoomInput::Message { id, msg } => match msg {
                WireMessage::Skill(event) if room.contains(id) => {
                    debug!(conn = %id, action = %event.action_id, player = %event.player_name, "Relaying action");
                    let dead = room.broadcast(&WireMessage::Skill(event.clone()), Some(id));
                    pending.push(SessionEvent::Action(event));
                    drop_dead(room, dead)
                }
                other => {
                    debug!(conn = %id, msg = ?other, "Ignoring unexpected message type");
                    false
                }
            },
            RoomInput::Gone { id } => room.remove(id).is_some(),
            RoomInput::Local(event) => {
                let dead = room.broadcast(&WireMessage::Skill(event), None);
                drop_dead(room, dead)
            }
        };

        if changed {
            pending.push(SessionEvent::MembersChanged(announce_members(room)));
        }
        drop(guard);

        for event in pending {
            deliver(&events, event);
        }
    }

    room.lock().await.close_all();
    debug!("Room task finished");
}

fn drop_dead(room: &mut PeerRoom, dead: Vec<ConnectionId>) -> bool {
    let mut changed = false;
    for id in dead {
        if let Some(name) = room.remove(id) {
            debug!(conn = %id, player = %name, "Dropping unreachable member");
            changed = true;
        }
    }
    changed
}

/// Broadcast the member list until it reaches everyone still alive
fn announce_members(room: &mut PeerRoom) -> Vec<String> {
    loop {
        let members = room.names();
        let dead = room.broadcast(&WireMessage::Members { members: members.clone() }, None);
        if !drop_dead(room, dead) {
            return members;
        }
    }
}

/// Hand an event to the session owner without waiting
///
/// An owner that stops draining loses events; the room keeps serving members.
fn deliver(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(event = ?event, "Host event queue full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
