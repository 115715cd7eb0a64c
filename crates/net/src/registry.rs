//! Authoritative room state
//!
//! `PeerRoom` is the member table of a hosting process. `RelayRegistry`
//! holds every room a relay knows about, each behind its own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{RelayEnvelope, WireMessage};

/// Members per room, host included
pub const MAX_MEMBERS: usize = 16;

/// Relay members silent for this long are treated as having left
pub const MEMBER_TTL: Duration = Duration::from_secs(30);

/// How long a disbanded relay room keeps answering polls
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(120);

/// Relay log entries kept per room
pub const MAX_LOG_LEN: usize = 1000;

/// Unique handle for one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

struct PeerMember {
    id: ConnectionId,
    name: String,
    outbox: mpsc::Sender<WireMessage>,
}

/// Members of a hosted peer room
///
/// The host is always the first name and has no outbox; events for it are
/// delivered locally by whoever owns the room.
pub struct PeerRoom {
    host_name: String,
    members: Vec<PeerMember>,
}

impl PeerRoom {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            members: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        id: ConnectionId,
        name: impl Into<String>,
        outbox: mpsc::Sender<WireMessage>,
    ) -> Result<()> {
        if self.member_count() >= MAX_MEMBERS {
            return Err(Error::RoomFull);
        }
        self.members.push(PeerMember {
            id,
            name: name.into(),
            outbox,
        });
        Ok(())
    }

    /// Remove a member, returning its name if it was present
    pub fn remove(&mut self, id: ConnectionId) -> Option<String> {
        let pos = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(pos).name)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Member names, host first, in join order
    pub fn names(&self) -> Vec<String> {
        std::iter::once(self.host_name.clone())
            .chain(self.members.iter().map(|m| m.name.clone()))
            .collect()
    }

    /// Number of members, host included
    pub fn member_count(&self) -> usize {
        self.members.len() + 1
    }

    /// Queue `msg` for every remote member except `except`
    ///
    /// Never blocks. A member whose queue is full misses this message;
    /// members whose writer has gone away are returned so the caller can
    /// drop them.
    pub fn broadcast(&self, msg: &WireMessage, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for member in &self.members {
            if Some(member.id) == except {
                continue;
            }
            match member.outbox.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(conn = %member.id, "Outbox full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(member.id),
            }
        }
        dead
    }

    /// Close every outbox so writer tasks finish
    pub fn close_all(&mut self) {
        self.members.clear();
    }
}

struct RelayMember {
    name: String,
    last_seen: Instant,
}

struct RelayRoom {
    members: Vec<RelayMember>,
    log: VecDeque<RelayEnvelope>,
    /// Absolute index of `log[0]`
    base: u64,
    /// Set once the room has been removed from the map
    closed: bool,
}

impl RelayRoom {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            log: VecDeque::new(),
            base: 0,
            closed: false,
        }
    }

    fn end(&self) -> u64 {
        self.base + self.log.len() as u64
    }

    fn append(&mut self, envelope: RelayEnvelope) {
        self.log.push_back(envelope);
        while self.log.len() > MAX_LOG_LEN {
            self.log.pop_front();
            self.base += 1;
        }
    }

    fn append_members(&mut self) {
        let members = self.members.iter().map(|m| m.name.clone()).collect();
        self.append(RelayEnvelope::Members { members });
    }

    fn since(&self, last_index: u64) -> (Vec<RelayEnvelope>, u64) {
        let end = self.end();
        // A cursor past the end belongs to an older room with the same id
        if last_index >= end {
            return (Vec::new(), end);
        }
        let skip = last_index.saturating_sub(self.base) as usize;
        (self.log.iter().skip(skip).cloned().collect(), end)
    }

    fn touch(&mut self, player: &str, now: Instant) {
        if let Some(member) = self.members.iter_mut().find(|m| m.name == player) {
            member.last_seen = now;
        }
    }
}

/// Result of removing a relay member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Member gone, others remain
    Left,
    /// The host left; the room is disbanded
    Disbanded,
    /// Last member gone; the room is deleted
    Emptied,
    /// Unknown room or member
    NotFound,
}

struct Tombstone {
    final_index: u64,
    since: Instant,
}

/// Relay-side registry of rooms
pub struct RelayRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<RelayRoom>>>>,
    tombstones: Mutex<HashMap<String, Tombstone>>,
    member_ttl: Duration,
    tombstone_ttl: Duration,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::with_ttls(MEMBER_TTL, TOMBSTONE_TTL)
    }

    pub fn with_ttls(member_ttl: Duration, tombstone_ttl: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            member_ttl,
            tombstone_ttl,
        }
    }

    async fn room(&self, code: &str) -> Option<Arc<Mutex<RelayRoom>>> {
        self.rooms.read().await.get(code).cloned()
    }

    /// Join (or create) a room; returns whether the caller is the host
    pub async fn init(&self, code: &str, player: &str, now: Instant) -> Result<bool> {
        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(code.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(RelayRoom::new())))
                    .clone()
            };

            let mut room = room.lock().await;
            if room.closed {
                // Lost a race with deletion; the map entry is gone now
                continue;
            }

            self.tombstones.lock().await.remove(code);

            if let Some(pos) = room.members.iter().position(|m| m.name == player) {
                room.members[pos].last_seen = now;
                debug!(room = %code, player = %player, "Member re-joined");
                return Ok(pos == 0);
            }
            if room.members.len() >= MAX_MEMBERS {
                return Err(Error::RoomFull);
            }

            let is_host = room.members.is_empty();
            room.members.push(RelayMember {
                name: player.to_string(),
                last_seen: now,
            });
            room.append_members();
            info!(room = %code, player = %player, is_host, "Relay member joined");
            return Ok(is_host);
        }
    }

    /// Messages after `last_index` and the next cursor
    pub async fn poll(
        &self,
        code: &str,
        last_index: u64,
        player: Option<&str>,
        now: Instant,
    ) -> (Vec<RelayEnvelope>, u64) {
        if let Some(room) = self.room(code).await {
            let mut room = room.lock().await;
            if !room.closed {
                if let Some(player) = player {
                    room.touch(player, now);
                }
                return room.since(last_index);
            }
        }

        match self.tombstones.lock().await.get(code) {
            Some(tomb) if last_index < tomb.final_index => {
                (vec![RelayEnvelope::RoomDisbanded], tomb.final_index)
            }
            Some(tomb) => (Vec::new(), tomb.final_index),
            None => (Vec::new(), last_index),
        }
    }

    /// Append to a room's log; false if the room does not exist
    pub async fn send(&self, code: &str, envelope: RelayEnvelope) -> bool {
        let Some(room) = self.room(code).await else {
            return false;
        };
        let mut room = room.lock().await;
        if room.closed {
            return false;
        }
        room.append(envelope);
        true
    }

    pub async fn leave(&self, code: &str, player: &str) -> LeaveOutcome {
        let Some(room) = self.room(code).await else {
            return LeaveOutcome::NotFound;
        };
        let mut room = room.lock().await;
        if room.closed {
            return LeaveOutcome::NotFound;
        }
        self.remove_member(code, &mut room, player, Instant::now()).await
    }

    async fn remove_member(
        &self,
        code: &str,
        room: &mut RelayRoom,
        player: &str,
        now: Instant,
    ) -> LeaveOutcome {
        let Some(pos) = room.members.iter().position(|m| m.name == player) else {
            return LeaveOutcome::NotFound;
        };
        room.members.remove(pos);

        if pos == 0 {
            room.append(RelayEnvelope::RoomDisbanded);
            room.closed = true;
            self.tombstones.lock().await.insert(
                code.to_string(),
                Tombstone {
                    final_index: room.end(),
                    since: now,
                },
            );
            self.rooms.write().await.remove(code);
            info!(room = %code, host = %player, "Host left, room disbanded");
            return LeaveOutcome::Disbanded;
        }

        if room.members.is_empty() {
            room.closed = true;
            self.rooms.write().await.remove(code);
            info!(room = %code, "Room empty, deleted");
            return LeaveOutcome::Emptied;
        }

        room.append_members();
        info!(room = %code, player = %player, "Relay member left");
        LeaveOutcome::Left
    }

    /// Drop silent members and expired tombstones
    ///
    /// A stale host disbands its room exactly as an explicit leave would.
    pub async fn prune(&self, now: Instant) -> usize {
        let rooms: Vec<(String, Arc<Mutex<RelayRoom>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(code, room)| (code.clone(), room.clone()))
            .collect();

        let mut removed = 0;
        for (code, room) in rooms {
            let mut room = room.lock().await;
            loop {
                if room.closed {
                    break;
                }
                let stale = room
                    .members
                    .iter()
                    .find(|m| now.saturating_duration_since(m.last_seen) > self.member_ttl)
                    .map(|m| m.name.clone());
                let Some(player) = stale else {
                    break;
                };
                info!(room = %code, player = %player, "Dropping silent relay member");
                self.remove_member(&code, &mut room, &player, now).await;
                removed += 1;
            }
        }

        let ttl = self.tombstone_ttl;
        self.tombstones
            .lock()
            .await
            .retain(|_, tomb| now.saturating_duration_since(tomb.since) <= ttl);

        removed
    }

    /// `(rooms, connections)`
    pub async fn counts(&self) -> (usize, usize) {
        let rooms: Vec<Arc<Mutex<RelayRoom>>> = self.rooms.read().await.values().cloned().collect();
        let mut connections = 0;
        for room in &rooms {
            connections += room.lock().await.members.len();
        }
        (rooms.len(), connections)
    }

    pub async fn members(&self, code: &str) -> Option<Vec<String>> {
        let room = self.room(code).await?;
        let room = room.lock().await;
        Some(room.members.iter().map(|m| m.name.clone()).collect())
    }

    pub async fn contains(&self, code: &str) -> bool {
        self.rooms.read().await.contains_key(code)
    }
}
