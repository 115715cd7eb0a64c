//! One room session over any transport
//!
//! The transport is picked when the room is created or joined and stays
//! fixed for the session. Everything received comes out as `SessionEvent`s
//! on a channel for the owner to drain on its own thread.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{info, warn};

use skillsync_core::{ActionEvent, RoomCode, Settings, TransportKind};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::nat::{self, PortMapping};
use crate::relay::{mint_room_code, RelayClient, RelayTiming};
use crate::server::HostServer;

/// Something the room told us
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Another member used an action
    Action(ActionEvent),
    /// Member names, host first
    MembersChanged(Vec<String>),
    /// The session is over; create or join a room again to continue
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Host unreachable or connection dropped
    ConnectionLost,
    /// Relay host left
    RoomDisbanded,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ConnectionLost => write!(f, "connection lost"),
            CloseReason::RoomDisbanded => write!(f, "room disbanded by host"),
        }
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub peer_port: u16,
    pub connect_timeout: Duration,
    pub relay_servers: Vec<String>,
    pub relay_timing: RelayTiming,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let connect_timeout = Duration::from_secs(settings.connect_timeout_secs.max(1));
        Self {
            peer_port: settings.peer_port,
            connect_timeout,
            relay_servers: settings.relay_servers.clone(),
            relay_timing: RelayTiming {
                connect_timeout,
                ..RelayTiming::default()
            },
        }
    }
}

enum Link {
    Hosting {
        server: HostServer,
        mapping: Option<PortMapping>,
    },
    Joined(Client),
    Relay(RelayClient),
}

/// An active room membership
pub struct Session {
    kind: TransportKind,
    code: String,
    link: Link,
    left: bool,
}

impl Session {
    /// Create a room and become its host
    pub async fn create_room(kind: TransportKind, player: &str, opts: &SessionOptions) -> Result<Self> {
        let (code, link) = match kind {
            TransportKind::Direct => {
                let server = HostServer::start(opts.peer_port, player).await?;
                let ip = nat::local_ipv4().await;
                (
                    RoomCode::encode(ip).to_string(),
                    Link::Hosting {
                        server,
                        mapping: None,
                    },
                )
            }
            TransportKind::NatAssisted => {
                let server = HostServer::start(opts.peer_port, player).await?;
                let local = nat::local_ipv4().await;
                let (ip, mapping) = match PortMapping::create(server.port()).await {
                    Ok(mapping) => (mapping.external_ip().unwrap_or(local), Some(mapping)),
                    Err(e) => {
                        warn!(error = %e, "Port mapping failed, room is reachable on this network only");
                        (local, None)
                    }
                };
                (
                    RoomCode::encode(ip).to_string(),
                    Link::Hosting { server, mapping },
                )
            }
            TransportKind::Relay => {
                let code = mint_room_code();
                let client =
                    RelayClient::connect(&opts.relay_servers, &code, player, opts.relay_timing)
                        .await?;
                (code, Link::Relay(client))
            }
        };

        info!(kind = %kind, code = %code, "Room created");
        Ok(Self {
            kind,
            code,
            link,
            left: false,
        })
    }

    /// Join an existing room by its code
    pub async fn join_room(
        kind: TransportKind,
        code: &str,
        player: &str,
        opts: &SessionOptions,
    ) -> Result<Self> {
        let (code, link) = match kind {
            TransportKind::Direct | TransportKind::NatAssisted => {
                let parsed = RoomCode::parse(code)?;
                let client = Client::join_code(
                    parsed.as_str(),
                    opts.peer_port,
                    player,
                    opts.connect_timeout,
                )
                .await?;
                (parsed.to_string(), Link::Joined(client))
            }
            TransportKind::Relay => {
                let code = code.trim().to_ascii_uppercase();
                if code.is_empty() {
                    return Err(Error::Relay("empty room code".into()));
                }
                let client =
                    RelayClient::connect(&opts.relay_servers, &code, player, opts.relay_timing)
                        .await?;
                (code, Link::Relay(client))
            }
        };

        info!(kind = %kind, code = %code, "Joined room");
        Ok(Self {
            kind,
            code,
            link,
            left: false,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Code to share with other players
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_host(&self) -> bool {
        match &self.link {
            Link::Hosting { .. } => true,
            Link::Joined(_) => false,
            Link::Relay(client) => client.is_host(),
        }
    }

    /// Listening port when hosting a peer room
    pub fn port(&self) -> Option<u16> {
        match &self.link {
            Link::Hosting { server, .. } => Some(server.port()),
            _ => None,
        }
    }

    /// External address from a successful port mapping
    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        match &self.link {
            Link::Hosting {
                mapping: Some(mapping),
                ..
            } => mapping.external_ip(),
            _ => None,
        }
    }

    /// Send a local action to every other member
    pub async fn broadcast(&self, event: ActionEvent) -> Result<()> {
        if self.left {
            return Err(Error::NotConnected);
        }
        match &self.link {
            Link::Hosting { server, .. } => server.broadcast(event).await,
            Link::Joined(client) => client.send_action(event).await,
            Link::Relay(client) => client.send_action(event).await,
        }
    }

    /// Next pending event without waiting
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        match &mut self.link {
            Link::Hosting { server, .. } => server.try_next_event(),
            Link::Joined(client) => client.try_next_event(),
            Link::Relay(client) => client.try_next_event(),
        }
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        match &mut self.link {
            Link::Hosting { server, .. } => server.next_event().await,
            Link::Joined(client) => client.next_event().await,
            Link::Relay(client) => client.next_event().await,
        }
    }

    /// Leave the room; later calls do nothing
    pub async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;

        match &mut self.link {
            Link::Hosting { server, mapping } => {
                server.shutdown();
                if let Some(mapping) = mapping.take() {
                    if let Err(e) = mapping.remove().await {
                        warn!(error = %e, "Could not remove port mapping");
                    }
                }
            }
            Link::Joined(client) => client.leave().await,
            Link::Relay(client) => client.leave().await,
        }
        info!(code = %self.code, "Left room");
    }
}
