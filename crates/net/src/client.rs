//! TCP client for joining a peer room

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use skillsync_core::{room_code, ActionEvent};

use crate::error::{Error, Result};
use crate::frame::{write_frame, FrameReader};
use crate::protocol::WireMessage;
use crate::session::{CloseReason, SessionEvent};

/// Default bound on connect attempts
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum ClientCommand {
    Send(WireMessage),
    Leave,
}

/// Client handle for one joined room
pub struct Client {
    addr: SocketAddr,
    event_rx: mpsc::Receiver<SessionEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl Client {
    /// Decode a room code and join the room it points at
    pub async fn join_code(
        code: &str,
        port: u16,
        player: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let ip = room_code::decode(code)?;
        Self::connect(SocketAddrV4::new(ip, port).into(), player, connect_timeout).await
    }

    /// Connect to a host and send `join`
    pub async fn connect(
        addr: SocketAddr,
        player: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let player = player.into();
        info!(addr = %addr, player = %player, "Connecting to host");

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::from_connect(e, addr.to_string())),
            Err(_) => return Err(Error::ConnectTimeout(addr.to_string())),
        };
        let _ = stream.set_nodelay(true);

        let (reader, mut writer) = tokio::io::split(stream);
        write_frame(&mut writer, &WireMessage::Join { player }).await?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            FrameReader::new(reader),
            writer,
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            addr,
            event_rx,
            cmd_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send an action event to the host for rebroadcast
    pub async fn send_action(&self, event: ActionEvent) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(WireMessage::Skill(event)))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Say goodbye and close; does nothing if already closed
    pub async fn leave(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Leave).await;
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Main connection task
async fn connection_task(
    mut reader: FrameReader<ReadHalf<TcpStream>>,
    mut writer: WriteHalf<TcpStream>,
    event_tx: mpsc::Sender<SessionEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            // Incoming message from host
            result = reader.read_frame() => {
                match result {
                    Ok(WireMessage::Skill(event)) => {
                        let _ = event_tx.send(SessionEvent::Action(event)).await;
                    }
                    Ok(WireMessage::Members { members }) => {
                        let _ = event_tx.send(SessionEvent::MembersChanged(members)).await;
                    }
                    Ok(other) => {
                        debug!(msg = ?other, "Ignoring unexpected message from host");
                    }
                    Err(Error::MalformedFrame(reason)) => {
                        warn!(reason = %reason, "Skipping malformed line");
                    }
                    Err(Error::PeerDisconnected) => {
                        info!("Host closed the connection");
                        let _ = event_tx
                            .send(SessionEvent::Closed(CloseReason::ConnectionLost))
                            .await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        let _ = event_tx
                            .send(SessionEvent::Closed(CloseReason::ConnectionLost))
                            .await;
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            let _ = event_tx
                                .send(SessionEvent::Closed(CloseReason::ConnectionLost))
                                .await;
                            break;
                        }
                    }
                    Some(ClientCommand::Leave) | None => {
                        debug!("Leaving room");
                        let leave = write_frame(&mut writer, &WireMessage::Leave {});
                        let _ = tokio::time::timeout(Duration::from_secs(2), leave).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    cmd_rx.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HostServer;
    use std::net::Ipv4Addr;

    async fn next(client: &mut Client) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .expect("timed out")
            .unwrap()
    }

    async fn next_action(client: &mut Client) -> ActionEvent {
        loop {
            if let SessionEvent::Action(event) = next(client).await {
                return event;
            }
        }
    }

    async fn join(server: &HostServer, name: &str) -> Client {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.port()));
        Client::connect(addr, name, CONNECT_TIMEOUT).await.unwrap()
    }

    #[tokio::test]
    async fn test_refused() {
        // Grab a free port, then close it
        let port = {
            let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let result = Client::connect(addr, "alice", CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(Error::ConnectRefused(_))));
    }

    #[tokio::test]
    async fn test_bad_code() {
        let result = Client::join_code("!!!!", 9999, "alice", CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(Error::AddressDecode(_))));
    }

    #[tokio::test]
    async fn test_three_member_fan_out() {
        let mut host = HostServer::start(0, "host").await.unwrap();
        let mut alice = join(&host, "alice").await;
        let mut bob = join(&host, "bob").await;

        // Wait until both are in the room
        loop {
            if let SessionEvent::MembersChanged(m) = next(&mut alice).await {
                if m.len() == 3 {
                    break;
                }
            }
        }

        let event = ActionEvent::new("fireball", "alice");
        alice.send_action(event.clone()).await.unwrap();

        assert_eq!(next_action(&mut bob).await, event);
        loop {
            match tokio::time::timeout(Duration::from_secs(2), host.next_event()).await {
                Ok(Some(SessionEvent::Action(got))) => {
                    assert_eq!(got, event);
                    break;
                }
                Ok(Some(_)) => continue,
                other => panic!("host never saw the action: {:?}", other.is_ok()),
            }
        }

        // Host events reach both joiners
        let from_host = ActionEvent::new("shield", "host");
        host.broadcast(from_host.clone()).await.unwrap();
        assert_eq!(next_action(&mut bob).await, from_host);
        // Alice gets the host's event and never her own
        assert_eq!(next_action(&mut alice).await, from_host);
        assert!(alice.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_leave_then_host_shutdown() {
        let host = HostServer::start(0, "host").await.unwrap();
        let alice = join(&host, "alice").await;
        let mut bob = join(&host, "bob").await;

        loop {
            if let SessionEvent::MembersChanged(m) = next(&mut bob).await {
                if m.len() == 3 {
                    break;
                }
            }
        }

        alice.leave().await;
        alice.leave().await;
        loop {
            if let SessionEvent::MembersChanged(m) = next(&mut bob).await {
                if m == vec!["host", "bob"] {
                    break;
                }
            }
        }

        host.shutdown();
        loop {
            if let SessionEvent::Closed(reason) = next(&mut bob).await {
                assert_eq!(reason, CloseReason::ConnectionLost);
                break;
            }
        }
    }
}
