//! HTTP polling client for relay rooms

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skillsync_core::room_code::ALPHABET;
use skillsync_core::ActionEvent;

use crate::error::{Error, Result};
use crate::protocol::{
    AckResponse, InitResponse, PollResponse, RelayEnvelope, RelayRequest, StatusResponse,
    STATUS_OK,
};
use crate::session::{CloseReason, SessionEvent};

/// Length of a relay room id
pub const RELAY_CODE_LEN: usize = 6;

/// Timing knobs for a relay session
#[derive(Debug, Clone, Copy)]
pub struct RelayTiming {
    pub poll_interval: Duration,
    /// Wait after a failed poll
    pub error_backoff: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub leave_timeout: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            leave_timeout: Duration::from_secs(2),
        }
    }
}

/// Mint a relay room id locally; no round trip needed
pub fn mint_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..RELAY_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// One member's connection to a relay room
pub struct RelayClient {
    http: reqwest::Client,
    server: String,
    room_code: String,
    player: String,
    /// Tags our own sends so the poller can skip them
    origin: Uuid,
    is_host: bool,
    timing: RelayTiming,
    event_rx: mpsc::Receiver<SessionEvent>,
    stop_tx: broadcast::Sender<()>,
    poller: Option<JoinHandle<()>>,
    /// Set by the poller once the relay reports the room gone
    disbanded: Arc<AtomicBool>,
}

impl RelayClient {
    /// Join (or create) `room_code` on the first relay that answers
    pub async fn connect(
        servers: &[String],
        room_code: &str,
        player: &str,
        timing: RelayTiming,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timing.request_timeout)
            .build()?;

        for server in servers {
            let server = server.trim_end_matches('/');
            info!(server = %server, room = %room_code, "Trying relay");
            match register(&http, server, room_code, player, timing.connect_timeout).await {
                Ok(is_host) => {
                    info!(server = %server, room = %room_code, is_host, "Joined relay room");
                    return Ok(Self::spawn(
                        http,
                        server.to_string(),
                        room_code.to_string(),
                        player.to_string(),
                        is_host,
                        timing,
                    ));
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Relay unusable");
                }
            }
        }

        Err(Error::RelayUnavailable)
    }

    fn spawn(
        http: reqwest::Client,
        server: String,
        room_code: String,
        player: String,
        is_host: bool,
        timing: RelayTiming,
    ) -> Self {
        let origin = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let disbanded = Arc::new(AtomicBool::new(false));

        let poller = tokio::spawn(poll_loop(
            Poller {
                http: http.clone(),
                url: relay_url(&server),
                room_code: room_code.clone(),
                player: player.clone(),
                origin,
                timing,
                disbanded: disbanded.clone(),
            },
            event_tx,
            stop_rx,
        ));

        Self {
            http,
            server,
            room_code,
            player,
            origin,
            is_host,
            timing,
            event_rx,
            stop_tx,
            poller: Some(poller),
            disbanded,
        }
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Append an action to the room log
    pub async fn send_action(&self, event: ActionEvent) -> Result<()> {
        if self.poller.is_none() {
            return Err(Error::NotConnected);
        }
        if self.disbanded.load(Ordering::Acquire) {
            return Err(Error::RoomDisbanded);
        }
        let request = RelayRequest::Send {
            room_code: self.room_code.clone(),
            message: RelayEnvelope::Skill {
                data: event,
                origin: Some(self.origin),
            },
        };
        let ack: AckResponse = self
            .http
            .post(relay_url(&self.server))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if !ack.is_ok() {
            return Err(Error::Relay(
                ack.message.unwrap_or_else(|| "send refused".into()),
            ));
        }
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Tell the relay we are gone and stop polling; safe to call twice
    pub async fn leave(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        let _ = self.stop_tx.send(());

        let request = RelayRequest::Leave {
            room_code: self.room_code.clone(),
            player_name: self.player.clone(),
        };
        let sent = self
            .http
            .post(relay_url(&self.server))
            .timeout(self.timing.leave_timeout)
            .json(&request)
            .send()
            .await;
        match sent {
            Ok(_) => info!(room = %self.room_code, "Left relay room"),
            Err(e) => warn!(room = %self.room_code, error = %e, "Leave notice failed"),
        }

        if tokio::time::timeout(self.timing.leave_timeout, poller).await.is_err() {
            debug!("Poll loop slow to stop");
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

fn relay_url(server: &str) -> String {
    format!("{}/relay", server)
}

/// Check `/status`, then `init`
async fn register(
    http: &reqwest::Client,
    server: &str,
    room_code: &str,
    player: &str,
    timeout: Duration,
) -> Result<bool> {
    let status: StatusResponse = http
        .get(format!("{}/status", server))
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if status.status != STATUS_OK {
        return Err(Error::Relay(format!("status {}", status.status)));
    }

    let request = RelayRequest::Init {
        room_code: room_code.to_string(),
        player_name: player.to_string(),
    };
    let resp = http
        .post(relay_url(server))
        .timeout(timeout)
        .json(&request)
        .send()
        .await?;
    if !resp.status().is_success() {
        let reason = match resp.json::<AckResponse>().await {
            Ok(ack) => ack.message.unwrap_or(ack.status),
            Err(e) => e.to_string(),
        };
        return Err(Error::Relay(reason));
    }

    let init: InitResponse = resp.json().await?;
    if init.status != STATUS_OK {
        return Err(Error::Relay(format!("init {}", init.status)));
    }
    Ok(init.is_host)
}

struct Poller {
    http: reqwest::Client,
    url: String,
    room_code: String,
    player: String,
    origin: Uuid,
    timing: RelayTiming,
    disbanded: Arc<AtomicBool>,
}

impl Poller {
    async fn poll(&self, last_index: u64) -> Result<PollResponse> {
        let request = RelayRequest::Poll {
            room_code: self.room_code.clone(),
            last_index,
            player_name: Some(self.player.clone()),
        };
        Ok(self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Background poll loop; the cursor only moves on success
async fn poll_loop(
    poller: Poller,
    events: mpsc::Sender<SessionEvent>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut cursor = 0u64;

    loop {
        let result = tokio::select! {
            result = poller.poll(cursor) => result,
            _ = stop_rx.recv() => break,
        };

        let wait = match result {
            Ok(resp) => {
                cursor = resp.index;
                let mut disbanded = false;
                for envelope in resp.messages {
                    match envelope {
                        RelayEnvelope::Skill { origin, .. } if origin == Some(poller.origin) => {}
                        RelayEnvelope::Skill { data, .. } => {
                            let _ = events.send(SessionEvent::Action(data)).await;
                        }
                        RelayEnvelope::Members { members } => {
                            let _ = events.send(SessionEvent::MembersChanged(members)).await;
                        }
                        RelayEnvelope::RoomDisbanded => {
                            disbanded = true;
                            break;
                        }
                    }
                }
                if disbanded {
                    info!(room = %poller.room_code, "Relay room disbanded");
                    poller.disbanded.store(true, Ordering::Release);
                    let _ = events
                        .send(SessionEvent::Closed(CloseReason::RoomDisbanded))
                        .await;
                    break;
                }
                poller.timing.poll_interval
            }
            Err(e) => {
                debug!(room = %poller.room_code, error = %e, "Poll failed");
                poller.timing.error_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop_rx.recv() => break,
        }
    }

    debug!(room = %poller.room_code, "Poll loop finished");
}
