//! HTTP relay service
//!
//! `GET /` liveness text, `GET /status` counts, `POST /relay` for
//! init/poll/send/leave. Clients poll, so no inbound port is needed on
//! any player's machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::protocol::{
    AckResponse, InitResponse, PollResponse, RelayRequest, StatusResponse, STATUS_OK,
};
use crate::registry::RelayRegistry;

/// How often silent members and old tombstones are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub fn router(registry: Arc<RelayRegistry>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/relay", post(relay))
        .with_state(registry)
}

/// Periodically drop silent members (a silent host disbands its room)
pub async fn sweeper(registry: Arc<RelayRegistry>, interval: Duration) {
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let removed = registry.prune(Instant::now()).await;
        if removed > 0 {
            debug!(removed, "Swept silent relay members");
        }
    }
}

/// A running relay bound to a socket
pub struct RelayServer {
    addr: SocketAddr,
    registry: Arc<RelayRegistry>,
    serve: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl RelayServer {
    /// Bind and serve in the background
    pub async fn start(addr: SocketAddr) -> std::io::Result<Self> {
        Self::start_with(addr, Arc::new(RelayRegistry::new()), SWEEP_INTERVAL).await
    }

    pub async fn start_with(
        addr: SocketAddr,
        registry: Arc<RelayRegistry>,
        sweep_interval: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Relay listening");

        let app = router(registry.clone());
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Relay server stopped");
            }
        });
        let sweep = tokio::spawn(sweeper(registry.clone(), sweep_interval));

        Ok(Self {
            addr,
            registry,
            serve,
            sweep,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for clients on this machine
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Run until the serving task ends
    pub async fn wait(mut self) {
        let _ = (&mut self.serve).await;
    }

    pub fn shutdown(&self) {
        self.serve.abort();
        self.sweep.abort();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn index(State(registry): State<Arc<RelayRegistry>>) -> String {
    let (rooms, connections) = registry.counts().await;
    format!(
        "skillsync relay is running ({} rooms, {} connections)\n",
        rooms, connections
    )
}

async fn status(State(registry): State<Arc<RelayRegistry>>) -> Json<StatusResponse> {
    let (rooms, connections) = registry.counts().await;
    Json(StatusResponse {
        status: STATUS_OK.to_string(),
        rooms,
        connections,
    })
}

async fn relay(
    State(registry): State<Arc<RelayRegistry>>,
    Json(request): Json<RelayRequest>,
) -> Response {
    let now = Instant::now();
    match request {
        RelayRequest::Init {
            room_code,
            player_name,
        } => match registry.init(&room_code, &player_name, now).await {
            Ok(is_host) => Json(InitResponse {
                status: STATUS_OK.to_string(),
                is_host,
                room_code,
            })
            .into_response(),
            Err(e) => {
                warn!(room = %room_code, player = %player_name, error = %e, "Init refused");
                (StatusCode::CONFLICT, Json(AckResponse::error(e.to_string()))).into_response()
            }
        },
        RelayRequest::Poll {
            room_code,
            last_index,
            player_name,
        } => {
            let (messages, index) = registry
                .poll(&room_code, last_index, player_name.as_deref(), now)
                .await;
            Json(PollResponse {
                status: STATUS_OK.to_string(),
                messages,
                index,
            })
            .into_response()
        }
        RelayRequest::Send { room_code, message } => {
            if registry.send(&room_code, message).await {
                Json(AckResponse::ok()).into_response()
            } else {
                debug!(room = %room_code, "Send to unknown room");
                (
                    StatusCode::NOT_FOUND,
                    Json(AckResponse::error("room not found")),
                )
                    .into_response()
            }
        }
        RelayRequest::Leave {
            room_code,
            player_name,
        } => {
            let outcome = registry.leave(&room_code, &player_name).await;
            debug!(room = %room_code, player = %player_name, outcome = ?outcome, "Leave");
            Json(AckResponse::ok()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayEnvelope;
    use serde_json::json;
    use std::net::Ipv4Addr;

    async fn relay_post(client: &reqwest::Client, url: &str, body: serde_json::Value) -> reqwest::Response {
        client
            .post(format!("{}/relay", url))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_api() {
        let server = RelayServer::start((Ipv4Addr::LOCALHOST, 0).into())
            .await
            .unwrap();
        let url = server.local_url();
        let client = reqwest::Client::new();

        let index = client.get(&url).send().await.unwrap().text().await.unwrap();
        assert!(index.contains("0 rooms"));

        let init: InitResponse = relay_post(&client, &url, json!({"type": "init", "room_code": "ABCDEF", "player_name": "host"}))
            .await
            .json()
            .await
            .unwrap();
        assert!(init.is_host);
        let init: InitResponse = relay_post(&client, &url, json!({"type": "init", "room_code": "ABCDEF", "player_name": "bob"}))
            .await
            .json()
            .await
            .unwrap();
        assert!(!init.is_host);

        let status: StatusResponse = client
            .get(format!("{}/status", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!((status.rooms, status.connections), (1, 2));

        let resp = relay_post(
            &client,
            &url,
            json!({"type": "send", "room_code": "NOPE", "message": {"type": "room_disbanded"}}),
        )
        .await;
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = relay_post(&client, &url, json!({"type": "leave", "room_code": "ABCDEF", "player_name": "host"})).await;
        assert!(resp.status().is_success());

        let poll: PollResponse = relay_post(&client, &url, json!({"type": "poll", "room_code": "ABCDEF", "last_index": 2}))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(poll.messages, vec![RelayEnvelope::RoomDisbanded]);
        assert!(!server.registry().contains("ABCDEF").await);

        let resp = relay_post(&client, &url, json!({"type": "dance"})).await;
        assert!(resp.status().is_client_error());
    }
}
