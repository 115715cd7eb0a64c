//! Skill event bus
//!
//! Glue between the local player, the room session and the countdown board.
//! Session workers only ever push into channels; everything that mutates the
//! board or calls the observer happens inside `pump`, on the caller's thread.

use std::collections::BTreeMap;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use skillsync_core::{
    ActionEvent, CountdownBoard, CountdownKey, CountdownMode, CountdownPhase, CountdownSignal,
    CountdownSpec, Settings,
};
use skillsync_net::{CloseReason, Session, SessionEvent};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Invalid action settings: {0}")]
    Settings(#[from] skillsync_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] skillsync_net::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Receives everything the display needs to show
pub trait CountdownObserver {
    /// A countdown changed; `remaining` is the value after the change
    fn on_signal(&mut self, key: &CountdownKey, signal: CountdownSignal, remaining: u32);

    fn on_members(&mut self, _members: &[String]) {}

    /// The room is gone; countdowns keep running locally
    fn on_closed(&mut self, _reason: CloseReason) {}
}

pub struct SkillEventBus<O> {
    player: String,
    catalog: BTreeMap<String, CountdownSpec>,
    board: CountdownBoard,
    session: Option<Session>,
    members: Vec<String>,
    observer: O,
}

impl<O: CountdownObserver> SkillEventBus<O> {
    pub fn new(player: impl Into<String>, catalog: BTreeMap<String, CountdownSpec>, observer: O) -> Self {
        Self {
            player: player.into(),
            catalog,
            board: CountdownBoard::new(),
            session: None,
            members: Vec::new(),
            observer,
        }
    }

    /// Build the catalog from settings
    ///
    /// Permanent actions start parked at zero; loop actions start running
    /// at full duration from `now`.
    pub fn from_settings(settings: &Settings, observer: O, now: Instant) -> Result<Self> {
        let mut catalog = BTreeMap::new();
        for (id, action) in &settings.actions {
            catalog.insert(id.clone(), action.countdown_spec()?);
        }

        let mut bus = Self::new(settings.player_name.clone(), catalog, observer);
        for (id, spec) in &bus.catalog {
            let key = CountdownKey::new(bus.player.clone(), id.clone());
            match spec.mode() {
                CountdownMode::Permanent => bus.board.park(key, *spec),
                CountdownMode::Loop => bus.board.trigger(key, *spec, now),
                CountdownMode::OneShot => {}
            }
        }
        Ok(bus)
    }

    pub fn player(&self) -> &str {
        &self.player
    }

    /// Known action ids
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.catalog.keys().map(String::as_str)
    }

    /// Start routing events through `session`
    pub fn attach(&mut self, session: Session) -> Result<()> {
        if self.session.is_some() {
            return Err(BusError::AlreadyInRoom);
        }
        info!(code = %session.code(), host = session.is_host(), "Session attached");
        self.session = Some(session);
        Ok(())
    }

    /// The local player used an action
    ///
    /// Using a one-shot action whose countdown is still showing closes it
    /// instead, and nothing is forwarded. Otherwise the local countdown is
    /// armed even when forwarding fails.
    pub async fn publish(&mut self, action_id: &str, now: Instant) -> Result<()> {
        let spec = *self
            .catalog
            .get(action_id)
            .ok_or_else(|| BusError::UnknownAction(action_id.to_string()))?;

        let key = CountdownKey::new(self.player.clone(), action_id);
        let showing = self.board.get(&key).is_some_and(|c| {
            c.mode() == CountdownMode::OneShot
                && matches!(c.phase(), CountdownPhase::Running | CountdownPhase::Holding)
        });
        if showing {
            debug!(action = %action_id, "Closing own one-shot countdown");
            self.board.dismiss(&key);
            return Ok(());
        }

        self.board.trigger(key, spec, now);

        if let Some(session) = &self.session {
            let event = ActionEvent::new(action_id, self.player.clone());
            if let Err(e) = session.broadcast(event).await {
                warn!(action = %action_id, error = %e, "Could not forward action");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Another member used an action
    pub fn on_receive(&mut self, event: ActionEvent, now: Instant) {
        if event.player_name == self.player {
            debug!(action = %event.action_id, "Ignoring own echoed action");
            return;
        }
        let Some(spec) = self.catalog.get(&event.action_id).copied() else {
            debug!(action = %event.action_id, player = %event.player_name, "Ignoring unknown action");
            return;
        };
        self.board
            .trigger(CountdownKey::new(event.player_name, event.action_id), spec, now);
    }

    /// Apply one session event
    ///
    /// Countdowns of members who left the room are dropped.
    pub fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Action(action) => self.on_receive(action, now),
            SessionEvent::MembersChanged(members) => {
                for gone in self.members.iter().filter(|m| !members.contains(*m)) {
                    if *gone == self.player {
                        continue;
                    }
                    let dropped = self.board.dismiss_player(gone);
                    if dropped > 0 {
                        debug!(player = %gone, count = dropped, "Dropped countdowns of departed member");
                    }
                }
                self.observer.on_members(&members);
                self.members = members;
            }
            SessionEvent::Closed(reason) => {
                info!(reason = %reason, "Session closed");
                self.session = None;
                self.members.clear();
                self.observer.on_closed(reason);
            }
        }
    }

    /// Apply pending session events, advance countdowns and notify the observer
    pub fn pump(&mut self, now: Instant) {
        while let Some(event) = self.session.as_mut().and_then(Session::try_next_event) {
            self.on_session_event(event, now);
        }

        for (key, signal) in self.board.tick(now) {
            let remaining = self.board.get(&key).map_or(0, |c| c.remaining());
            self.observer.on_signal(&key, signal, remaining);
        }
    }

    /// Stop watching one countdown
    pub fn dismiss(&mut self, key: &CountdownKey) -> bool {
        self.board.dismiss(key)
    }

    /// Leave the current room, if any; countdowns are kept
    pub async fn leave(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.leave().await;
        }
        self.members.clear();
    }

    /// Member names, host first; empty outside a room
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn board(&self) -> &CountdownBoard {
        &self.board
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillsync_core::{ActionSettings, TransportKind};
    use skillsync_net::SessionOptions;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        signals: Vec<(CountdownKey, CountdownSignal, u32)>,
        members: Vec<Vec<String>>,
        closed: Vec<CloseReason>,
    }

    impl CountdownObserver for Recorder {
        fn on_signal(&mut self, key: &CountdownKey, signal: CountdownSignal, remaining: u32) {
            self.signals.push((key.clone(), signal, remaining));
        }

        fn on_members(&mut self, members: &[String]) {
            self.members.push(members.to_vec());
        }

        fn on_closed(&mut self, reason: CloseReason) {
            self.closed.push(reason);
        }
    }

    fn settings(name: &str) -> Settings {
        let mut settings = Settings {
            player_name: name.to_string(),
            ..Settings::default()
        };
        settings
            .actions
            .insert("dash".into(), ActionSettings::new(10, 3, CountdownMode::OneShot));
        settings
            .actions
            .insert("aura".into(), ActionSettings::new(60, 0, CountdownMode::Permanent));
        settings
    }

    fn bus(name: &str) -> SkillEventBus<Recorder> {
        SkillEventBus::from_settings(&settings(name), Recorder::default(), Instant::now()).unwrap()
    }

    #[test]
    fn test_permanent_actions_start_parked() {
        let bus = bus("alice");
        let aura = bus.board().get(&CountdownKey::new("alice", "aura")).unwrap();
        assert_eq!(aura.phase(), CountdownPhase::Held);
        assert_eq!(aura.remaining(), 0);
        assert!(bus.board().get(&CountdownKey::new("alice", "dash")).is_none());
    }

    #[test]
    fn test_loop_actions_start_running() {
        let mut settings = settings("alice");
        settings
            .actions
            .insert("pulse".into(), ActionSettings::new(30, 0, CountdownMode::Loop));
        let start = Instant::now();
        let mut bus = SkillEventBus::from_settings(&settings, Recorder::default(), start).unwrap();

        let key = CountdownKey::new("alice", "pulse");
        let pulse = bus.board().get(&key).unwrap();
        assert_eq!(pulse.phase(), CountdownPhase::Running);
        assert_eq!(pulse.remaining(), 30);

        bus.pump(start + Duration::from_secs(5));
        assert_eq!(bus.board().get(&key).unwrap().remaining(), 25);
    }

    #[tokio::test]
    async fn test_publish_arms_local_countdown() {
        let mut bus = bus("alice");
        let start = Instant::now();
        bus.publish("dash", start).await.unwrap();
        bus.pump(start);

        let key = CountdownKey::new("alice", "dash");
        assert_eq!(bus.board().get(&key).unwrap().remaining(), 10);
        assert!(bus
            .observer()
            .signals
            .contains(&(key.clone(), CountdownSignal::Remaining(10), 10)));

        bus.pump(start + Duration::from_secs(7));
        assert!(bus
            .observer()
            .signals
            .contains(&(key, CountdownSignal::Alert, 3)));
    }

    #[tokio::test]
    async fn test_publish_unknown_action() {
        let mut bus = bus("alice");
        let result = bus.publish("teleport", Instant::now()).await;
        assert!(matches!(result, Err(BusError::UnknownAction(_))));
        assert_eq!(bus.board().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_again_closes_active_oneshot() {
        let mut bus = bus("alice");
        let start = Instant::now();
        let key = CountdownKey::new("alice", "dash");

        bus.publish("dash", start).await.unwrap();
        bus.pump(start + Duration::from_secs(4));
        bus.publish("dash", start + Duration::from_secs(4)).await.unwrap();
        assert!(bus.board().get(&key).is_none());

        // A closed one-shot can be used again
        bus.publish("dash", start + Duration::from_secs(5)).await.unwrap();
        assert_eq!(bus.board().get(&key).unwrap().remaining(), 10);

        // Permanent actions restart rather than close
        let aura = CountdownKey::new("alice", "aura");
        bus.publish("aura", start).await.unwrap();
        bus.publish("aura", start + Duration::from_secs(2)).await.unwrap();
        bus.pump(start + Duration::from_secs(2));
        assert_eq!(bus.board().get(&aura).unwrap().remaining(), 60);
    }

    #[test]
    fn test_departed_member_countdowns_dropped() {
        let mut bus = bus("alice");
        let now = Instant::now();
        let names = |list: &[&str]| list.iter().map(|n| n.to_string()).collect::<Vec<_>>();

        bus.on_session_event(SessionEvent::MembersChanged(names(&["alice", "bob", "carol"])), now);
        bus.on_receive(ActionEvent::new("dash", "bob"), now);
        bus.on_receive(ActionEvent::new("aura", "bob"), now);
        bus.on_receive(ActionEvent::new("dash", "carol"), now);

        bus.on_session_event(SessionEvent::MembersChanged(names(&["alice", "carol"])), now);
        assert!(bus.board().get(&CountdownKey::new("bob", "dash")).is_none());
        assert!(bus.board().get(&CountdownKey::new("bob", "aura")).is_none());
        assert!(bus.board().get(&CountdownKey::new("carol", "dash")).is_some());
        assert!(bus.board().get(&CountdownKey::new("alice", "aura")).is_some());
        assert_eq!(bus.members(), ["alice", "carol"]);
        assert_eq!(bus.observer().members.len(), 2);
    }

    #[test]
    fn test_receive_filters() {
        let mut bus = bus("alice");
        let now = Instant::now();

        bus.on_receive(ActionEvent::new("dash", "alice"), now);
        bus.on_receive(ActionEvent::new("teleport", "bob"), now);
        assert_eq!(bus.board().len(), 1);

        bus.on_receive(ActionEvent::new("dash", "bob"), now);
        assert!(bus.board().get(&CountdownKey::new("bob", "dash")).is_some());
    }

    #[test]
    fn test_oneshot_closes_and_dismiss() {
        let mut bus = bus("alice");
        let now = Instant::now();
        bus.on_receive(ActionEvent::new("dash", "bob"), now);
        bus.on_receive(ActionEvent::new("aura", "carol"), now);

        bus.pump(now + Duration::from_secs(10));
        bus.pump(now + Duration::from_secs(13));
        let bob = CountdownKey::new("bob", "dash");
        assert!(bus.board().get(&bob).is_none());
        assert!(bus
            .observer()
            .signals
            .iter()
            .any(|(k, s, _)| k == &bob && *s == CountdownSignal::Closed));

        let carol = CountdownKey::new("carol", "aura");
        assert!(bus.dismiss(&carol));
        assert!(!bus.dismiss(&carol));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let opts = SessionOptions {
            peer_port: 0,
            ..SessionOptions::default()
        };
        let host_session = Session::create_room(TransportKind::Direct, "alice", &opts)
            .await
            .unwrap();
        let join_opts = SessionOptions {
            peer_port: host_session.port().unwrap(),
            ..SessionOptions::default()
        };
        let guest_session =
            Session::join_room(TransportKind::Direct, host_session.code(), "bob", &join_opts)
                .await
                .unwrap();

        let mut host = bus("alice");
        let mut guest = bus("bob");
        host.attach(host_session).unwrap();
        guest.attach(guest_session).unwrap();

        let extra = Session::create_room(TransportKind::Direct, "alice", &opts)
            .await
            .unwrap();
        assert!(matches!(host.attach(extra), Err(BusError::AlreadyInRoom)));

        // Wait for both sides to see the full room
        let deadline = Instant::now() + Duration::from_secs(3);
        while guest.members().len() < 2 {
            assert!(Instant::now() < deadline, "guest never saw the room");
            guest.pump(Instant::now());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        guest.publish("dash", Instant::now()).await.unwrap();
        let key = CountdownKey::new("bob", "dash");
        while host.board().get(&key).is_none() {
            assert!(Instant::now() < deadline, "host never saw the action");
            host.pump(Instant::now());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(host.members(), ["alice", "bob"]);

        host.leave().await;
        assert!(host.session().is_none());
        while guest.session().is_some() {
            assert!(Instant::now() < deadline, "guest never saw the room close");
            guest.pump(Instant::now());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(guest.observer().closed, vec![CloseReason::ConnectionLost]);
        assert!(guest.members().is_empty());
        // Countdowns outlive the room
        assert!(guest.board().get(&key).is_some());
    }
}
