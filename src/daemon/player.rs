use crate::daemon::remote::{ConnectionState, Session};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum PlayerStatus {
    #[default]
    Unknown,
    Stopped,
    Playing,
    Paused,
}

/// The push notifications that move the player status.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PlayerEvent {
    Pause,
    Resume,
    AvStart,
    Stop,
}

impl PlayerEvent {
    pub const ALL: [PlayerEvent; 4] = [
        PlayerEvent::Pause,
        PlayerEvent::Resume,
        PlayerEvent::AvStart,
        PlayerEvent::Stop,
    ];

    pub fn notification(self) -> &'static str {
        match self {
            PlayerEvent::Pause => "Player.OnPause",
            PlayerEvent::Resume => "Player.OnResume",
            PlayerEvent::AvStart => "Player.OnAVStart",
            PlayerEvent::Stop => "Player.OnStop",
        }
    }

    /// Status after this event. Independent of the status before it.
    pub fn status(self) -> PlayerStatus {
        match self {
            PlayerEvent::Pause => PlayerStatus::Paused,
            PlayerEvent::Resume | PlayerEvent::AvStart => PlayerStatus::Playing,
            PlayerEvent::Stop => PlayerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PlayerSnapshot {
    pub status: PlayerStatus,
    pub connected: bool,
    /// Set once the player has stayed stopped for the whole cool-down.
    pub quiescent: bool,
}

impl PlayerSnapshot {
    pub fn controls_visible(&self) -> bool {
        self.connected && matches!(self.status, PlayerStatus::Playing | PlayerStatus::Paused)
    }
}

/// Routes the four player notifications of `session` into a channel, in arrival order.
pub fn attach(session: &Session) -> mpsc::UnboundedReceiver<PlayerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for event in PlayerEvent::ALL {
        let tx = tx.clone();
        session.subscribe(event.notification(), move |_| {
            tx.send(event)?;
            Ok(())
        });
    }
    rx
}

pub struct Synchronizer {
    snapshot_tx: watch::Sender<PlayerSnapshot>,
    cooldown: Duration,
    generation: u64,
    cooldown_tx: mpsc::Sender<u64>,
    cooldown_rx: mpsc::Receiver<u64>,
}

impl Synchronizer {
    pub fn new(cooldown: Duration) -> (Self, watch::Receiver<PlayerSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(PlayerSnapshot::default());
        let (cooldown_tx, cooldown_rx) = mpsc::channel(4);
        (
            Synchronizer {
                snapshot_tx,
                cooldown,
                generation: 0,
                cooldown_tx,
                cooldown_rx,
            },
            snapshot_rx,
        )
    }

    #[instrument(skip(self), level = "debug")]
    pub fn apply(&mut self, event: PlayerEvent) {
        self.generation += 1;
        let status = event.status();
        self.snapshot_tx.send_modify(|s| {
            s.status = status;
            s.quiescent = false;
        });
        if event == PlayerEvent::Stop {
            let generation = self.generation;
            let delay = self.cooldown;
            let tx = self.cooldown_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(generation).await;
            });
        }
    }

    fn cooled_down(&mut self, generation: u64) {
        if generation != self.generation {
            trace!("Discarding stale cool-down {}", generation);
            return;
        }
        debug!("Player quiescent");
        self.snapshot_tx.send_modify(|s| s.quiescent = true);
    }

    pub fn apply_connectivity(&mut self, state: ConnectionState) {
        let connected = state == ConnectionState::Open;
        match state {
            ConnectionState::Closed | ConnectionState::Errored => {
                warn!("Control channel {:?}, suppressing interaction", state)
            }
            ConnectionState::Open => info!("Control channel open"),
            ConnectionState::Connecting => debug!("Control channel connecting"),
        }
        self.snapshot_tx.send_if_modified(|s| {
            let changed = s.connected != connected;
            s.connected = connected;
            changed
        });
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PlayerEvent>,
        mut connectivity: watch::Receiver<ConnectionState>,
    ) -> eyre::Result<()> {
        let initial = *connectivity.borrow_and_update();
        self.apply_connectivity(initial);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => {
                            info!("Player event channel closed, shutting down");
                            break;
                        }
                    }
                },
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        info!("Session dropped, shutting down");
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    self.apply_connectivity(state);
                },
                Some(generation) = self.cooldown_rx.recv() => self.cooled_down(generation),
            }
        }
        Ok(())
    }
}
