use crate::config::Config;
use crate::daemon::orchestrator::{Orchestrator, VolumePresets};
use crate::daemon::player::{PlayerSnapshot, PlayerStatus, Synchronizer};
use crate::daemon::remote::{Backoff, ConnectionState, Session};
use crate::daemon::ui::{Kiosk, Screen, TransportControl, UiCommand, UiEvent};
use clap::Args;
use eyre::Context;
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub mod orchestrator;
pub mod player;
pub mod remote;
pub mod ui;

#[derive(Debug, Eq, PartialEq, Args, Clone)]
pub struct RunArgs {
    /// Menu configuration. Defaults to the built-in menu.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
    /// Media player host, overriding the configuration
    #[arg(long, env = "KIOSK_HOST")]
    pub host: Option<String>,
    /// Media player control port, overriding the configuration
    #[arg(long, env = "KIOSK_PORT")]
    pub port: Option<u16>,
}

#[tracing::instrument(skip(args))]
pub async fn run(args: &RunArgs) -> Result<(), eyre::Error> {
    let mut config = Config::load_or_builtin(args.config.as_deref()).await?;
    if let Some(host) = &args.host {
        config.remote.host = host.clone();
    }
    if let Some(port) = args.port {
        config.remote.port = port;
    }
    let root = crate::menu::build_tree(&config)?;

    let session = Session::connect(config.remote.host.clone(), config.remote.port)
        .await
        .with_context(|| format!("Failed to connect to {:?}", &config.remote))?;
    let session = Arc::new(session);
    info!("Control channel open to {}", session.endpoint().url());

    let player_events = player::attach(&session);
    let (synchronizer, player_rx) = Synchronizer::new(config.playback.cooldown());
    let sync_finished = tokio::spawn(synchronizer.run(player_events, session.watch_state()));

    let orchestrator = Arc::new(Orchestrator::new(
        session.clone(),
        VolumePresets {
            video: config.playback.video_volume,
            slideshow: config.playback.slideshow_volume,
        },
    ));
    let (mut kiosk, event_tx, mut command_rx) =
        Kiosk::new(root, orchestrator.clone(), player_rx);
    kiosk.init().await;
    let kiosk_finished = tokio::spawn(kiosk.run());

    let mut reconnector = Reconnector::new(
        session.clone(),
        Backoff {
            attempts: config.reconnect.attempts,
            initial_delay: Duration::from_millis(config.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
        },
    );
    let mut state = ConsoleState {
        screen: None,
        player: PlayerSnapshot::default(),
        event_tx,
    };
    let mut stdout = tokio::io::stdout();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut connectivity = session.watch_state();
    let sigint = tokio::signal::ctrl_c();
    tokio::pin!(sigint);

    'infinite: loop {
        tokio::select! {
            line = input.next_line() => {
                match line.context("Failed to read console input")? {
                    Some(line) => match state.handle_input(&line).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => {
                            info!("Quit requested");
                            break 'infinite;
                        }
                        Err(e) => {
                            warn!(error = %e, "Error handling input");
                            break 'infinite;
                        }
                    },
                    None => {
                        info!("Console input closed");
                        break 'infinite;
                    }
                }
            },
            command = command_rx.recv() => {
                if let Some(command) = command {
                    state.handle_command(command);
                    stdout.write_all(state.render().as_bytes()).await?;
                    stdout.flush().await?;
                } else {
                    info!("Command channel closed");
                    break 'infinite;
                }
            },
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break 'infinite;
                }
                let current = *connectivity.borrow_and_update();
                reconnector.observe(current);
            },
            sigint_result = &mut sigint => {
                match sigint_result {
                    Ok(_) => {
                        info!("Received SIGINT, shutting down gracefully");
                        break 'infinite;
                    }
                    Err(e) => {
                        warn!(error = %e, "Error waiting for SIGINT");
                        break 'infinite;
                    }
                }
            }
        }
    }

    reconnector.shutdown().await;
    drop(state);
    drop(command_rx);
    kiosk_finished.await??;
    if session.state() == ConnectionState::Open {
        match tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.stop_all()).await {
            Ok(Ok(())) => debug!("Playback stopped"),
            Ok(Err(e)) => warn!(error = %e, "Failed to stop playback on shutdown"),
            Err(_) => warn!("Player did not stop within {:?}", SHUTDOWN_GRACE),
        }
    }
    session.close().await;
    sync_finished.abort();
    Ok(())
}

/// Redials the player in the background whenever an open connection drops, so the event loop
/// keeps serving input while the backoff runs.
struct Reconnector {
    session: Arc<Session>,
    backoff: Backoff,
    was_open: bool,
    task: Option<JoinHandle<()>>,
}

impl Reconnector {
    fn new(session: Arc<Session>, backoff: Backoff) -> Self {
        let was_open = session.state() == ConnectionState::Open;
        Reconnector {
            session,
            backoff,
            was_open,
            task: None,
        }
    }

    fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn observe(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Open => self.was_open = true,
            ConnectionState::Closed | ConnectionState::Errored if self.was_open => {
                self.was_open = false;
                if self.backoff.attempts == 0 {
                    warn!("Control channel lost, restart the kiosk to reconnect");
                } else if self.is_pending() {
                    debug!("Reconnect already under way");
                } else {
                    let session = self.session.clone();
                    let backoff = self.backoff;
                    self.task = Some(tokio::spawn(async move {
                        if let Err(e) = session.reconnect(&backoff).await {
                            warn!(error = %e, "Giving up on reconnecting");
                        }
                    }));
                }
            }
            _ => {}
        }
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Reconnect task failed");
                }
            }
        }
    }
}

/// Line-oriented stand-in for the kiosk screen.
struct ConsoleState {
    screen: Option<Screen>,
    player: PlayerSnapshot,
    event_tx: Sender<UiEvent>,
}

impl ConsoleState {
    fn handle_command(&mut self, command: UiCommand) {
        debug!("Presenting {:?}", command);
        match command {
            UiCommand::Flip(screen) => self.screen = Some(screen),
            UiCommand::Controls(player) => self.player = player,
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let Some(screen) = &self.screen else {
            return out;
        };
        let _ = writeln!(out, "\n== {} ==", screen.title);
        for (i, item) in screen.items.iter().enumerate() {
            match &item.accent {
                Some(accent) => {
                    let _ = writeln!(out, "  {}. {} ({})", i + 1, item.label, accent);
                }
                None => {
                    let _ = writeln!(out, "  {}. {}", i + 1, item.label);
                }
            }
        }
        if !self.player.connected {
            let _ = writeln!(out, "  (player unavailable)");
        } else if self.player.controls_visible() {
            let state = if self.player.status == PlayerStatus::Paused {
                "paused"
            } else {
                "playing"
            };
            let _ = writeln!(out, "  [{state}]  p: pause/resume  s: stop  m: mute");
        } else if self.player.quiescent {
            let _ = writeln!(out, "  [ready]");
        }
        out
    }

    /// Maps one line of console input to a kiosk event.
    async fn handle_input(&mut self, line: &str) -> eyre::Result<ControlFlow<()>> {
        let event = match line.trim() {
            "" => return Ok(ControlFlow::Continue(())),
            "q" => return Ok(ControlFlow::Break(())),
            "p" => UiEvent::Transport(TransportControl::TogglePause),
            "s" => UiEvent::Transport(TransportControl::Stop),
            "m" => UiEvent::Transport(TransportControl::ToggleMute),
            "l" => {
                let locale = self.screen.as_ref().map(|s| s.locale).unwrap_or_default();
                UiEvent::SetLocale(locale.toggled())
            }
            other => {
                let Some(item) = other
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| self.screen.as_ref()?.items.get(i))
                else {
                    debug!("Ignoring console input {:?}", other);
                    return Ok(ControlFlow::Continue(()));
                };
                UiEvent::Select(item.node.clone())
            }
        };
        self.event_tx.send(event).await?;
        Ok(ControlFlow::Continue(()))
    }
}
