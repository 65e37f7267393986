use crate::daemon::orchestrator::Orchestrator;
use crate::daemon::player::PlayerSnapshot;
use crate::daemon::remote::Rpc;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod btn;

pub use btn::{Action, Locale, LocalizedLabel, MenuNode, MenuRef};

async fn nav_back<R: Rpc>(kiosk: &mut Kiosk<R>) {
    if kiosk.nav_stack.pop().is_none() {
        debug!("ignoring back at the root menu");
        return;
    }

    kiosk.display_top_page().await
}

async fn nav_home<R: Rpc>(kiosk: &mut Kiosk<R>) {
    kiosk.nav_stack.clear();
    kiosk.display_top_page().await
}

async fn nav_push<R: Rpc>(kiosk: &mut Kiosk<R>, node: MenuRef) {
    if node.children().is_none() {
        warn!("{:?} is not a submenu", node);
        return;
    }
    kiosk.nav_stack.push(node);
    kiosk.display_top_page().await
}

/// Menu navigation state: a static tree plus the stack of pages opened below its root.
pub struct Kiosk<R> {
    ui_command_tx: Sender<UiCommand>,
    ui_event_rx: Receiver<UiEvent>,
    orchestrator: Arc<Orchestrator<R>>,
    player_rx: watch::Receiver<PlayerSnapshot>,

    root: MenuRef,
    /// Empty while the root page is shown.
    nav_stack: Vec<MenuRef>,
    locale: Locale,
}

impl<R: Rpc> Kiosk<R> {
    pub fn new(
        root: MenuRef,
        orchestrator: Arc<Orchestrator<R>>,
        player_rx: watch::Receiver<PlayerSnapshot>,
    ) -> (Self, Sender<UiEvent>, Receiver<UiCommand>) {
        let (ui_event_tx, ui_event_rx) = tokio::sync::mpsc::channel(16);
        let (ui_command_tx, ui_command_rx) = tokio::sync::mpsc::channel(16);
        let kiosk = Kiosk {
            ui_command_tx,
            ui_event_rx,
            orchestrator,
            player_rx,
            root,
            nav_stack: Vec::new(),
            locale: Locale::default(),
        };
        (kiosk, ui_event_tx, ui_command_rx)
    }

    pub async fn init(&mut self) {
        self.display_top_page().await;
        let snapshot = *self.player_rx.borrow_and_update();
        self.send(UiCommand::Controls(snapshot)).await;
    }

    fn current(&self) -> &MenuRef {
        self.nav_stack.last().unwrap_or(&self.root)
    }

    fn screen(&self) -> Screen {
        let page = self.current();
        let items = page
            .children()
            .unwrap_or_default()
            .iter()
            .map(|node| ItemView {
                label: node.label().get(self.locale).clone(),
                accent: node.accent().cloned(),
                node: node.clone(),
            })
            .collect();
        Screen {
            title: page.label().get(self.locale).clone(),
            locale: self.locale,
            items,
        }
    }

    async fn display_top_page(&mut self) {
        let screen = self.screen();
        self.send(UiCommand::Flip(screen)).await;
    }

    async fn send(&self, command: UiCommand) {
        if self.ui_command_tx.send(command).await.is_err() {
            debug!("Presentation is gone, dropping update");
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(mut self) -> eyre::Result<()> {
        loop {
            tokio::select! {
                event = self.ui_event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Event channel closed, shutting down");
                            break;
                        }
                    }
                },
                changed = self.player_rx.changed() => {
                    if changed.is_err() {
                        info!("Player state gone, shutting down");
                        break;
                    }
                    let snapshot = *self.player_rx.borrow_and_update();
                    self.send(UiCommand::Controls(snapshot)).await;
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "trace")]
    async fn handle_event(&mut self, event: UiEvent) {
        let snapshot = *self.player_rx.borrow();
        match event {
            UiEvent::SetLocale(locale) => {
                self.locale = locale;
                self.display_top_page().await;
            }
            _ if !snapshot.connected => {
                debug!("Not connected, ignoring input");
            }
            UiEvent::Select(node) => {
                let on_page = self
                    .current()
                    .children()
                    .is_some_and(|children| children.contains(&node));
                if !on_page {
                    debug!("{:?} is not on the current page, ignoring", node);
                    return;
                }
                match node.action() {
                    Some(action) => action.invoke(self).await,
                    None => warn!("{:?} has no action", node),
                }
            }
            UiEvent::Transport(control) => {
                let action = match control {
                    TransportControl::TogglePause if snapshot.controls_visible() => {
                        Action::TogglePause
                    }
                    TransportControl::Stop if snapshot.controls_visible() => Action::Stop,
                    TransportControl::ToggleMute => Action::ToggleMute,
                    _ => {
                        debug!("Transport controls hidden, ignoring {:?}", control);
                        return;
                    }
                };
                action.invoke(self).await;
            }
        }
    }
}

mod iface;
pub use iface::{ItemView, Screen, TransportControl, UiCommand, UiEvent};
