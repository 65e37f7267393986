use crate::daemon::player::PlayerSnapshot;
use crate::daemon::ui::{Locale, MenuRef};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportControl {
    TogglePause,
    Stop,
    ToggleMute,
}

#[derive(Debug)]
pub enum UiEvent {
    Select(MenuRef),
    Transport(TransportControl),
    SetLocale(Locale),
}

/// One visible entry of the current menu page.
#[derive(Debug, Clone)]
pub struct ItemView {
    pub label: Arc<str>,
    pub accent: Option<Arc<str>>,
    pub node: MenuRef,
}

#[derive(Debug, Clone)]
pub struct Screen {
    pub title: Arc<str>,
    pub locale: Locale,
    pub items: Vec<ItemView>,
}

pub enum UiCommand {
    Flip(Screen),
    Controls(PlayerSnapshot),
}

impl std::fmt::Debug for UiCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UiCommand::Flip(screen) => write!(f, "Flip({})", screen.title),
            UiCommand::Controls(snapshot) => write!(f, "Controls({:?})", snapshot),
        }
    }
}
