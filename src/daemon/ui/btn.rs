use crate::daemon::orchestrator::{CommandError, DirectoryOptions, Orchestrator};
use crate::daemon::remote::Rpc;
use crate::daemon::ui::{Kiosk, nav_back, nav_home, nav_push};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Locale {
    #[default]
    Primary,
    Secondary,
}

impl Locale {
    pub fn toggled(self) -> Locale {
        match self {
            Locale::Primary => Locale::Secondary,
            Locale::Secondary => Locale::Primary,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct LocalizedLabel {
    pub primary: Arc<str>,
    pub secondary: Arc<str>,
}

impl LocalizedLabel {
    pub fn get(&self, locale: Locale) -> &Arc<str> {
        match locale {
            Locale::Primary => &self.primary,
            Locale::Secondary => &self.secondary,
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum NodeError {
    #[error("menu node '{0}' has both children and an action")]
    Both(Arc<str>),
    #[error("menu node '{0}' has neither children nor an action")]
    Neither(Arc<str>),
}

#[derive(Debug, Clone)]
pub enum Action {
    OpenSubmenu(MenuRef),
    /// Pops one menu level.
    Back,
    /// Returns straight to the root menu.
    Home,
    PlayFile(Arc<str>),
    PlayFirstVideo(Arc<str>),
    PlayDirectory {
        path: Arc<str>,
        options: DirectoryOptions,
    },
    Slideshow {
        pictures: Arc<str>,
        music: Option<Arc<str>>,
    },
    TogglePause,
    Stop,
    SetVolume(u8),
    ToggleMute,
}

impl Action {
    pub(in crate::daemon::ui) async fn invoke<R: Rpc>(&self, kiosk: &mut Kiosk<R>) {
        match self {
            Action::OpenSubmenu(node) => nav_push(kiosk, node.clone()).await,
            Action::Back => nav_back(kiosk).await,
            Action::Home => nav_home(kiosk).await,
            command => {
                let orchestrator = kiosk.orchestrator.clone();
                let command = command.clone();
                tokio::spawn(async move {
                    if let Err(e) = command.execute(&orchestrator).await {
                        tracing::warn!(error = %e, "Command failed");
                    }
                });
            }
        }
    }

    async fn execute<R: Rpc>(&self, orchestrator: &Orchestrator<R>) -> Result<(), CommandError> {
        match self {
            Action::PlayFile(path) => orchestrator.play_file(path).await,
            Action::PlayFirstVideo(directory) => orchestrator.play_first_video(directory).await,
            Action::PlayDirectory { path, options } => {
                orchestrator.play_directory(path, *options).await
            }
            Action::Slideshow { pictures, music } => {
                orchestrator
                    .play_slideshow(pictures, music.as_deref())
                    .await
            }
            Action::TogglePause => orchestrator.toggle_pause().await,
            Action::Stop => orchestrator.stop().await,
            Action::SetVolume(level) => orchestrator.set_volume(*level).await,
            Action::ToggleMute => orchestrator.toggle_mute().await,
            Action::OpenSubmenu(_) | Action::Back | Action::Home => {
                debug!("Navigation is not a remote command");
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub enum NodeContent {
    Children(Vec<MenuRef>),
    Action(Action),
}

#[derive(Debug)]
pub struct MenuNode {
    pub(in crate::daemon::ui) label: LocalizedLabel,
    pub(in crate::daemon::ui) accent: Option<Arc<str>>,
    pub(in crate::daemon::ui) content: NodeContent,
}

impl MenuNode {
    pub fn builder() -> MenuNodeBuilder {
        MenuNodeBuilder::default()
    }

    pub fn label(&self) -> &LocalizedLabel {
        &self.label
    }

    pub fn accent(&self) -> Option<&Arc<str>> {
        self.accent.as_ref()
    }

    pub fn children(&self) -> Option<&[MenuRef]> {
        match &self.content {
            NodeContent::Children(children) => Some(children),
            NodeContent::Action(_) => None,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match &self.content {
            NodeContent::Action(action) => Some(action),
            NodeContent::Children(_) => None,
        }
    }
}

#[derive(Default)]
pub struct MenuNodeBuilder {
    label: LocalizedLabel,
    accent: Option<Arc<str>>,
    children: Option<Vec<MenuRef>>,
    action: Option<Action>,
}

impl MenuNodeBuilder {
    pub fn label(mut self, label: LocalizedLabel) -> Self {
        self.label = label;
        self
    }

    pub fn accent(mut self, accent: Option<Arc<str>>) -> Self {
        self.accent = accent;
        self
    }

    pub fn children(mut self, children: Vec<MenuRef>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn on_select(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn build(self) -> Result<MenuNode, NodeError> {
        let content = match (self.children, self.action) {
            (Some(children), None) => NodeContent::Children(children),
            (None, Some(action)) => NodeContent::Action(action),
            (Some(_), Some(_)) => return Err(NodeError::Both(self.label.primary)),
            (None, None) => return Err(NodeError::Neither(self.label.primary)),
        };
        Ok(MenuNode {
            label: self.label,
            accent: self.accent,
            content,
        })
    }
}

/// Shared handle to a node of the menu tree. Two refs are equal only if they are the same node.
#[derive(Clone)]
pub struct MenuRef {
    pub(in crate::daemon::ui) inner: Arc<MenuNode>,
}

impl std::ops::Deref for MenuRef {
    type Target = MenuNode;

    fn deref(&self) -> &MenuNode {
        &self.inner
    }
}

impl From<MenuNode> for MenuRef {
    fn from(inner: MenuNode) -> Self {
        MenuRef {
            inner: Arc::new(inner),
        }
    }
}

impl std::fmt::Debug for MenuRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MenuRef")
            .field("label", &self.inner.label.primary)
            .finish()
    }
}

impl PartialEq for MenuRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for MenuRef {}
