use crate::config::{self, ButtonBehavior, Config};
use crate::daemon::orchestrator::DirectoryOptions;
use crate::daemon::ui::{Action, LocalizedLabel, MenuNode, MenuRef};
use clap::Args;
use eyre::{Context, ensure, eyre};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, Args, Clone)]
pub struct CheckArgs {
    /// Menu configuration to validate. Defaults to the built-in menu.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

#[tracing::instrument(skip(args))]
pub(crate) async fn run(args: &CheckArgs) -> eyre::Result<()> {
    let config = Config::load_or_builtin(args.config.as_deref()).await?;
    let root = build_tree(&config)?;
    info!("Menu has {} pages", config.pages.len());
    print!("{}", outline(&root));
    Ok(())
}

/// Turns the page graph of `config` into the immutable menu tree, rooted at the start page.
/// Pages referenced from several places are built once and shared.
pub(crate) fn build_tree(config: &Config) -> eyre::Result<MenuRef> {
    let mut built = HashMap::new();
    let mut visiting = Vec::new();
    build_page(config, config.start_page, &mut visiting, &mut built)
        .context("Invalid menu configuration")
}

fn build_page(
    config: &Config,
    id: Uuid,
    visiting: &mut Vec<Uuid>,
    built: &mut HashMap<Uuid, MenuRef>,
) -> eyre::Result<MenuRef> {
    if let Some(page) = built.get(&id) {
        return Ok(page.clone());
    }
    ensure!(!visiting.contains(&id), "menu page {} contains itself", id);
    let page = config
        .pages
        .get(&id)
        .ok_or_else(|| eyre!("menu page {} does not exist", id))?;
    ensure!(!page.buttons.is_empty(), "menu page {} has no buttons", id);
    debug!("Building page {} ({})", id, page.name.primary);

    visiting.push(id);
    let mut children = Vec::with_capacity(page.buttons.len());
    for button in &page.buttons {
        let action = match &button.behavior {
            ButtonBehavior::PushPage(target) => {
                Action::OpenSubmenu(build_page(config, *target, visiting, built)?)
            }
            ButtonBehavior::Back => Action::Back,
            ButtonBehavior::Home => Action::Home,
            ButtonBehavior::PlayFile { path } => Action::PlayFile(path.clone()),
            ButtonBehavior::PlayFirstVideo { directory } => {
                Action::PlayFirstVideo(directory.clone())
            }
            ButtonBehavior::PlayDirectory {
                path,
                shuffled,
                repeat_all,
            } => Action::PlayDirectory {
                path: path.clone(),
                options: DirectoryOptions {
                    shuffled: *shuffled,
                    repeat_all: *repeat_all,
                },
            },
            ButtonBehavior::Slideshow { pictures, music } => Action::Slideshow {
                pictures: pictures.clone(),
                music: music.clone(),
            },
            ButtonBehavior::TogglePause => Action::TogglePause,
            ButtonBehavior::Stop => Action::Stop,
            ButtonBehavior::SetVolume(level) => Action::SetVolume(*level),
            ButtonBehavior::ToggleMute => Action::ToggleMute,
        };
        children.push(
            MenuNode::builder()
                .label(localized(&button.label))
                .accent(button.accent.clone())
                .on_select(action)
                .build()?
                .into(),
        );
    }
    visiting.pop();

    let node: MenuRef = MenuNode::builder()
        .label(localized(&page.name))
        .accent(page.accent.clone())
        .children(children)
        .build()?
        .into();
    built.insert(id, node.clone());
    Ok(node)
}

fn localized(label: &config::Label) -> LocalizedLabel {
    LocalizedLabel {
        primary: label.primary.clone(),
        secondary: label.secondary.clone(),
    }
}

fn outline(root: &MenuRef) -> String {
    fn walk(out: &mut String, node: &MenuRef, depth: usize) {
        let indent = "  ".repeat(depth);
        let label = node.label();
        let _ = write!(out, "{indent}{} / {}", label.primary, label.secondary);
        if let Some(accent) = node.accent() {
            let _ = write!(out, " [{accent}]");
        }
        match node.action() {
            Some(Action::OpenSubmenu(submenu)) => {
                let _ = writeln!(out);
                walk(out, submenu, depth + 1);
            }
            Some(action) => {
                let _ = writeln!(out, " -> {}", describe(action));
            }
            None => {
                let _ = writeln!(out);
                for child in node.children().unwrap_or_default() {
                    walk(out, child, depth + 1);
                }
            }
        }
    }

    let mut out = String::new();
    walk(&mut out, root, 0);
    out
}

fn describe(action: &Action) -> String {
    match action {
        Action::OpenSubmenu(node) => format!("submenu {}", node.label().primary),
        Action::Back => "back".to_string(),
        Action::Home => "home".to_string(),
        Action::PlayFile(path) => format!("play {path}"),
        Action::PlayFirstVideo(directory) => format!("play first video in {directory}"),
        Action::PlayDirectory { path, options } => format!(
            "play {path} (shuffled: {}, repeat all: {})",
            options.shuffled, options.repeat_all
        ),
        Action::Slideshow {
            pictures,
            music: Some(music),
        } => format!("slideshow {pictures} with music {music}"),
        Action::Slideshow {
            pictures,
            music: None,
        } => format!("slideshow {pictures}"),
        Action::TogglePause => "pause/resume".to_string(),
        Action::Stop => "stop".to_string(),
        Action::SetVolume(level) => format!("volume {level}"),
        Action::ToggleMute => "mute/unmute".to_string(),
    }
}
