use crate::daemon::RunArgs;
use crate::menu::CheckArgs;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(version, about, author)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Eq, PartialEq, Subcommand, Clone)]
enum Commands {
    /// Drive the media player from the kiosk menu
    Run(RunArgs),
    /// Validate a menu configuration and print its tree
    Check(CheckArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e.into());
        }
    }
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
    stable_eyre::install()?;

    let cli = Cli::parse();
    tracing::debug!("Parsed command line arguments {:?}", &cli);

    match &cli.command {
        Some(Commands::Run(args)) => {
            daemon::run(args).await?;
        }
        Some(Commands::Check(args)) => {
            menu::run(args).await?;
        }
        None => {
            return Ok(());
        }
    }

    Ok(())
}

mod daemon;
mod menu;

mod config {
    use eyre::Context;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    static BUILTIN_MENU: &str = include_str!("../assets/menu.json");

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Config {
        #[serde(default)]
        pub remote: RemoteSettings,
        #[serde(default)]
        pub playback: PlaybackSettings,
        #[serde(default)]
        pub reconnect: ReconnectSettings,
        pub pages: HashMap<Uuid, Arc<Page>>,
        pub start_page: Uuid,
    }

    impl Config {
        /// The museum kiosk menu shipped with the binary.
        pub fn builtin() -> eyre::Result<Config> {
            serde_json::from_str(BUILTIN_MENU).context("Built-in menu is malformed")
        }

        pub async fn load(path: &Path) -> eyre::Result<Config> {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {:?}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {:?}", path))
        }

        pub async fn load_or_builtin(path: Option<&Path>) -> eyre::Result<Config> {
            match path {
                Some(path) => Config::load(path).await,
                None => Config::builtin(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RemoteSettings {
        pub host: String,
        pub port: u16,
    }

    impl Default for RemoteSettings {
        fn default() -> Self {
            RemoteSettings {
                host: "192.168.1.109".to_string(),
                port: 9090,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PlaybackSettings {
        pub video_volume: Option<u8>,
        pub slideshow_volume: Option<u8>,
        pub cooldown_ms: u64,
    }

    impl PlaybackSettings {
        pub fn cooldown(&self) -> Duration {
            Duration::from_millis(self.cooldown_ms)
        }
    }

    impl Default for PlaybackSettings {
        fn default() -> Self {
            PlaybackSettings {
                video_volume: None,
                slideshow_volume: None,
                cooldown_ms: 2000,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ReconnectSettings {
        /// Zero leaves a dropped connection down until the kiosk is restarted.
        pub attempts: u32,
        pub initial_delay_ms: u64,
        pub max_delay_ms: u64,
    }

    impl Default for ReconnectSettings {
        fn default() -> Self {
            ReconnectSettings {
                attempts: 0,
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Label {
        pub primary: Arc<str>,
        pub secondary: Arc<str>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Page {
        pub name: Label,
        #[serde(default)]
        pub accent: Option<Arc<str>>,
        pub buttons: Vec<Button>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Button {
        pub label: Label,
        #[serde(default)]
        pub accent: Option<Arc<str>>,
        pub behavior: ButtonBehavior,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub enum ButtonBehavior {
        PushPage(Uuid),
        Back,
        Home,
        PlayFile {
            path: Arc<str>,
        },
        PlayFirstVideo {
            directory: Arc<str>,
        },
        PlayDirectory {
            path: Arc<str>,
            #[serde(default)]
            shuffled: bool,
            #[serde(default)]
            repeat_all: bool,
        },
        Slideshow {
            pictures: Arc<str>,
            #[serde(default)]
            music: Option<Arc<str>>,
        },
        TogglePause,
        Stop,
        SetVolume(u8),
        ToggleMute,
    }
}
