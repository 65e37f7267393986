use crate::daemon::remote::{RemoteError, Rpc};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
#[error("{operation} failed: {cause}")]
pub struct CommandError {
    pub operation: &'static str,
    #[source]
    pub cause: RemoteError,
}

impl CommandError {
    fn wrap(operation: &'static str) -> impl FnOnce(RemoteError) -> CommandError {
        move |cause| CommandError { operation, cause }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DirectoryOptions {
    pub shuffled: bool,
    pub repeat_all: bool,
}

/// Volume levels forced right after opening a kind of content. `None` leaves the volume alone.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct VolumePresets {
    pub video: Option<u8>,
    pub slideshow: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct ActivePlayer {
    playerid: i64,
}

#[derive(Debug, Deserialize)]
struct DirectoryListing {
    #[serde(default)]
    files: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    file: String,
    #[serde(default)]
    filetype: Option<String>,
}

/// Funnels every playback-affecting action to the remote player.
///
/// Playback-starting commands hold `sequence` from their stop phase through their open phase, so
/// two of them never interleave and the last one to finish is the only one left playing.
pub struct Orchestrator<R> {
    remote: Arc<R>,
    presets: VolumePresets,
    sequence: Mutex<()>,
}

impl<R: Rpc> Orchestrator<R> {
    pub fn new(remote: Arc<R>, presets: VolumePresets) -> Self {
        Orchestrator {
            remote,
            presets,
            sequence: Mutex::new(()),
        }
    }

    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Result<(), CommandError> {
        let _sequence = self.sequence.lock().await;
        self.stop_active("stop_all").await
    }

    #[instrument(skip(self))]
    pub async fn play_file(&self, path: &str) -> Result<(), CommandError> {
        const OPERATION: &str = "play_file";
        let _sequence = self.sequence.lock().await;
        self.stop_active(OPERATION).await?;
        self.open(OPERATION, json!({"item": {"file": path}})).await?;
        self.apply_preset(OPERATION, self.presets.video).await
    }

    /// Plays the first video file listed in `directory`.
    #[instrument(skip(self))]
    pub async fn play_first_video(&self, directory: &str) -> Result<(), CommandError> {
        const OPERATION: &str = "play_first_video";
        let _sequence = self.sequence.lock().await;
        self.stop_active(OPERATION).await?;

        let listing = self
            .remote
            .call(
                "Files.GetDirectory",
                json!({"directory": directory, "media": "video"}),
            )
            .await
            .map_err(CommandError::wrap(OPERATION))?;
        let listing: DirectoryListing = serde_json::from_value(listing)
            .map_err(|e| RemoteError::Protocol(e.to_string()))
            .map_err(CommandError::wrap(OPERATION))?;
        let file = listing
            .files
            .into_iter()
            .find(|entry| entry.filetype.as_deref() != Some("directory"))
            .ok_or_else(|| RemoteError::Protocol(format!("{directory} holds no video")))
            .map_err(CommandError::wrap(OPERATION))?
            .file;
        debug!("Playing {}", file);

        self.open(OPERATION, json!({"item": {"file": file}})).await?;
        self.apply_preset(OPERATION, self.presets.video).await
    }

    /// Plays a whole directory. Directories are slideshows or screensaver music, so the slideshow
    /// volume preset applies. Single files take the video preset.
    #[instrument(skip(self))]
    pub async fn play_directory(
        &self,
        path: &str,
        options: DirectoryOptions,
    ) -> Result<(), CommandError> {
        const OPERATION: &str = "play_directory";
        let _sequence = self.sequence.lock().await;
        self.stop_active(OPERATION).await?;
        self.open(OPERATION, directory_request(path, options)).await?;
        self.apply_preset(OPERATION, self.presets.slideshow).await
    }

    /// Opens a picture slideshow and, after it, an optional shuffled music bed. The pictures go
    /// first so the visual player is the one transport controls end up targeting.
    #[instrument(skip(self))]
    pub async fn play_slideshow(
        &self,
        pictures: &str,
        music: Option<&str>,
    ) -> Result<(), CommandError> {
        const OPERATION: &str = "play_slideshow";
        let _sequence = self.sequence.lock().await;
        self.stop_active(OPERATION).await?;
        self.open(
            OPERATION,
            directory_request(pictures, DirectoryOptions::default()),
        )
        .await?;
        if let Some(music) = music {
            let options = DirectoryOptions {
                shuffled: true,
                repeat_all: true,
            };
            self.open(OPERATION, directory_request(music, options))
                .await?;
        }
        self.apply_preset(OPERATION, self.presets.slideshow).await
    }

    #[instrument(skip(self))]
    pub async fn toggle_pause(&self) -> Result<(), CommandError> {
        self.for_each_active("toggle_pause", "Player.PlayPause")
            .await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), CommandError> {
        self.for_each_active("stop", "Player.Stop").await
    }

    #[instrument(skip(self))]
    pub async fn set_volume(&self, level: u8) -> Result<(), CommandError> {
        self.remote
            .call("Application.SetVolume", json!({"volume": level}))
            .await
            .map_err(CommandError::wrap("set_volume"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn toggle_mute(&self) -> Result<(), CommandError> {
        self.remote
            .call("Application.SetMute", json!({"mute": "toggle"}))
            .await
            .map_err(CommandError::wrap("toggle_mute"))?;
        Ok(())
    }

    /// Asks the remote side which players are running right now. Never cached: players come and
    /// go through other clients too.
    async fn active_players(&self) -> Result<Vec<i64>, RemoteError> {
        let players = self
            .remote
            .call("Player.GetActivePlayers", json!({}))
            .await?;
        let players: Vec<ActivePlayer> =
            serde_json::from_value(players).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(players.into_iter().map(|p| p.playerid).collect())
    }

    /// Stops every active player concurrently and waits for all of them to settle. A player that
    /// refuses to stop does not keep the others running.
    async fn stop_active(&self, operation: &'static str) -> Result<(), CommandError> {
        let players = self
            .active_players()
            .await
            .map_err(CommandError::wrap(operation))?;
        if players.is_empty() {
            debug!("No active players to stop");
            return Ok(());
        }

        let results = join_all(
            players
                .iter()
                .map(|id| self.remote.call("Player.Stop", json!({"playerid": id}))),
        )
        .await;
        for (id, result) in players.iter().zip(results) {
            if let Err(e) = result {
                warn!(error = %e, "Failed to stop player {}", id);
            }
        }
        Ok(())
    }

    async fn for_each_active(
        &self,
        operation: &'static str,
        method: &'static str,
    ) -> Result<(), CommandError> {
        let players = self
            .active_players()
            .await
            .map_err(CommandError::wrap(operation))?;
        let results = join_all(
            players
                .iter()
                .map(|id| self.remote.call(method, json!({"playerid": id}))),
        )
        .await;

        let mut first_error = None;
        for (id, result) in players.iter().zip(results) {
            if let Err(e) = result {
                warn!(error = %e, "{} failed for player {}", method, id);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(cause) => Err(CommandError { operation, cause }),
            None => Ok(()),
        }
    }

    async fn open(&self, operation: &'static str, request: Value) -> Result<(), CommandError> {
        info!("Opening {}", request["item"]);
        self.remote
            .call("Player.Open", request)
            .await
            .map_err(CommandError::wrap(operation))?;
        Ok(())
    }

    async fn apply_preset(
        &self,
        operation: &'static str,
        preset: Option<u8>,
    ) -> Result<(), CommandError> {
        let Some(level) = preset else {
            return Ok(());
        };
        debug!("Applying volume preset {}", level);
        self.remote
            .call("Application.SetVolume", json!({"volume": level}))
            .await
            .map_err(CommandError::wrap(operation))?;
        Ok(())
    }
}

fn directory_request(path: &str, options: DirectoryOptions) -> Value {
    json!({
        "item": {"directory": path},
        "options": {
            "shuffled": options.shuffled,
            "repeat": if options.repeat_all { "all" } else { "off" },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::remote::fake::FakePlayer;
    use assert_matches::assert_matches;

    fn orchestrator(presets: VolumePresets) -> (Arc<FakePlayer>, Arc<Orchestrator<FakePlayer>>) {
        let fake = Arc::new(FakePlayer::default());
        let orchestrator = Arc::new(Orchestrator::new(fake.clone(), presets));
        (fake, orchestrator)
    }

    #[tokio::test]
    async fn stop_all_without_players_is_a_no_op() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        orchestrator.stop_all().await.unwrap();
        assert_eq!(fake.state().methods(), vec!["Player.GetActivePlayers"]);
    }

    #[tokio::test]
    async fn stop_all_keeps_going_past_a_failing_player() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        {
            let mut state = fake.state();
            let first = state.start(json!({"file": "a.mp4"}));
            state.start(json!({"file": "b.mp3"}));
            state.start(json!({"directory": "/pictures"}));
            state.failing_stops.insert(first);
        }

        orchestrator.stop_all().await.unwrap();

        let state = fake.state();
        assert_eq!(state.active_items(), vec![json!({"file": "a.mp4"})]);
        assert_eq!(
            state.methods().iter().filter(|m| **m == "Player.Stop").count(),
            3
        );
    }

    #[tokio::test]
    async fn play_file_leaves_only_the_new_item() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        fake.state().start(json!({"file": "old.mp4"}));

        orchestrator.play_file("/storage/videos/new.mp4").await.unwrap();

        let state = fake.state();
        assert_eq!(
            state.active_items(),
            vec![json!({"file": "/storage/videos/new.mp4"})]
        );
        assert_eq!(
            state.methods(),
            vec!["Player.GetActivePlayers", "Player.Stop", "Player.Open"]
        );
    }

    #[tokio::test]
    async fn concurrent_plays_never_leave_both_active() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        fake.state().start(json!({"file": "old.mp4"}));

        let a = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.play_file("A").await })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.play_file("B").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let active = fake.state().active_items();
        assert_eq!(active.len(), 1);
        assert!(active[0] == json!({"file": "A"}) || active[0] == json!({"file": "B"}));
    }

    #[tokio::test]
    async fn first_video_of_directory_is_opened() {
        let (fake, orchestrator) = orchestrator(VolumePresets {
            video: Some(90),
            slideshow: None,
        });
        fake.state().directories.insert(
            "/storage/videos/".to_string(),
            vec!["/storage/videos/demo.mp4".to_string(), "/storage/videos/b.mp4".to_string()],
        );

        orchestrator.play_first_video("/storage/videos/").await.unwrap();

        let state = fake.state();
        assert_eq!(
            state.active_items(),
            vec![json!({"file": "/storage/videos/demo.mp4"})]
        );
        assert_eq!(state.volume, Some(90));
        let (_, listing_params) = &state.calls[1];
        assert_eq!(listing_params["media"], "video");
    }

    #[tokio::test]
    async fn empty_directory_is_a_command_error() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        let result = orchestrator.play_first_video("/storage/empty/").await;
        assert_matches!(
            result,
            Err(CommandError { operation: "play_first_video", cause: RemoteError::Protocol(_) })
        );
        assert!(fake.state().active.is_empty());
    }

    #[tokio::test]
    async fn slideshow_opens_pictures_before_music() {
        let (fake, orchestrator) = orchestrator(VolumePresets {
            video: None,
            slideshow: Some(40),
        });
        fake.state().start(json!({"file": "old.mp4"}));

        orchestrator
            .play_slideshow("/storage/images/inmigración", Some("/storage/music"))
            .await
            .unwrap();

        let state = fake.state();
        assert_eq!(
            state.active_items(),
            vec![
                json!({"directory": "/storage/images/inmigración"}),
                json!({"directory": "/storage/music"}),
            ]
        );
        let opens: Vec<_> = state
            .calls
            .iter()
            .filter(|(m, _)| m == "Player.Open")
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(opens[1]["options"], json!({"shuffled": true, "repeat": "all"}));
        assert_eq!(state.volume, Some(40));
    }

    #[tokio::test]
    async fn play_directory_passes_modifiers() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        orchestrator
            .play_directory(
                "/storage/music",
                DirectoryOptions {
                    shuffled: true,
                    repeat_all: false,
                },
            )
            .await
            .unwrap();
        let state = fake.state();
        let (method, params) = state.calls.last().unwrap();
        assert_eq!(method, "Player.Open");
        assert_eq!(params["options"], json!({"shuffled": true, "repeat": "off"}));
        assert_eq!(state.volume, None);
    }

    #[tokio::test]
    async fn play_directory_takes_the_slideshow_preset() {
        let (fake, orchestrator) = orchestrator(VolumePresets {
            video: Some(90),
            slideshow: Some(35),
        });
        orchestrator
            .play_directory("/storage/images/inmigración", DirectoryOptions::default())
            .await
            .unwrap();
        let state = fake.state();
        assert_eq!(
            state.active_items(),
            vec![json!({"directory": "/storage/images/inmigración"})]
        );
        assert_eq!(state.methods().last(), Some(&"Application.SetVolume"));
        assert_eq!(state.volume, Some(35));
    }

    #[tokio::test]
    async fn transport_controls_requery_active_players() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        fake.state().start(json!({"file": "a.mp4"}));
        orchestrator.toggle_pause().await.unwrap();
        assert!(fake.state().active[0].paused);

        // A player started by someone else is picked up on the next command.
        fake.state().start(json!({"file": "b.mp3"}));
        orchestrator.toggle_pause().await.unwrap();
        {
            let state = fake.state();
            assert!(!state.active[0].paused);
            assert!(state.active[1].paused);
        }

        orchestrator.stop().await.unwrap();
        let state = fake.state();
        assert!(state.active.is_empty());
        assert_eq!(
            state
                .methods()
                .iter()
                .filter(|m| **m == "Player.GetActivePlayers")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn transport_failure_is_reported_after_all_players_settle() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        {
            let mut state = fake.state();
            let stuck = state.start(json!({"file": "a.mp4"}));
            state.start(json!({"file": "b.mp4"}));
            state.failing_stops.insert(stuck);
        }
        let result = orchestrator.stop().await;
        assert_matches!(result, Err(CommandError { operation: "stop", .. }));
        assert_eq!(fake.state().active_items(), vec![json!({"file": "a.mp4"})]);
    }

    #[tokio::test]
    async fn volume_and_mute_bypass_stop_all() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        fake.state().start(json!({"file": "a.mp4"}));
        orchestrator.set_volume(55).await.unwrap();
        orchestrator.toggle_mute().await.unwrap();
        let state = fake.state();
        assert_eq!(state.volume, Some(55));
        assert!(state.muted);
        assert_eq!(state.active.len(), 1);
        assert_eq!(state.methods(), vec!["Application.SetVolume", "Application.SetMute"]);
    }

    #[tokio::test]
    async fn failed_open_surfaces_the_operation() {
        let (fake, orchestrator) = orchestrator(VolumePresets::default());
        fake.state()
            .failing_methods
            .insert("Player.Open".to_string());
        let result = orchestrator.play_file("x.mp4").await;
        assert_matches!(
            result,
            Err(CommandError { operation: "play_file", cause: RemoteError::Remote { code: -32602, .. } })
        );
    }
}
