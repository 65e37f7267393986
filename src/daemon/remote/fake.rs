//! In-memory stand-in for the remote player, used by tests throughout the daemon.

use crate::daemon::remote::{RemoteError, Rpc};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeActivePlayer {
    pub id: i64,
    pub item: Value,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub active: Vec<FakeActivePlayer>,
    pub calls: Vec<(String, Value)>,
    pub failing_stops: HashSet<i64>,
    pub failing_methods: HashSet<String>,
    pub directories: HashMap<String, Vec<String>>,
    pub volume: Option<u64>,
    pub muted: bool,
    next_player: i64,
}

impl FakeState {
    pub fn start(&mut self, item: Value) -> i64 {
        self.next_player += 1;
        let id = self.next_player;
        self.active.push(FakeActivePlayer {
            id,
            item,
            paused: false,
        });
        id
    }

    pub fn active_items(&self) -> Vec<Value> {
        self.active.iter().map(|p| p.item.clone()).collect()
    }

    pub fn methods(&self) -> Vec<&str> {
        self.calls.iter().map(|(m, _)| m.as_str()).collect()
    }
}

#[derive(Debug, Default)]
pub struct FakePlayer {
    state: Mutex<FakeState>,
}

impl FakePlayer {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn handle(&self, method: &str, params: &Value) -> Result<Value, RemoteError> {
        let mut state = self.state();
        state.calls.push((method.to_string(), params.clone()));
        if state.failing_methods.contains(method) {
            return Err(invalid_params());
        }
        match method {
            "Player.GetActivePlayers" => Ok(Value::Array(
                state
                    .active
                    .iter()
                    .map(|p| json!({"playerid": p.id, "type": "video"}))
                    .collect(),
            )),
            "Player.Stop" => {
                let id = params["playerid"].as_i64().ok_or_else(invalid_params)?;
                if state.failing_stops.contains(&id) {
                    return Err(invalid_params());
                }
                state.active.retain(|p| p.id != id);
                Ok(json!("OK"))
            }
            "Player.PlayPause" => {
                let id = params["playerid"].as_i64().ok_or_else(invalid_params)?;
                let player = state
                    .active
                    .iter_mut()
                    .find(|p| p.id == id)
                    .ok_or_else(invalid_params)?;
                player.paused = !player.paused;
                Ok(json!({"speed": if player.paused { 0 } else { 1 }}))
            }
            "Player.Open" => {
                let item = params["item"].clone();
                if item.get("file").is_none() && item.get("directory").is_none() {
                    return Err(invalid_params());
                }
                state.start(item);
                Ok(json!("OK"))
            }
            "Files.GetDirectory" => {
                let directory = params["directory"].as_str().ok_or_else(invalid_params)?;
                match state.directories.get(directory) {
                    Some(files) => Ok(json!({
                        "files": files
                            .iter()
                            .map(|f| json!({"file": f, "filetype": "file", "label": f}))
                            .collect::<Vec<_>>(),
                    })),
                    None => Ok(json!({"limits": {"start": 0, "end": 0, "total": 0}})),
                }
            }
            "Application.SetVolume" => {
                let volume = params["volume"].as_u64().ok_or_else(invalid_params)?;
                state.volume = Some(volume);
                Ok(json!(volume))
            }
            "Application.SetMute" => {
                state.muted = !state.muted;
                Ok(json!(state.muted))
            }
            _ => Err(RemoteError::Remote {
                code: -32601,
                message: "Method not found.".to_string(),
            }),
        }
    }
}

fn invalid_params() -> RemoteError {
    RemoteError::Remote {
        code: -32602,
        message: "Invalid params.".to_string(),
    }
}

impl Rpc for FakePlayer {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        // Suspend on both sides of the request so concurrent callers interleave.
        tokio::task::yield_now().await;
        let result = self.handle(method, &params);
        tokio::task::yield_now().await;
        result
    }
}
