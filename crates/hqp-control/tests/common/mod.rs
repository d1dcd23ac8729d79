//! Shared fixtures: an in-process fake HQPlayer control port and a scripted
//! profile store.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hqp_control::{ProfileRef, ProfileStore};
use hqp_proto::codec::{decode, Decoded, Element, XML_DECLARATION};
use hqp_proto::ControlError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Mutable state of the fake daemon.
#[derive(Debug)]
pub struct FakeState {
    pub state: u8,
    pub volume_tenths: i32,
    pub min_tenths: i32,
    pub max_tenths: i32,
    pub track: u32,
    /// Command names in arrival order.
    pub requests: Vec<String>,
    pub connections: usize,
    /// Replies are written in two halves with a pause between them.
    pub split_replies: bool,
    /// Requests are read but never answered.
    pub silent: bool,
    /// Replies are replaced by this junk.
    pub garbage: Option<&'static str>,
    /// `Play` answers `result="Error"` with this text.
    pub reject_play: Option<String>,
    /// Connections are accepted and closed immediately until this instant.
    pub down_until: Option<Instant>,
    /// Bumped by every restart; connections from an older generation are
    /// closed on their next request.
    pub generation: u64,
}

impl FakeState {
    /// Close every open connection and refuse service for `window`.
    pub fn restart(&mut self, window: Duration) {
        self.generation += 1;
        self.down_until = Some(Instant::now() + window);
    }
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            state: 0,
            volume_tenths: -210,
            min_tenths: -600,
            max_tenths: 0,
            track: 1,
            requests: Vec::new(),
            connections: 0,
            split_replies: false,
            silent: false,
            garbage: None,
            reject_play: None,
            down_until: None,
            generation: 0,
        }
    }
}

pub struct FakeHqplayer {
    pub addr: String,
    pub state: Arc<Mutex<FakeState>>,
    task: JoinHandle<()>,
}

impl FakeHqplayer {
    pub async fn start() -> Self {
        Self::start_with(FakeState::default()).await
    }

    pub async fn start_with(state: FakeState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(state));
        let shared = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = shared.clone();
                tokio::spawn(handle_connection(stream, state));
            }
        });
        Self { addr, state, task }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn requests(&self) -> Vec<String> {
        self.with(|s| s.requests.clone())
    }

    /// Simulate a daemon restart: existing connections die and new ones are
    /// refused for `window`.
    pub fn go_down_for(&self, window: Duration) {
        self.with(|s| s.restart(window));
    }
}

impl Drop for FakeHqplayer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

async fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<FakeState>>) {
    let (down, generation) = {
        let mut s = state.lock().unwrap();
        s.connections += 1;
        (
            s.down_until.is_some_and(|until| Instant::now() < until),
            s.generation,
        )
    };
    if down {
        return;
    }

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);

        while let Ok(Decoded::Complete { element, consumed }) = decode(&buf) {
            buf.drain(..consumed);
            let (reply, split, silent) = {
                let mut s = state.lock().unwrap();
                if s.generation != generation {
                    return;
                }
                s.requests.push(element.name.clone());
                let reply = match s.garbage {
                    Some(junk) => junk.to_string(),
                    None => respond(&mut s, &element),
                };
                (reply, s.split_replies, s.silent)
            };
            if silent {
                continue;
            }
            let bytes = reply.into_bytes();
            if split {
                let mid = bytes.len() / 2;
                if stream.write_all(&bytes[..mid]).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                if stream.write_all(&bytes[mid..]).await.is_err() {
                    return;
                }
            } else if stream.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

fn respond(s: &mut FakeState, request: &Element) -> String {
    let ok = |name: &str| format!("{XML_DECLARATION}<{name} result=\"OK\"/>\n");
    let step = || {
        request
            .attr("value")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| (v * 10.0).round() as i32)
            .unwrap_or(10)
    };
    match request.name.as_str() {
        "Status" => format!(
            "{XML_DECLARATION}<Status active_filter=\"poly-sinc-gauss-long\" active_mode=\"PCM\" active_rate=\"705600\" state=\"{}\" track=\"{}\" tracks_total=\"12\" position=\"75\" length=\"241\" volume=\"{}\"/>\n",
            s.state,
            s.track,
            format_tenths(s.volume_tenths)
        ),
        "Volume" => {
            if let Some(v) = request.attr("value").and_then(|v| v.parse::<f64>().ok()) {
                s.volume_tenths = ((v * 10.0).round() as i32).clamp(s.min_tenths, s.max_tenths);
            }
            ok("Volume")
        }
        "VolumeUp" => {
            s.volume_tenths = (s.volume_tenths + step()).clamp(s.min_tenths, s.max_tenths);
            ok("VolumeUp")
        }
        "VolumeDown" => {
            s.volume_tenths = (s.volume_tenths - step()).clamp(s.min_tenths, s.max_tenths);
            ok("VolumeDown")
        }
        "VolumeRange" => format!(
            "{XML_DECLARATION}<VolumeRange min=\"{}\" max=\"{}\"/>\n",
            format_tenths(s.min_tenths),
            format_tenths(s.max_tenths)
        ),
        "Play" => match &s.reject_play {
            Some(message) => format!("{XML_DECLARATION}<Play result=\"Error\">{message}</Play>\n"),
            None => {
                s.state = 1;
                ok("Play")
            }
        },
        "Pause" => {
            s.state = 2;
            ok("Pause")
        }
        "Stop" => {
            s.state = 0;
            ok("Stop")
        }
        "Next" => {
            s.track += 1;
            ok("Next")
        }
        "Previous" => {
            s.track = s.track.saturating_sub(1).max(1);
            ok("Previous")
        }
        other => format!("{XML_DECLARATION}<{other} result=\"Error\">unknown command</{other}>\n"),
    }
}

fn format_tenths(tenths: i32) -> String {
    if tenths % 10 == 0 {
        format!("{}", tenths / 10)
    } else {
        format!("{:.1}", f64::from(tenths) / 10.0)
    }
}

// ── Profile store double ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct StoreScript {
    pub activate_delay: Duration,
    pub fail_activate: bool,
    pub fail_restart: bool,
    /// Restart takes the fake daemon down for this long.
    pub restart_window: Duration,
}

pub struct FakeStore {
    pub profiles: Vec<&'static str>,
    pub script: StoreScript,
    pub daemon: Option<Arc<Mutex<FakeState>>>,
    pub activate_calls: AtomicUsize,
    pub activations_completed: AtomicUsize,
    pub restart_calls: AtomicUsize,
    pub current: Mutex<Option<String>>,
}

impl FakeStore {
    pub fn new(profiles: Vec<&'static str>, script: StoreScript) -> Self {
        Self {
            profiles,
            script,
            daemon: None,
            activate_calls: AtomicUsize::new(0),
            activations_completed: AtomicUsize::new(0),
            restart_calls: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn attached_to(mut self, daemon: &FakeHqplayer) -> Self {
        self.daemon = Some(daemon.state.clone());
        self
    }

    pub fn activate_calls(&self) -> usize {
        self.activate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for FakeStore {
    fn host(&self) -> &str {
        "hqp.test"
    }

    async fn list(&self) -> Result<Vec<ProfileRef>, ControlError> {
        Ok(self.profiles.iter().map(|p| ProfileRef::new(*p)).collect())
    }

    async fn current_id(&self) -> Result<Option<ProfileRef>, ControlError> {
        Ok(self.current.lock().unwrap().clone().map(ProfileRef::new))
    }

    async fn activate(&self, id: &str) -> Result<(), ControlError> {
        self.activate_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.activate_delay).await;
        if self.script.fail_activate {
            return Err(ControlError::ActivationFailed {
                id: id.to_string(),
                reason: "cp: permission denied".to_string(),
            });
        }
        *self.current.lock().unwrap() = Some(id.to_string());
        self.activations_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<(), ControlError> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_restart {
            return Err(ControlError::RestartFailed("unit not found".to_string()));
        }
        if let Some(daemon) = &self.daemon {
            daemon.lock().unwrap().restart(self.script.restart_window);
        }
        Ok(())
    }
}
