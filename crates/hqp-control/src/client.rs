//! Control Client for the HQPlayer XML control port.
//!
//! Every public call is bounded by the configured timeout.  With keep-alive
//! disabled each call opens and closes its own connection; with keep-alive
//! enabled one connection is parked behind an async mutex and discarded on the
//! first error, so a half-read reply can never leak into the next call.
use std::time::Duration;

use async_trait::async_trait;
use hqp_proto::codec::{decode, Command, Decoded, Element};
use hqp_proto::config::HqplayerConfig;
use hqp_proto::{ControlError, PlaybackStatus, VolumeBounds, VolumeDb};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub address: String,
    pub timeout: Duration,
    pub keep_alive: bool,
    pub bounds: VolumeBounds,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_millis(3000),
            keep_alive: false,
            bounds: VolumeBounds::default(),
        }
    }

    pub fn from_config(config: &HqplayerConfig) -> Result<Self, ControlError> {
        Ok(Self {
            address: config.address(),
            timeout: config.timeout(),
            keep_alive: config.keep_alive,
            bounds: config.volume_bounds()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_bounds(mut self, bounds: VolumeBounds) -> Self {
        self.bounds = bounds;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Anything that can answer "is the control port serving again?".
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Never fails: unreachable, slow or garbled all count as `false`.
    async fn probe(&self, timeout: Duration) -> bool;
}

struct Connection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl Connection {
    async fn connect(address: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ControlError::transport(address, e))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        })
    }

    async fn request(&mut self, address: &str, payload: &[u8]) -> Result<Element, ControlError> {
        if !self.read_buffer.is_empty() {
            debug!(
                "Discarding {} unsolicited bytes from {}",
                self.read_buffer.len(),
                address
            );
            self.read_buffer.clear();
        }

        self.stream
            .write_all(payload)
            .await
            .map_err(|e| ControlError::transport(address, e))?;

        let mut tmp = [0u8; 4096];
        loop {
            match decode(&self.read_buffer)? {
                Decoded::Complete { element, consumed } => {
                    self.read_buffer.drain(..consumed);
                    return Ok(element);
                }
                Decoded::NeedMoreData => {}
            }

            match self.stream.read(&mut tmp).await {
                Ok(0) if self.read_buffer.is_empty() => {
                    return Err(ControlError::transport(
                        address,
                        "connection closed before reply",
                    ))
                }
                Ok(0) => {
                    return Err(ControlError::protocol(
                        "connection closed mid-reply",
                        std::mem::take(&mut self.read_buffer),
                    ))
                }
                Ok(n) => self.read_buffer.extend_from_slice(&tmp[..n]),
                Err(e) => return Err(ControlError::transport(address, e)),
            }
        }
    }
}

pub struct ControlClient {
    options: ClientOptions,
    conn: Mutex<Option<Connection>>,
}

impl ControlClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.options.address
    }

    pub fn bounds(&self) -> VolumeBounds {
        self.options.bounds
    }

    pub async fn get_status(&self) -> Result<PlaybackStatus, ControlError> {
        let element = self.exchange(&Command::Status).await?;
        if let Some(Err(message)) = element.result() {
            return Err(ControlError::Rejected {
                command: "Status".to_string(),
                message,
            });
        }
        PlaybackStatus::from_element(&element)
    }

    /// Out-of-range values fail before anything is sent.
    pub async fn set_volume(&self, value: VolumeDb) -> Result<PlaybackStatus, ControlError> {
        let value = self.options.bounds.check(value)?;
        self.command(&Command::Volume { value }).await?;
        self.get_status().await
    }

    /// One `VolumeUp`/`VolumeDown` round trip; the daemon applies the step.
    pub async fn adjust_volume(
        &self,
        step: VolumeDb,
        direction: Direction,
    ) -> Result<PlaybackStatus, ControlError> {
        if step <= VolumeDb::ZERO {
            return Err(ControlError::invalid_argument(format!(
                "volume step must be positive, got {step}"
            )));
        }
        let span = self
            .options
            .bounds
            .max
            .checked_sub(self.options.bounds.min)
            .unwrap_or(VolumeDb::ZERO);
        if step > span {
            return Err(ControlError::invalid_argument(format!(
                "volume step {step} dB exceeds the {span} dB range"
            )));
        }
        let command = match direction {
            Direction::Up => Command::VolumeUp { step },
            Direction::Down => Command::VolumeDown { step },
        };
        self.command(&command).await?;
        self.get_status().await
    }

    pub async fn volume_range(&self) -> Result<VolumeBounds, ControlError> {
        let element = self.exchange(&Command::VolumeRange).await?;
        if let Some(Err(message)) = element.result() {
            return Err(ControlError::Rejected {
                command: "VolumeRange".to_string(),
                message,
            });
        }
        VolumeBounds::from_element(&element)
    }

    pub async fn play(&self) -> Result<PlaybackStatus, ControlError> {
        self.transport(Command::Play).await
    }

    pub async fn pause(&self) -> Result<PlaybackStatus, ControlError> {
        self.transport(Command::Pause).await
    }

    pub async fn stop(&self) -> Result<PlaybackStatus, ControlError> {
        self.transport(Command::Stop).await
    }

    pub async fn next(&self) -> Result<PlaybackStatus, ControlError> {
        self.transport(Command::Next).await
    }

    pub async fn previous(&self) -> Result<PlaybackStatus, ControlError> {
        self.transport(Command::Previous).await
    }

    /// Fresh connection plus one `Status` round trip, bounded by `timeout`.
    ///
    /// With keep-alive on, a successful probe parks its connection in place
    /// of the idle one, which may predate a daemon restart.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let address = self.options.address.as_str();
        let attempt = async {
            let payload = Command::Status.encode()?;
            let mut conn = Connection::connect(address).await?;
            let element = conn.request(address, &payload).await?;
            Ok::<_, ControlError>((conn, element))
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok((conn, element))) => {
                let ready = PlaybackStatus::is_ready(&element);
                debug!("Probe {}: ready={}", address, ready);
                if ready && self.options.keep_alive {
                    self.replace_parked(conn);
                }
                ready
            }
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Probe {} timed out after {:?}", address, timeout);
                false
            }
        }
    }

    /// A locked slot means a call is using the parked connection right now;
    /// that call keeps it only if it gets a reply.
    fn replace_parked(&self, conn: Connection) {
        if let Ok(mut guard) = self.conn.try_lock() {
            if guard.replace(conn).is_some() {
                debug!("Replaced idle keep-alive connection to {}", self.options.address);
            }
        }
    }

    async fn transport(&self, command: Command) -> Result<PlaybackStatus, ControlError> {
        self.command(&command).await?;
        self.get_status().await
    }

    /// Send a command that answers with an acknowledgement element.
    async fn command(&self, command: &Command) -> Result<(), ControlError> {
        let element = self.exchange(command).await?;
        match element.result() {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => {
                debug!("{} rejected: {}", command.name(), message);
                Err(ControlError::Rejected {
                    command: command.name().to_string(),
                    message,
                })
            }
            None if element.name == command.name() => Ok(()),
            None => Err(ControlError::protocol(
                format!("expected <{}> acknowledgement, got <{}>", command.name(), element.name),
                element.name.into_bytes(),
            )),
        }
    }

    async fn exchange(&self, command: &Command) -> Result<Element, ControlError> {
        let payload = command.encode()?;
        debug!("-> {}", String::from_utf8_lossy(&payload).trim_end());

        let result =
            match tokio::time::timeout(self.options.timeout, self.round_trip(&payload)).await {
                Ok(result) => result,
                Err(_) => Err(ControlError::transport(
                    &self.options.address,
                    format!("no reply within {:?}", self.options.timeout),
                )),
            };

        match &result {
            Ok(element) => debug!("<- <{}> {:?}", element.name, element.attributes),
            Err(ControlError::ProtocolError { reason, raw }) => warn!(
                "Malformed reply to {} from {}: {} (raw: {:?})",
                command.name(),
                self.options.address,
                reason,
                String::from_utf8_lossy(raw)
            ),
            Err(e) => debug!("{} to {} failed: {}", command.name(), self.options.address, e),
        }
        result
    }

    async fn round_trip(&self, payload: &[u8]) -> Result<Element, ControlError> {
        let address = self.options.address.as_str();
        if !self.options.keep_alive {
            let mut conn = Connection::connect(address).await?;
            return conn.request(address, payload).await;
        }

        let mut guard = self.conn.lock().await;
        // Taken out of the slot so a cancelled call drops it instead of
        // parking a connection with a half-read reply.
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => Connection::connect(address).await?,
        };
        let result = conn.request(address, payload).await;
        if result.is_ok() {
            *guard = Some(conn);
        }
        result
    }
}

#[async_trait]
impl ReadinessProbe for ControlClient {
    async fn probe(&self, timeout: Duration) -> bool {
        ControlClient::probe(self, timeout).await
    }
}
