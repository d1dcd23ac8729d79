use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::Element;
use crate::error::ControlError;

/// Volume in tenths of a decibel.
///
/// Held as an integer so repeated relative adjustments never drift; the
/// decimal text form only exists on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeDb(i32);

impl VolumeDb {
    pub const ZERO: VolumeDb = VolumeDb(0);

    pub const fn from_tenths(tenths: i32) -> Self {
        Self(tenths)
    }

    pub const fn from_db(db: i32) -> Self {
        Self(db * 10)
    }

    /// Rounds to the nearest tenth.  `None` for non-finite or absurd values.
    pub fn from_f64(db: f64) -> Option<Self> {
        if !db.is_finite() {
            return None;
        }
        let tenths = (db * 10.0).round();
        if tenths < i32::MIN as f64 || tenths > i32::MAX as f64 {
            return None;
        }
        Some(Self(tenths as i32))
    }

    pub const fn tenths(self) -> i32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 10.0
    }

    pub fn checked_add(self, other: VolumeDb) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: VolumeDb) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl fmt::Display for VolumeDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        if abs % 10 == 0 {
            write!(f, "{sign}{}", abs / 10)
        } else {
            write!(f, "{sign}{}.{}", abs / 10, abs % 10)
        }
    }
}

impl FromStr for VolumeDb {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(Self::from_f64)
            .ok_or_else(|| ControlError::invalid_argument(format!("invalid volume {s:?}")))
    }
}

impl Serialize for VolumeDb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for VolumeDb {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let db = f64::deserialize(deserializer)?;
        Self::from_f64(db).ok_or_else(|| serde::de::Error::custom("volume out of range"))
    }
}

/// Inclusive volume limits accepted by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBounds {
    pub min: VolumeDb,
    pub max: VolumeDb,
}

impl VolumeBounds {
    pub fn new(min: VolumeDb, max: VolumeDb) -> Result<Self, ControlError> {
        if min > max {
            return Err(ControlError::invalid_argument(format!(
                "volume bounds inverted: min {min} > max {max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: VolumeDb) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn check(&self, value: VolumeDb) -> Result<VolumeDb, ControlError> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(ControlError::invalid_argument(format!(
                "volume {value} dB outside [{}, {}]",
                self.min, self.max
            )))
        }
    }

    /// Parse a `VolumeRange` reply (`<VolumeRange min="-60" max="0"/>`).
    pub fn from_element(element: &Element) -> Result<Self, ControlError> {
        let field = |key: &str| -> Result<VolumeDb, ControlError> {
            element
                .attr(key)
                .ok_or_else(|| {
                    ControlError::protocol(
                        format!("VolumeRange reply without '{key}'"),
                        element.name.as_bytes(),
                    )
                })?
                .parse()
                .map_err(|_| {
                    ControlError::protocol(
                        format!("VolumeRange '{key}' is not a number"),
                        element.name.as_bytes(),
                    )
                })
        };
        Self::new(field("min")?, field("max")?)
            .map_err(|e| ControlError::protocol(e.to_string(), element.name.as_bytes()))
    }
}

impl Default for VolumeBounds {
    fn default() -> Self {
        Self {
            min: VolumeDb::from_db(-40),
            max: VolumeDb::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
    #[default]
    Unknown,
}

impl TransportState {
    pub fn from_wire(value: &str) -> Self {
        match value.trim() {
            "0" => TransportState::Stopped,
            "1" => TransportState::Playing,
            "2" => TransportState::Paused,
            _ => TransportState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Unknown => "unknown",
        }
    }
}

/// Immutable snapshot of one `Status` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub transport_state: TransportState,
    pub volume: Option<VolumeDb>,
    pub track_info: Option<String>,
    pub track: u32,
    pub tracks_total: u32,
    /// Seconds.
    pub position: u32,
    pub length: u32,
    pub active_mode: Option<String>,
    pub active_filter: Option<String>,
    pub active_shaper: Option<String>,
    pub active_rate: u32,
    /// Every attribute as received, including the ones mapped above.
    pub raw: BTreeMap<String, String>,
}

impl PlaybackStatus {
    pub fn from_element(element: &Element) -> Result<Self, ControlError> {
        if element.name != "Status" {
            return Err(ControlError::protocol(
                format!("expected <Status>, got <{}>", element.name),
                element.name.as_bytes(),
            ));
        }

        let raw: BTreeMap<String, String> = element.attributes.iter().cloned().collect();
        let text = |key: &str| raw.get(key).filter(|v| !v.is_empty()).cloned();
        let number = |key: &str| raw.get(key).map(|v| lenient_u32(v)).unwrap_or(0);

        let track = number("track");
        let tracks_total = number("tracks_total");
        let track_info = (tracks_total > 0).then(|| format!("{track}/{tracks_total}"));

        Ok(Self {
            transport_state: raw
                .get("state")
                .map(|s| TransportState::from_wire(s))
                .unwrap_or_default(),
            volume: raw.get("volume").and_then(|v| v.parse().ok()),
            track_info,
            track,
            tracks_total,
            position: number("position"),
            length: number("length"),
            active_mode: text("active_mode"),
            active_filter: text("active_filter"),
            active_shaper: text("active_shaper"),
            active_rate: number("active_rate"),
            raw,
        })
    }

    /// A reply is "ready" when it is a `Status` element that reports a state.
    pub fn is_ready(element: &Element) -> bool {
        element.name == "Status" && element.attr("state").is_some()
    }

    pub fn state_name(&self) -> &'static str {
        self.transport_state.as_str()
    }

    pub fn position_display(&self) -> String {
        format!(
            "{} / {}",
            format_duration(self.position),
            format_duration(self.length)
        )
    }
}

fn lenient_u32(value: &str) -> u32 {
    let value = value.trim();
    value
        .parse::<u32>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.min(f64::from(u32::MAX)) as u32)
        })
        .unwrap_or(0)
}

fn format_duration(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
