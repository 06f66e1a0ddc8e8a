//! Wire protocol for the picoswitch serial link.
//!
//! The microcontroller and the host exchange newline-delimited ASCII frames:
//!
//! - Inbound (firmware to host): `CMD:ON`, `CMD:OFF`, `CMD:STATUS`, exact
//!   literals with no parameters.
//! - Outbound (host to firmware): a single status line per command,
//!   `STAT:<state>|<accel_used>|<accel_total>|<general_used>|<general_total>`
//!   with memory fields in MiB.
//!
//! The state token is one character: `D` (off/down), `S` (starting),
//! `U` (on/up), `T` (stopping). Both ends of the link build against this
//! crate so the tokens can never drift.

use serde::{Deserialize, Serialize};

/// Protocol codec errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Inbound line is not one of the three known commands.
    #[error("unrecognized command: {0:?}")]
    UnknownCommand(String),

    /// Status line does not match the `STAT:` frame shape.
    #[error("malformed status line: {0}")]
    BadStatusLine(String),
}

/// Container lifecycle state as reported over the link.
///
/// `Starting` and `Stopping` are transient: the host keeps polling the
/// container runtime until the target state is confirmed or a timeout
/// settles the machine (see the host's controller module).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Container is not running.
    #[default]
    Off,
    /// Start issued, waiting for the runtime to confirm.
    Starting,
    /// Container is running.
    On,
    /// Stop issued, waiting for the runtime to confirm.
    Stopping,
}

impl LifecycleState {
    /// One-character wire token for the `STAT:` line.
    pub fn token(self) -> char {
        match self {
            LifecycleState::Off => 'D',
            LifecycleState::Starting => 'S',
            LifecycleState::On => 'U',
            LifecycleState::Stopping => 'T',
        }
    }

    /// Parse a wire token back into a state.
    pub fn from_token(token: char) -> Option<Self> {
        match token {
            'D' => Some(LifecycleState::Off),
            'S' => Some(LifecycleState::Starting),
            'U' => Some(LifecycleState::On),
            'T' => Some(LifecycleState::Stopping),
            _ => None,
        }
    }

    /// True for `Off` and `On`, the states with no pending confirmation.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Off | LifecycleState::On)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Off => write!(f, "off"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::On => write!(f, "on"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A single used/total reading for one memory domain, in MiB.
///
/// `{used: 0, total: 0}` is the sentinel for "domain unavailable"
/// (e.g. no GPU present). Otherwise `used <= total` holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MemorySample {
    pub used: u64,
    pub total: u64,
}

impl MemorySample {
    pub fn new(used: u64, total: u64) -> Self {
        Self { used, total }
    }

    /// The "domain unavailable" sentinel.
    pub fn unavailable() -> Self {
        Self { used: 0, total: 0 }
    }

    pub fn is_unavailable(&self) -> bool {
        self.used == 0 && self.total == 0
    }
}

/// A decoded inbound command. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `CMD:ON`: the switch was flipped on.
    Start,
    /// `CMD:OFF`: the switch was flipped off.
    Stop,
    /// `CMD:STATUS`: periodic display refresh.
    Status,
}

/// Everything needed to render one `STAT:` line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReply {
    pub state: LifecycleState,
    /// Accelerator (GPU) memory.
    pub accel: MemorySample,
    /// General system RAM.
    pub general: MemorySample,
}

/// Decode an inbound line into a [`Request`].
///
/// The firmware sends exact literals; anything else fails and the caller
/// drops the line without replying, since the origin command is unknown.
pub fn parse_request(line: &str) -> Result<Request, DecodeError> {
    match line {
        "CMD:ON" => Ok(Request::Start),
        "CMD:OFF" => Ok(Request::Stop),
        "CMD:STATUS" => Ok(Request::Status),
        other => Err(DecodeError::UnknownCommand(other.to_string())),
    }
}

/// Encode a [`StatusReply`] into a `STAT:` line (without trailing newline).
///
/// Total: every valid reply encodes.
pub fn encode_status(reply: &StatusReply) -> String {
    format!(
        "STAT:{}|{}|{}|{}|{}",
        reply.state.token(),
        reply.accel.used,
        reply.accel.total,
        reply.general.used,
        reply.general.total,
    )
}

/// Decode a `STAT:` line back into a [`StatusReply`].
///
/// The firmware renders the line verbatim and never parses it; this decoder
/// exists for host-side tooling and round-trip tests.
pub fn parse_status(line: &str) -> Result<StatusReply, DecodeError> {
    let bad = || DecodeError::BadStatusLine(line.to_string());

    let body = line.strip_prefix("STAT:").ok_or_else(bad)?;
    let mut fields = body.split('|');

    let state_field = fields.next().ok_or_else(bad)?;
    let mut chars = state_field.chars();
    let token = chars.next().ok_or_else(bad)?;
    if chars.next().is_some() {
        return Err(bad());
    }
    let state = LifecycleState::from_token(token).ok_or_else(bad)?;

    let mut nums = [0u64; 4];
    for slot in nums.iter_mut() {
        let field = fields.next().ok_or_else(bad)?;
        *slot = field.parse().map_err(|_| bad())?;
    }
    if fields.next().is_some() {
        return Err(bad());
    }

    Ok(StatusReply {
        state,
        accel: MemorySample::new(nums[0], nums[1]),
        general: MemorySample::new(nums[2], nums[3]),
    })
}
