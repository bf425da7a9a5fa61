//! Typed remote-command descriptors.
//!
//! Each RGA setting is a two-letter wire mnemonic. A query is the mnemonic
//! followed by `?`; a set is the mnemonic immediately followed by the
//! parameter with no separating space (`EE70`, not `EE 70`).
//!
//! A [`Command`] is a plain `Copy` value describing one setting: its wire
//! mnemonic, UI metadata (unit, range, step, precision, default), optional
//! conversion functions between the wire value and the external value, and
//! the reply discipline of its set form. The descriptor does not own any
//! state; the component that issues it records the returned status.
//!
//! Range bounds are informational. Nothing is clamped or rejected on the
//! wire path; [`Command::in_range`] is there for callers that want to check.

use rga_core::{RgaError, RgaResult, Transport};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

// =============================================================================
// Wire values
// =============================================================================

/// A value type that can travel in an RGA command or reply.
pub trait WireValue: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Parse a trimmed ASCII reply.
    fn parse_reply(reply: &str) -> Option<Self>;

    /// Format the parameter of a set command.
    fn format_param(self, precision: usize) -> String;

    fn to_f64(self) -> f64;
}

impl WireValue for i64 {
    fn parse_reply(reply: &str) -> Option<Self> {
        reply.trim().parse().ok()
    }

    fn format_param(self, _precision: usize) -> String {
        self.to_string()
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl WireValue for f64 {
    fn parse_reply(reply: &str) -> Option<Self> {
        reply.trim().parse().ok()
    }

    fn format_param(self, precision: usize) -> String {
        format!("{:.*}", precision, self)
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl WireValue for bool {
    fn parse_reply(reply: &str) -> Option<Self> {
        match reply.trim().parse::<i64>().ok()? {
            0 => Some(false),
            _ => Some(true),
        }
    }

    fn format_param(self, _precision: usize) -> String {
        if self { "1" } else { "0" }.to_string()
    }

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

// =============================================================================
// Command descriptor
// =============================================================================

/// What the instrument sends back after a set command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetReply {
    /// ASCII status byte, read with the long timeout
    Status,
    /// Nothing; the command is fire-and-forget
    None,
}

/// Which directions a descriptor supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Descriptor of one remote command.
#[derive(Debug, Clone, Copy)]
pub struct Command<T: WireValue> {
    pub mnemonic: &'static str,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Decimal places used when formatting a float parameter
    pub precision: usize,
    pub default: f64,
    /// Wire value to external value
    pub get_convert: Option<fn(T) -> T>,
    /// External value to wire value
    pub set_convert: Option<fn(T) -> T>,
    pub set_reply: SetReply,
    pub access: Access,
}

impl<T: WireValue> Command<T> {
    /// Read/write descriptor with a status-returning set.
    pub const fn new(
        mnemonic: &'static str,
        unit: &'static str,
        min: f64,
        max: f64,
        step: f64,
        precision: usize,
        default: f64,
    ) -> Self {
        Self {
            mnemonic,
            unit,
            min,
            max,
            step,
            precision,
            default,
            get_convert: None,
            set_convert: None,
            set_reply: SetReply::Status,
            access: Access::ReadWrite,
        }
    }

    /// Query-only descriptor.
    pub const fn query_only(mnemonic: &'static str, unit: &'static str) -> Self {
        let mut command = Self::new(mnemonic, unit, 0.0, 0.0, 0.0, 0, 0.0);
        command.access = Access::ReadOnly;
        command
    }

    /// Descriptor whose set is sent without reading a reply.
    pub const fn plain(mut self) -> Self {
        self.set_reply = SetReply::None;
        self
    }

    pub const fn write_only(mut self) -> Self {
        self.access = Access::WriteOnly;
        self
    }

    pub const fn with_conversions(mut self, get: fn(T) -> T, set: fn(T) -> T) -> Self {
        self.get_convert = Some(get);
        self.set_convert = Some(set);
        self
    }

    /// Query string, e.g. `EE?`.
    pub fn query_string(&self) -> String {
        format!("{}?", self.mnemonic)
    }

    /// Set string after set-conversion, e.g. `EE70`.
    pub fn set_string(&self, value: T) -> String {
        let wire = self.set_convert.map_or(value, |convert| convert(value));
        format!("{}{}", self.mnemonic, wire.format_param(self.precision))
    }

    /// Whether `value` lies inside the informational range.
    pub fn in_range(&self, value: T) -> bool {
        let v = value.to_f64();
        v >= self.min && v <= self.max
    }

    /// Query the current value.
    pub async fn read(&self, transport: &Transport) -> RgaResult<T> {
        let query = self.query_string();
        if self.access == Access::WriteOnly {
            return Err(RgaError::InvalidParameter(format!(
                "{} cannot be queried",
                self.mnemonic
            )));
        }

        let reply = transport
            .query_text(&query)
            .await
            .map_err(|e| query_error(&query, e))?;
        let raw = T::parse_reply(&reply).ok_or_else(|| RgaError::Query {
            command: query.clone(),
            reason: format!("cannot convert reply '{}'", reply),
        })?;
        Ok(self.get_convert.map_or(raw, |convert| convert(raw)))
    }

    /// Set a new value.
    ///
    /// Returns the status byte for status-returning commands and `None` for
    /// plain ones.
    pub async fn write(&self, transport: &Transport, value: T) -> RgaResult<Option<i32>> {
        let set_string = self.set_string(value);
        if self.access == Access::ReadOnly {
            return Err(RgaError::InvalidParameter(format!(
                "{} is query-only",
                self.mnemonic
            )));
        }

        match self.set_reply {
            SetReply::None => {
                transport
                    .send(&set_string)
                    .await
                    .map_err(|e| set_error(&set_string, e))?;
                Ok(None)
            }
            SetReply::Status => {
                let reply = transport
                    .query_text_with_long_timeout(&set_string, None)
                    .await
                    .map_err(|e| set_error(&set_string, e))?;
                let status = reply.trim().parse::<i32>().map_err(|_| RgaError::Set {
                    command: set_string.clone(),
                    reason: format!("non-integer status '{}'", reply),
                })?;
                Ok(Some(status))
            }
        }
    }
}

/// Query whose reply is a raw 4-byte little-endian signed integer.
///
/// The send and the binary read happen inside one exclusive transport scope.
#[derive(Debug, Clone, Copy)]
pub struct BinaryQuery {
    pub mnemonic: &'static str,
    pub unit: &'static str,
}

impl BinaryQuery {
    pub async fn read(&self, transport: &Transport) -> RgaResult<i32> {
        let query = format!("{}?", self.mnemonic);
        let mut guard = transport.lock().await;
        guard.send(&query).await.map_err(|e| query_error(&query, e))?;
        guard.read_long().await.map_err(|e| query_error(&query, e))
    }
}

fn query_error(command: &str, err: RgaError) -> RgaError {
    RgaError::Query {
        command: command.to_string(),
        reason: err.to_string(),
    }
}

fn set_error(command: &str, err: RgaError) -> RgaError {
    RgaError::Set {
        command: command.to_string(),
        reason: err.to_string(),
    }
}

// =============================================================================
// Conversions
// =============================================================================

/// Ion energy is 0/1 on the wire and 8/12 eV outside.
pub fn ion_energy_from_wire(raw: i64) -> i64 {
    if raw != 0 {
        12
    } else {
        8
    }
}

pub fn ion_energy_to_wire(ev: i64) -> i64 {
    if ev >= 12 {
        1
    } else {
        0
    }
}

/// Stored CEM gain is kept on the device divided by 1000.
pub fn stored_gain_from_wire(raw: f64) -> f64 {
    raw * 1000.0
}

pub fn stored_gain_to_wire(gain: f64) -> f64 {
    gain / 1000.0
}

// =============================================================================
// Component state
// =============================================================================

/// State shared by every component: the session transport and the status
/// byte of the last status-returning set.
#[derive(Debug)]
pub struct ComponentCore {
    transport: Arc<Transport>,
    last_set_status: AtomicI32,
}

impl ComponentCore {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            last_set_status: AtomicI32::new(0),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn last_set_status(&self) -> i32 {
        self.last_set_status.load(Ordering::Relaxed)
    }

    pub async fn get<T: WireValue>(&self, command: &Command<T>) -> RgaResult<T> {
        command.read(&self.transport).await
    }

    /// Issue a set and record its status byte. Failures leave the recorded
    /// status unchanged.
    pub async fn set<T: WireValue>(&self, command: &Command<T>, value: T) -> RgaResult<Option<i32>> {
        let status = command.write(&self.transport, value).await?;
        if let Some(status) = status {
            self.last_set_status.store(status, Ordering::Relaxed);
        }
        Ok(status)
    }

    /// Issue a set and return the recorded status byte afterwards.
    pub async fn apply<T: WireValue>(&self, command: &Command<T>, value: T) -> RgaResult<i32> {
        self.set(command, value).await?;
        Ok(self.last_set_status())
    }
}

// =============================================================================
// Type-erased access
// =============================================================================

/// Descriptor of any wire type, for access by name.
#[derive(Debug, Clone, Copy)]
pub enum AnyCommand {
    Int(Command<i64>),
    Float(Command<f64>),
    Bool(Command<bool>),
}

impl AnyCommand {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            AnyCommand::Int(c) => c.mnemonic,
            AnyCommand::Float(c) => c.mnemonic,
            AnyCommand::Bool(c) => c.mnemonic,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            AnyCommand::Int(c) => c.unit,
            AnyCommand::Float(c) => c.unit,
            AnyCommand::Bool(c) => c.unit,
        }
    }
}

/// A parameter value of any wire type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
            ParamValue::Bool(v) => v.to_f64(),
        }
    }

    /// Integer view; floats must be integral.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ParamValue::Int(v) => Some(v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(v as i64),
            ParamValue::Float(_) => None,
            ParamValue::Bool(v) => Some(i64::from(v)),
        }
    }

    pub fn as_bool(&self) -> bool {
        self.as_f64() != 0.0
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl ComponentCore {
    pub async fn get_any(&self, command: &AnyCommand) -> RgaResult<ParamValue> {
        Ok(match command {
            AnyCommand::Int(c) => ParamValue::Int(self.get(c).await?),
            AnyCommand::Float(c) => ParamValue::Float(self.get(c).await?),
            AnyCommand::Bool(c) => ParamValue::Bool(self.get(c).await?),
        })
    }

    pub async fn set_any(&self, command: &AnyCommand, value: ParamValue) -> RgaResult<Option<i32>> {
        match command {
            AnyCommand::Int(c) => {
                let v = value.as_i64().ok_or_else(|| {
                    RgaError::InvalidParameter(format!(
                        "{} expects an integer, got {}",
                        c.mnemonic, value
                    ))
                })?;
                self.set(c, v).await
            }
            AnyCommand::Float(c) => self.set(c, value.as_f64()).await,
            AnyCommand::Bool(c) => self.set(c, value.as_bool()).await,
        }
    }
}
