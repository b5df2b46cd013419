//! Request/response wire format
//!
//! Every message is an 8-byte little-endian header `{ code: u32, size: u32 }`
//! followed by `size` bytes of JSON payload. Requests carry an option code;
//! replies carry a response type and a [`Reply`].
//!
//! ```text
//! +-----------+-----------+---------------------+
//! | code (LE) | size (LE) | payload (size bytes)|
//! +-----------+-----------+---------------------+
//! ```

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dynais::LoopEvent;
use crate::error::{EardError, ErrorKind, Result};
use crate::models::{AppStatus, NodeMetrics, Policy};
use crate::policy::{NewJob, PowercapRequest, Signature};

pub const HEADER_SIZE: usize = 8;

/// Largest payload accepted, checked before allocating
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

pub const NEW_JOB: u32 = 0;
pub const END_JOB: u32 = 1;
pub const MAX_FREQ: u32 = 100;
pub const NEW_TH: u32 = 101;
pub const SET_FREQ: u32 = 104;
pub const RESTORE_CONF: u32 = 106;
pub const PING: u32 = 500;
pub const STATUS: u32 = 600;
pub const APP_NODE_STATUS: u32 = 601;
pub const SET_POWER: u32 = 701;
pub const SET_RISK: u32 = 706;
pub const GET_POWER: u32 = 709;
pub const LOOP_REPORT: u32 = 900;
pub const METRICS_REPORT: u32 = 901;

pub const TYPE_COMMAND: u32 = 2000;
pub const TYPE_STATUS: u32 = 2001;
pub const TYPE_POWER_STATUS: u32 = 2002;
pub const TYPE_APP_STATUS: u32 = 2005;

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub code: u32,
    pub size: u32,
}

impl Header {
    pub fn new(code: u32, size: usize) -> Result<Self> {
        if size > MAX_PAYLOAD_SIZE {
            return Err(EardError::invalid(format!(
                "payload of {} bytes exceeds {}",
                size, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(Self {
            code,
            size: size as u32,
        })
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.code.to_le_bytes());
        bytes[4..].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        let [c0, c1, c2, c3, s0, s1, s2, s3] = bytes;
        Self {
            code: u32::from_le_bytes([c0, c1, c2, c3]),
            size: u32::from_le_bytes([s0, s1, s2, s3]),
        }
    }
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream before a header. An
/// oversized header is rejected with `InvalidArgument` without reading the
/// payload; the stream cannot be resynchronised afterwards.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(Header, Vec<u8>)>> {
    let mut bytes = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated header").into())
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let header = Header::from_bytes(bytes);
    if header.size as usize > MAX_PAYLOAD_SIZE {
        return Err(EardError::invalid(format!(
            "declared payload of {} bytes exceeds {}",
            header.size, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

pub fn write_frame<W: Write>(writer: &mut W, code: u32, payload: &[u8]) -> Result<()> {
    let header = Header::new(code, payload.len())?;
    writer.write_all(&header.to_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidArgs {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqArgs {
    /// kHz
    pub freq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdArgs {
    pub policy: Policy,
    pub th: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskArgs {
    /// Raw risk mask, undefined bits ignored
    pub risk: u8,
}

/// Node status query, optionally publishing the caller's own status first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStatusQuery {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub report: Option<AppStatus>,
}

/// Phase detected by an application's own detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub pid: u32,
    pub event: LoopEvent,
    pub signature: Signature,
}

/// Decoded request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    NewJob(NewJob),
    EndJob(PidArgs),
    MaxFreq(FreqArgs),
    NewTh(ThresholdArgs),
    SetFreq(FreqArgs),
    RestoreConf,
    Ping,
    Status,
    AppNodeStatus(AppStatusQuery),
    SetPower(PowercapRequest),
    SetRisk(RiskArgs),
    GetPower(PidArgs),
    LoopReport(LoopReport),
    MetricsReport(NodeMetrics),
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| EardError::invalid(format!("bad payload: {}", e)))
}

impl Request {
    pub fn decode(header: Header, payload: &[u8]) -> Result<Self> {
        let request = match header.code {
            NEW_JOB => Request::NewJob(parse(payload)?),
            END_JOB => Request::EndJob(parse(payload)?),
            MAX_FREQ => Request::MaxFreq(parse(payload)?),
            NEW_TH => Request::NewTh(parse(payload)?),
            SET_FREQ => Request::SetFreq(parse(payload)?),
            RESTORE_CONF => Request::RestoreConf,
            PING => Request::Ping,
            STATUS => Request::Status,
            APP_NODE_STATUS if payload.is_empty() => {
                Request::AppNodeStatus(AppStatusQuery::default())
            }
            APP_NODE_STATUS => Request::AppNodeStatus(parse(payload)?),
            SET_POWER => Request::SetPower(parse(payload)?),
            SET_RISK => Request::SetRisk(parse(payload)?),
            GET_POWER => Request::GetPower(parse(payload)?),
            LOOP_REPORT => Request::LoopReport(parse(payload)?),
            METRICS_REPORT => Request::MetricsReport(parse(payload)?),
            other => return Err(EardError::invalid(format!("unknown option code {}", other))),
        };
        Ok(request)
    }

    /// Option code and payload, as a client sends them
    pub fn encode(&self) -> Result<(u32, Vec<u8>)> {
        let encoded = match self {
            Request::NewJob(args) => (NEW_JOB, serde_json::to_vec(args)?),
            Request::EndJob(args) => (END_JOB, serde_json::to_vec(args)?),
            Request::MaxFreq(args) => (MAX_FREQ, serde_json::to_vec(args)?),
            Request::NewTh(args) => (NEW_TH, serde_json::to_vec(args)?),
            Request::SetFreq(args) => (SET_FREQ, serde_json::to_vec(args)?),
            Request::RestoreConf => (RESTORE_CONF, Vec::new()),
            Request::Ping => (PING, Vec::new()),
            Request::Status => (STATUS, Vec::new()),
            Request::AppNodeStatus(args) => (APP_NODE_STATUS, serde_json::to_vec(args)?),
            Request::SetPower(args) => (SET_POWER, serde_json::to_vec(args)?),
            Request::SetRisk(args) => (SET_RISK, serde_json::to_vec(args)?),
            Request::GetPower(args) => (GET_POWER, serde_json::to_vec(args)?),
            Request::LoopReport(args) => (LOOP_REPORT, serde_json::to_vec(args)?),
            Request::MetricsReport(args) => (METRICS_REPORT, serde_json::to_vec(args)?),
        };
        Ok(encoded)
    }

    pub fn code(&self) -> u32 {
        match self {
            Request::NewJob(_) => NEW_JOB,
            Request::EndJob(_) => END_JOB,
            Request::MaxFreq(_) => MAX_FREQ,
            Request::NewTh(_) => NEW_TH,
            Request::SetFreq(_) => SET_FREQ,
            Request::RestoreConf => RESTORE_CONF,
            Request::Ping => PING,
            Request::Status => STATUS,
            Request::AppNodeStatus(_) => APP_NODE_STATUS,
            Request::SetPower(_) => SET_POWER,
            Request::SetRisk(_) => SET_RISK,
            Request::GetPower(_) => GET_POWER,
            Request::LoopReport(_) => LOOP_REPORT,
            Request::MetricsReport(_) => METRICS_REPORT,
        }
    }

    /// Response type the reply to this request is sent with
    pub fn response_type(&self) -> u32 {
        response_type(self.code())
    }
}

pub fn response_type(code: u32) -> u32 {
    match code {
        STATUS => TYPE_STATUS,
        APP_NODE_STATUS => TYPE_APP_STATUS,
        GET_POWER => TYPE_POWER_STATUS,
        _ => TYPE_COMMAND,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply payload: a body on success, the error otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn ack() -> Self {
        Self {
            body: None,
            error: None,
        }
    }

    pub fn with_body<T: Serialize>(body: &T) -> Result<Self> {
        Ok(Self {
            body: Some(serde_json::to_value(body)?),
            error: None,
        })
    }

    pub fn failure(err: &EardError) -> Self {
        Self {
            body: None,
            error: Some(ReplyError {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        parse(payload)
    }

    /// Deserialize the body into `T`
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| EardError::invalid("reply carries no body"))?;
        Ok(serde_json::from_value(body)?)
    }
}
