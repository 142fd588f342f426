//! Frame encoding and decoding.

use crate::{ARG_END, ARG_START};

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The eleven Ivy message types, tagged with their wire integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Bye = 0,
    AddRegexp = 1,
    Msg = 2,
    Error = 3,
    DelRegexp = 4,
    EndInit = 5,
    StartInit = 6,
    DirectMsg = 7,
    Die = 8,
    Ping = 9,
    Pong = 10,
}

impl MsgType {
    /// The integer tag written on the wire.
    pub fn tag(self) -> u32 {
        self as u32
    }

    fn from_tag(tag: u32) -> Option<MsgType> {
        match tag {
            0 => Some(MsgType::Bye),
            1 => Some(MsgType::AddRegexp),
            2 => Some(MsgType::Msg),
            3 => Some(MsgType::Error),
            4 => Some(MsgType::DelRegexp),
            5 => Some(MsgType::EndInit),
            6 => Some(MsgType::StartInit),
            7 => Some(MsgType::DirectMsg),
            8 => Some(MsgType::Die),
            9 => Some(MsgType::Ping),
            10 => Some(MsgType::Pong),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgType::Bye => "BYE",
            MsgType::AddRegexp => "ADD_REGEXP",
            MsgType::Msg => "MSG",
            MsgType::Error => "ERROR",
            MsgType::DelRegexp => "DEL_REGEXP",
            MsgType::EndInit => "END_INIT",
            MsgType::StartInit => "START_INIT",
            MsgType::DirectMsg => "DIRECT_MSG",
            MsgType::Die => "DIE",
            MsgType::Ping => "PING",
            MsgType::Pong => "PONG",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame cannot be decoded (non-integer type or id, missing STX,
    /// unknown message type).
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub num_id: i64,
    pub params: Vec<String>,
    /// Set when a `MSG` payload arrived without its final ETX.  The frame is
    /// still accepted (the reference C library does the same); callers are
    /// expected to log it.
    pub missing_arg_end: bool,
}

/// Decode one frame from `line`, which must not include the trailing
/// newline.
pub fn decode(line: &str) -> Result<Frame, WireError> {
    let (type_str, rest) = line
        .split_once(' ')
        .ok_or_else(|| WireError::MalformedMessage(format!("no space in {:?}", line)))?;
    let (id_str, payload) = rest
        .split_once(ARG_START)
        .ok_or_else(|| WireError::MalformedMessage(format!("no STX in {:?}", line)))?;

    let tag: u32 = type_str
        .parse()
        .map_err(|_| WireError::MalformedMessage(format!("bad message type {:?}", type_str)))?;
    let msg_type = MsgType::from_tag(tag)
        .ok_or_else(|| WireError::MalformedMessage(format!("unknown message type {}", tag)))?;
    let num_id: i64 = id_str
        .parse()
        .map_err(|_| WireError::MalformedMessage(format!("bad numeric id {:?}", id_str)))?;

    let mut missing_arg_end = false;
    let params = if msg_type == MsgType::Msg {
        decode_msg_params(payload, &mut missing_arg_end)
    } else {
        // Strip a single trailing ETX, then split.  An empty payload yields
        // no parameters at all.
        let payload = payload.strip_suffix(ARG_END).unwrap_or(payload);
        if payload.is_empty() {
            Vec::new()
        } else {
            payload.split(ARG_END).map(str::to_owned).collect()
        }
    };

    Ok(Frame {
        msg_type,
        num_id,
        params,
        missing_arg_end,
    })
}

/// `MSG` payloads get the reference library's tolerant treatment: every
/// parameter is ETX-terminated, but if the final ETX is missing the payload
/// is accepted as if it were present.
fn decode_msg_params(payload: &str, missing_arg_end: &mut bool) -> Vec<String> {
    if payload.contains(ARG_END) {
        let payload = match payload.strip_suffix(ARG_END) {
            Some(stripped) => stripped,
            None => {
                *missing_arg_end = true;
                payload
            }
        };
        payload.split(ARG_END).map(str::to_owned).collect()
    } else if payload.is_empty() {
        Vec::new()
    } else {
        // A single parameter without any ETX at all.
        *missing_arg_end = true;
        vec![payload.to_owned()]
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a frame whose payload is inserted verbatim (no parameter
/// separators).  Used for single-parameter frames such as `START_INIT`,
/// `ADD_REGEXP` or `DIRECT_MSG`, and for empty payloads.
pub fn encode_raw(msg_type: MsgType, num_id: i64, payload: &str) -> Vec<u8> {
    let mut frame = format!("{} {}{}", msg_type.tag(), num_id, ARG_START);
    frame.push_str(payload);
    frame.push('\n');
    frame.into_bytes()
}

/// Encode a frame whose payload is a parameter list: elements joined with
/// ETX and a trailing ETX appended.  An empty list produces no payload.
pub fn encode_list(msg_type: MsgType, num_id: i64, params: &[String]) -> Vec<u8> {
    let mut frame = format!("{} {}{}", msg_type.tag(), num_id, ARG_START);
    if !params.is_empty() {
        for param in params {
            frame.push_str(param);
            frame.push(ARG_END);
        }
    }
    frame.push('\n');
    frame.into_bytes()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
