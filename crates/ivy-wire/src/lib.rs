//! Ivy bus wire protocol: frame codec, bus addresses, discovery datagrams.
//!
//! An Ivy frame is one newline-terminated text line:
//!
//! ```text
//! <msg_type> <num_id><STX><payload>\n
//! ```
//!
//! where `STX = 0x02` separates the header from the payload and
//! `ETX = 0x03` separates (and terminates) payload parameters.  The codec
//! here is byte-for-byte compatible with the reference Ivy libraries,
//! including their tolerance for a missing final ETX on `MSG` payloads.
//!
//! Nothing in this crate does I/O; encode/decode are pure functions.

pub mod bus;
pub mod frame;

pub use bus::{decode_bus, encode_announce, parse_announce, Announce, BusError};
pub use frame::{decode, encode_list, encode_raw, Frame, MsgType, WireError};

/// Ivy protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// STX, between the frame header and the payload.
pub const ARG_START: char = '\u{2}';

/// ETX, between (and after) payload parameters.
pub const ARG_END: char = '\u{3}';

/// Bus used when neither the caller nor `IVYBUS` specifies one.
pub const DEFAULT_BUS: &str = "127:2010";

/// Multicast TTL, taken from the reference implementation.
pub const DEFAULT_TTL: u32 = 64;
