//! Byte-at-a-time parser for modem notifications
//!
//! The modem reports through four line-oriented frames:
//!
//! ```text
//! $MMERR,<cmd>,<code>\r\n                error notification
//! $MMOKY,<cmd>[,<detail>]\r\n            transmit acknowledgement
//! $MMTDN,<result>,<packet number>\r\n    delivery notification
//! $MMRXD,<src>,<dst>,<hex payload>\r\n   data received
//! ```
//!
//! Every byte is checked against the alphabet of the current state. Any
//! mismatch resets the parser to its initial state and discards the bytes
//! collected so far.

use super::hex::{self, HexError};
use thiserror::Error;

/// Tag of the error notification
pub const TAG_ERROR: &[u8; 5] = b"MMERR";
/// Tag of the transmit acknowledgement
pub const TAG_ACK: &[u8; 5] = b"MMOKY";
/// Tag of the delivery notification
pub const TAG_DELIVERED: &[u8; 5] = b"MMTDN";
/// Tag of the data indication
pub const TAG_RECEIVED: &[u8; 5] = b"MMRXD";

const TAGS: [(&[u8; 5], Kind); 4] = [
    (TAG_ERROR, Kind::Error),
    (TAG_ACK, Kind::Ack),
    (TAG_DELIVERED, Kind::Delivered),
    (TAG_RECEIVED, Kind::Received),
];

/// A decoded modem frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemFrame {
    /// `$MMERR`: the modem rejected a command
    Error {
        /// Rejected command
        command: String,
        /// Modem error code
        code: u32,
    },
    /// `$MMOKY`: the modem accepted a command
    Ack {
        /// Acknowledged command
        command: String,
        /// Trailing detail, if any
        detail: Option<String>,
    },
    /// `$MMTDN`: a transmission was delivered
    Delivered {
        /// Result code
        result: u32,
        /// Packet number
        packet: u32,
    },
    /// `$MMRXD`: data arrived from a remote modem
    Received {
        /// Source modem id
        src: u32,
        /// Destination modem id
        dst: u32,
        /// Decoded payload
        payload: Vec<u8>,
    },
}

/// Errors raised while parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Byte not allowed in the current state
    #[error("unexpected byte 0x{byte:02x} in {state}")]
    UnexpectedByte {
        /// Offending byte
        byte: u8,
        /// State name at the time
        state: &'static str,
    },

    /// Frame longer than the line buffer
    #[error("frame exceeds {0} bytes")]
    Overflow(usize),

    /// Numeric field does not fit in 32 bits
    #[error("numeric field out of range")]
    NumberOutOfRange,

    /// Payload is not valid hex
    #[error("bad payload: {0}")]
    Payload(#[from] HexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Error,
    Ack,
    Delivered,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    /// Command letters
    Command,
    Digit,
    /// Digits, letters and commas
    Detail,
    /// Uppercase hex
    Hex,
}

impl Class {
    fn accepts(self, byte: u8) -> bool {
        match self {
            Class::Command => matches!(
                byte,
                b'H' | b'T' | b'X' | b'D' | b'A' | b'C' | b'W' | b'R' | b'M'
            ),
            Class::Digit => byte.is_ascii_digit(),
            Class::Detail => byte.is_ascii_alphanumeric() || byte == b',',
            Class::Hex => matches!(byte, b'0'..=b'9' | b'A'..=b'F'),
        }
    }
}

/// Field grammar: character class and minimum length
type Field = (Class, usize);

impl Kind {
    fn fields(self) -> &'static [Field] {
        match self {
            Kind::Error => &[(Class::Command, 1), (Class::Digit, 1)],
            Kind::Ack => &[(Class::Command, 1), (Class::Detail, 0)],
            Kind::Delivered => &[(Class::Digit, 1), (Class::Digit, 1)],
            Kind::Received => &[(Class::Digit, 1), (Class::Digit, 1), (Class::Hex, 1)],
        }
    }

    /// Whether a frame may end after field `index` holding `len` bytes
    fn may_end(self, index: usize, len: usize) -> bool {
        let fields = self.fields();
        len >= fields[index].1 && fields[index + 1..].iter().all(|(_, min)| *min == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Tag(usize),
    TagEnd(Kind),
    Field { kind: Kind, index: usize, len: usize },
    Cr(Kind),
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Init => "init",
            State::Tag(_) => "tag",
            State::TagEnd(_) => "tag end",
            State::Field { .. } => "field",
            State::Cr(_) => "line end",
        }
    }
}

/// Incremental modem frame parser
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    buf: Vec<u8>,
    capacity: usize,
}

impl FrameParser {
    /// Create a parser whose line buffer holds `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        FrameParser {
            state: State::Init,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether the parser sits in its initial state with an empty buffer
    pub fn is_idle(&self) -> bool {
        self.state == State::Init && self.buf.is_empty()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = State::Init;
        self.buf.clear();
    }

    /// Feed one byte; returns a frame when `byte` completes one
    pub fn push(&mut self, byte: u8) -> Result<Option<ModemFrame>, ParseError> {
        match self.step(byte) {
            Ok(done) => {
                if !done {
                    return Ok(None);
                }
                let result = self.finish();
                self.reset();
                result.map(Some)
            }
            Err(err) => {
                self.reset();
                // A stray sentinel opens the next line.
                if byte == b'$' {
                    self.state = State::Tag(0);
                    self.buf.push(byte);
                }
                Err(err)
            }
        }
    }

    /// Advance the state machine; `Ok(true)` means a full line was collected
    fn step(&mut self, byte: u8) -> Result<bool, ParseError> {
        let unexpected = ParseError::UnexpectedByte {
            byte,
            state: self.state.name(),
        };
        if self.buf.len() >= self.capacity {
            return Err(ParseError::Overflow(self.capacity));
        }

        self.state = match self.state {
            State::Init if byte == b'$' => State::Tag(0),
            State::Tag(n) => {
                let matched = TAGS.iter().find(|(tag, _)| {
                    tag[..n] == self.buf[1..] && tag[n] == byte
                });
                match matched {
                    Some((_, kind)) if n == 4 => State::TagEnd(*kind),
                    Some(_) => State::Tag(n + 1),
                    None => return Err(unexpected),
                }
            }
            State::TagEnd(kind) if byte == b',' => State::Field {
                kind,
                index: 0,
                len: 0,
            },
            State::Field { kind, index, len } => {
                let (class, min) = kind.fields()[index];
                if class.accepts(byte) {
                    State::Field {
                        kind,
                        index,
                        len: len + 1,
                    }
                } else if byte == b',' && len >= min && index + 1 < kind.fields().len() {
                    State::Field {
                        kind,
                        index: index + 1,
                        len: 0,
                    }
                } else if byte == b'\r' && kind.may_end(index, len) {
                    State::Cr(kind)
                } else {
                    return Err(unexpected);
                }
            }
            State::Cr(_) if byte == b'\n' => {
                self.buf.push(byte);
                return Ok(true);
            }
            _ => return Err(unexpected),
        };

        self.buf.push(byte);
        Ok(false)
    }

    /// Build the frame from a complete line in `buf`
    fn finish(&self) -> Result<ModemFrame, ParseError> {
        // "$TAGXX," prefix and "\r\n" suffix are guaranteed by the grammar.
        let tag = &self.buf[1..6];
        let body = &self.buf[7..self.buf.len() - 2];

        if tag == TAG_ACK {
            let mut parts = body.splitn(2, |b| *b == b',');
            let command = text(parts.next().unwrap_or_default());
            let detail = parts.next().map(text);
            return Ok(ModemFrame::Ack { command, detail });
        }

        let parts: Vec<&[u8]> = body.split(|b| *b == b',').collect();
        match (tag, parts.as_slice()) {
            (t, [command, code]) if t == TAG_ERROR => Ok(ModemFrame::Error {
                command: text(command),
                code: number(code)?,
            }),
            (t, [result, packet]) if t == TAG_DELIVERED => Ok(ModemFrame::Delivered {
                result: number(result)?,
                packet: number(packet)?,
            }),
            (t, [src, dst, payload]) if t == TAG_RECEIVED => Ok(ModemFrame::Received {
                src: number(src)?,
                dst: number(dst)?,
                payload: hex::decode(payload)?,
            }),
            _ => Err(ParseError::UnexpectedByte {
                byte: b'\n',
                state: "line end",
            }),
        }
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn number(digits: &[u8]) -> Result<u32, ParseError> {
    digits.iter().try_fold(0u32, |acc, d| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(u32::from(d - b'0')))
            .ok_or(ParseError::NumberOutOfRange)
    })
}
