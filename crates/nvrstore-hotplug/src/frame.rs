//! Wire framing for the notifier protocol.
//!
//! One message per connection:
//!
//! ```text
//! 0x01 DEV_DETECT 0x1E <subsystem> 0x1E <action> 0x1E <devpath> 0x1E <serial> 0x1E <baseNode> 0x04
//! ```
//!
//! Every field has a fixed ceiling inherited from the notifier's buffers;
//! the separator search for a field never looks further than that ceiling,
//! so malformed input cannot make the parser scan the whole buffer.

use std::fmt;

use thiserror::Error;

use crate::event::{Action, DeviceEvent, Subsystem};

/// Start-of-message marker.
pub const SOM: u8 = 0x01;
/// End-of-message marker.
pub const EOM: u8 = 0x04;
/// Field separator (ASCII record separator).
pub const FIELD_SEPARATOR: u8 = 0x1E;
/// Header token, compared case-insensitively.
pub const HEADER_TOKEN: &str = "DEV_DETECT";
/// Largest message the server will buffer.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Fields of a frame, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Protocol header token.
    Header,
    /// Kernel subsystem.
    Subsystem,
    /// Kernel action.
    Action,
    /// Device topology path.
    Devpath,
    /// Device serial.
    Serial,
    /// Block device base name.
    BaseNode,
}

impl Field {
    /// Wire order of all fields.
    pub const ORDER: [Field; 6] = [
        Field::Header,
        Field::Subsystem,
        Field::Action,
        Field::Devpath,
        Field::Serial,
        Field::BaseNode,
    ];

    /// Buffer ceiling for the field. Content must be strictly shorter.
    pub const fn ceiling(&self) -> usize {
        match self {
            Field::Header | Field::Subsystem | Field::Action | Field::BaseNode => 25,
            Field::Devpath | Field::Serial => 128,
        }
    }

    /// Longest accepted content, in bytes.
    pub const fn max_len(&self) -> usize {
        self.ceiling() - 1
    }

    /// Field name as used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Header => "header",
            Field::Subsystem => "subsystem",
            Field::Action => "action",
            Field::Devpath => "devpath",
            Field::Serial => "serial",
            Field::BaseNode => "baseNode",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structural problems found while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyntaxFault {
    /// Zero-length input.
    #[error("empty message")]
    Empty,
    /// First byte is not [`SOM`].
    #[error("missing start-of-message marker")]
    MissingStart,
    /// Last byte is not [`EOM`].
    #[error("missing end-of-message marker")]
    MissingEnd,
    /// No separator followed the field before the frame ended.
    #[error("no separator after {0} field")]
    MissingSeparator(Field),
    /// The field reached its ceiling without a separator.
    #[error("{0} field exceeds {max} bytes", max = .0.max_len())]
    FieldTooLong(Field),
    /// A separator appeared inside the final field.
    #[error("separator inside {0} field")]
    SeparatorInField(Field),
    /// The field is not UTF-8 text.
    #[error("{0} field is not valid text")]
    Encoding(Field),
}

/// Reasons a frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Markers, separators or field widths are wrong.
    #[error("invalid syntax: {0}")]
    InvalidSyntax(SyntaxFault),

    /// Well-formed frame whose header is not the protocol token.
    #[error("invalid message: unexpected header {0:?}")]
    InvalidMessage(String),

    /// Action outside `add`/`change`/`remove`.
    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

impl From<SyntaxFault> for FrameError {
    fn from(fault: SyntaxFault) -> Self {
        FrameError::InvalidSyntax(fault)
    }
}

/// Walks the frame body field by field.
struct FieldCursor<'a> {
    rest: &'a [u8],
}

impl<'a> FieldCursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }

    /// Take a separator-terminated field, searching at most `field.ceiling()` bytes.
    fn next_raw(&mut self, field: Field) -> Result<&'a [u8], SyntaxFault> {
        let window = self.rest.len().min(field.ceiling());
        match self.rest[..window].iter().position(|&b| b == FIELD_SEPARATOR) {
            Some(pos) => {
                let value = &self.rest[..pos];
                self.rest = &self.rest[pos + 1..];
                Ok(value)
            }
            None if self.rest.len() >= field.ceiling() => Err(SyntaxFault::FieldTooLong(field)),
            None => Err(SyntaxFault::MissingSeparator(field)),
        }
    }

    fn next_text(&mut self, field: Field) -> Result<&'a str, SyntaxFault> {
        let raw = self.next_raw(field)?;
        std::str::from_utf8(raw).map_err(|_| SyntaxFault::Encoding(field))
    }

    /// The final field runs up to the end of the body.
    fn last_text(&mut self, field: Field) -> Result<&'a str, SyntaxFault> {
        if self.rest.len() >= field.ceiling() {
            return Err(SyntaxFault::FieldTooLong(field));
        }
        if self.rest.contains(&FIELD_SEPARATOR) {
            return Err(SyntaxFault::SeparatorInField(field));
        }
        let raw = std::mem::take(&mut self.rest);
        std::str::from_utf8(raw).map_err(|_| SyntaxFault::Encoding(field))
    }
}

/// Decode one complete frame into a [`DeviceEvent`].
pub fn parse(buf: &[u8]) -> Result<DeviceEvent, FrameError> {
    let (first, last) = match (buf.first(), buf.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(SyntaxFault::Empty.into()),
    };
    if first != SOM {
        return Err(SyntaxFault::MissingStart.into());
    }
    if buf.len() < 2 || last != EOM {
        return Err(SyntaxFault::MissingEnd.into());
    }

    let mut cursor = FieldCursor::new(&buf[1..buf.len() - 1]);

    let header = cursor.next_raw(Field::Header)?;
    let subsystem = cursor.next_text(Field::Subsystem)?;
    let action = cursor.next_text(Field::Action)?;
    let devpath = cursor.next_text(Field::Devpath)?;
    let serial = cursor.next_text(Field::Serial)?;
    let base_node = cursor.last_text(Field::BaseNode)?;

    // Only a syntactically whole frame is judged on its header.
    if !header.eq_ignore_ascii_case(HEADER_TOKEN.as_bytes()) {
        return Err(FrameError::InvalidMessage(
            String::from_utf8_lossy(header).into_owned(),
        ));
    }

    let action =
        Action::from_wire(action).ok_or_else(|| FrameError::UnknownAction(action.to_string()))?;

    Ok(DeviceEvent {
        subsystem: Subsystem::from_wire(subsystem),
        action,
        devpath: devpath.to_string(),
        serial: serial.to_string(),
        base_node: base_node.to_string(),
    })
}

/// Encode an event the way the notifier sends it.
pub fn encode(event: &DeviceEvent) -> Result<Vec<u8>, FrameError> {
    let values = [
        (Field::Header, HEADER_TOKEN),
        (Field::Subsystem, event.subsystem.as_str()),
        (Field::Action, event.action.as_str()),
        (Field::Devpath, event.devpath.as_str()),
        (Field::Serial, event.serial.as_str()),
        (Field::BaseNode, event.base_node.as_str()),
    ];

    let mut out = Vec::with_capacity(2 + values.iter().map(|(_, v)| v.len() + 1).sum::<usize>());
    out.push(SOM);
    for (i, (field, value)) in values.iter().enumerate() {
        if value.len() > field.max_len() {
            return Err(SyntaxFault::FieldTooLong(*field).into());
        }
        if value.as_bytes().contains(&FIELD_SEPARATOR) {
            return Err(SyntaxFault::SeparatorInField(*field).into());
        }
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.extend_from_slice(value.as_bytes());
    }
    out.push(EOM);
    Ok(out)
}

/// True once `buf` holds a complete frame: starts with SOM and ends with EOM.
pub fn is_complete(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == SOM && buf[buf.len() - 1] == EOM
}
