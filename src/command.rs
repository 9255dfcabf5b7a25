//! DIMSE command set scanning.
//!
//! A DIMSE command set travels inside command presentation data values,
//! always encoded in Implicit VR Little Endian,
//! and all of its elements live in group `0000`.
//! This module provides a small scanner which pulls out the handful of
//! fields the protocol engine needs to drive message dispatch,
//! without involving a full data set codec.
use byteordered::byteorder::{LittleEndian, ReadBytesExt};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::{Cursor, Read};

/// Command Group Length (0000,0000)
pub const TAG_COMMAND_GROUP_LENGTH: (u16, u16) = (0x0000, 0x0000);
/// Affected SOP Class UID (0000,0002)
pub const TAG_AFFECTED_SOP_CLASS_UID: (u16, u16) = (0x0000, 0x0002);
/// Command Field (0000,0100)
pub const TAG_COMMAND_FIELD: (u16, u16) = (0x0000, 0x0100);
/// Message ID (0000,0110)
pub const TAG_MESSAGE_ID: (u16, u16) = (0x0000, 0x0110);
/// Message ID Being Responded To (0000,0120)
pub const TAG_MESSAGE_ID_BEING_RESPONDED_TO: (u16, u16) = (0x0000, 0x0120);
/// Priority (0000,0700)
pub const TAG_PRIORITY: (u16, u16) = (0x0000, 0x0700);
/// Command Data Set Type (0000,0800)
pub const TAG_COMMAND_DATA_SET_TYPE: (u16, u16) = (0x0000, 0x0800);
/// Status (0000,0900)
pub const TAG_STATUS: (u16, u16) = (0x0000, 0x0900);

/// The value of Command Data Set Type which indicates
/// that no data set follows the command set.
pub const NO_DATA_SET: u16 = 0x0101;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not read command element: {}", source))]
    ReadElement {
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display(
        "Unexpected element tag ({:04X},{:04X}) in command set",
        group,
        element
    ))]
    UnexpectedTag {
        group: u16,
        element: u16,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Command element ({:04X},{:04X}) has invalid length {} for its value representation",
        group,
        element,
        length
    ))]
    InvalidElementLength {
        group: u16,
        element: u16,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Command element ({:04X},{:04X}) overruns the command group ({} bytes declared)",
        group,
        element,
        length
    ))]
    ElementOverrun {
        group: u16,
        element: u16,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Command set does not start with Command Group Length"))]
    MissingGroupLength { backtrace: Backtrace },

    #[snafu(display("Could not decode text value of element ({:04X},{:04X})", group, element))]
    DecodeText {
        group: u16,
        element: u16,
        backtrace: Backtrace,
        source: std::str::Utf8Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An enumeration of supported DIMSE command fields,
/// the value of element (0000,0100).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0100 => Some(CommandField::NEventReportRq),
            0x8100 => Some(CommandField::NEventReportRsp),
            0x0110 => Some(CommandField::NGetRq),
            0x8110 => Some(CommandField::NGetRsp),
            0x0120 => Some(CommandField::NSetRq),
            0x8120 => Some(CommandField::NSetRsp),
            0x0130 => Some(CommandField::NActionRq),
            0x8130 => Some(CommandField::NActionRsp),
            0x0140 => Some(CommandField::NCreateRq),
            0x8140 => Some(CommandField::NCreateRsp),
            0x0150 => Some(CommandField::NDeleteRq),
            0x8150 => Some(CommandField::NDeleteRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    /// Whether this command field identifies a request primitive.
    pub fn is_request(self) -> bool {
        (self as u16) & 0x8000 == 0
    }
}

/// The class of an assembled DIMSE message,
/// determined once from the command field value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageClass {
    /// A request primitive (RQ), including C-CANCEL.
    Request(CommandField),
    /// A response primitive (RSP).
    Response(CommandField),
    /// A command field value this engine does not recognize.
    Unclassified(u16),
}

impl MessageClass {
    pub fn from(value: u16) -> Self {
        match CommandField::from(value) {
            Some(field) if field.is_request() => MessageClass::Request(field),
            Some(field) => MessageClass::Response(field),
            None => MessageClass::Unclassified(value),
        }
    }
}

/// An enumeration of DIMSE operation priorities,
/// the value of element (0000,0700).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Medium = 0x0000,
    High = 0x0001,
    Low = 0x0002,
}

impl Priority {
    pub fn from(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// The fields of interest scanned out of a complete DIMSE command set.
///
/// The raw command bytes are retained alongside,
/// so that consumers with a full data set codec
/// can still decode the elements this scanner skips.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    /// the raw value of Command Field (0000,0100)
    pub command_field: u16,
    /// the message classification derived from the command field
    pub class: MessageClass,
    /// Command Data Set Type (0000,0800)
    pub data_set_type: Option<u16>,
    /// Message ID (0000,0110)
    pub message_id: Option<u16>,
    /// Message ID Being Responded To (0000,0120)
    pub message_id_being_responded_to: Option<u16>,
    /// Status (0000,0900)
    pub status: Option<u16>,
    /// Affected SOP Class UID (0000,0002)
    pub affected_sop_class_uid: Option<String>,
    /// Priority (0000,0700)
    pub priority: Option<Priority>,
    /// the full command set bytes, Implicit VR Little Endian
    pub raw: Vec<u8>,
}

impl CommandSet {
    /// Whether the scanned command set announces a following data set.
    pub fn has_data_set(&self) -> bool {
        self.data_set_type.map(|v| v != NO_DATA_SET).unwrap_or(false)
    }

    /// Scan the given command bytes.
    ///
    /// Returns `Ok(None)` if the bytes are a valid prefix of a command set
    /// which is not yet complete
    /// (the declared Command Group Length has not been accumulated),
    /// in which case the caller should retry with more bytes appended.
    /// Malformed bytes are an error regardless of completeness.
    pub fn scan(bytes: &[u8]) -> Result<Option<CommandSet>> {
        // element header: tag (2 + 2) + 32-bit length, all little endian
        if bytes.len() < 12 {
            return Ok(None);
        }

        let mut cursor = Cursor::new(bytes);
        let group = cursor
            .read_u16::<LittleEndian>()
            .context(ReadElementSnafu)?;
        let element = cursor
            .read_u16::<LittleEndian>()
            .context(ReadElementSnafu)?;
        let length = cursor
            .read_u32::<LittleEndian>()
            .context(ReadElementSnafu)?;

        snafu::ensure!(
            (group, element) == TAG_COMMAND_GROUP_LENGTH,
            MissingGroupLengthSnafu
        );
        snafu::ensure!(
            length == 4,
            InvalidElementLengthSnafu {
                group,
                element,
                length
            }
        );
        let group_length = cursor
            .read_u32::<LittleEndian>()
            .context(ReadElementSnafu)? as usize;

        let group_start = cursor.position() as usize;
        if bytes.len() < group_start + group_length {
            // incomplete, wait for more fragments
            return Ok(None);
        }

        let mut command_set = CommandSet {
            command_field: 0,
            class: MessageClass::Unclassified(0),
            data_set_type: None,
            message_id: None,
            message_id_being_responded_to: None,
            status: None,
            affected_sop_class_uid: None,
            priority: None,
            raw: bytes.to_vec(),
        };

        let group_end = group_start + group_length;
        while (cursor.position() as usize) < group_end {
            let group = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementSnafu)?;
            let element = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementSnafu)?;
            let length = cursor
                .read_u32::<LittleEndian>()
                .context(ReadElementSnafu)?;

            snafu::ensure!(group == 0x0000, UnexpectedTagSnafu { group, element });
            snafu::ensure!(
                cursor.position() as usize + length as usize <= group_end,
                ElementOverrunSnafu {
                    group,
                    element,
                    length
                }
            );

            match (group, element) {
                TAG_COMMAND_FIELD => {
                    let value = read_us(&mut cursor, group, element, length)?;
                    command_set.command_field = value;
                    command_set.class = MessageClass::from(value);
                }
                TAG_COMMAND_DATA_SET_TYPE => {
                    command_set.data_set_type =
                        Some(read_us(&mut cursor, group, element, length)?);
                }
                TAG_MESSAGE_ID => {
                    command_set.message_id = Some(read_us(&mut cursor, group, element, length)?);
                }
                TAG_MESSAGE_ID_BEING_RESPONDED_TO => {
                    command_set.message_id_being_responded_to =
                        Some(read_us(&mut cursor, group, element, length)?);
                }
                TAG_STATUS => {
                    command_set.status = Some(read_us(&mut cursor, group, element, length)?);
                }
                TAG_PRIORITY => {
                    command_set.priority =
                        Priority::from(read_us(&mut cursor, group, element, length)?);
                }
                TAG_AFFECTED_SOP_CLASS_UID => {
                    command_set.affected_sop_class_uid =
                        Some(read_uid(&mut cursor, group, element, length)?);
                }
                _ => {
                    // not a field of interest to the engine
                    cursor.set_position(cursor.position() + u64::from(length));
                }
            }
        }

        Ok(Some(command_set))
    }
}

/// Read an unsigned short (US) element value.
fn read_us(cursor: &mut Cursor<&[u8]>, group: u16, element: u16, length: u32) -> Result<u16> {
    snafu::ensure!(
        length == 2,
        InvalidElementLengthSnafu {
            group,
            element,
            length
        }
    );
    cursor
        .read_u16::<LittleEndian>()
        .context(ReadElementSnafu)
}

/// Read a UID (UI) element value,
/// trimming trailing NUL padding.
fn read_uid(cursor: &mut Cursor<&[u8]>, group: u16, element: u16, length: u32) -> Result<String> {
    let mut value = vec![0u8; length as usize];
    cursor
        .read_exact(&mut value)
        .context(ReadElementSnafu)?;
    let text = std::str::from_utf8(&value).context(DecodeTextSnafu { group, element })?;
    Ok(text.trim_end_matches(['\0', ' ']).to_string())
}

/// Assemble a DIMSE command set from `(tag, u16 value)` pairs,
/// Implicit VR Little Endian, with a leading Command Group Length.
///
/// Intended for echo-style commands whose elements are all US;
/// UID elements must be appended separately.
pub fn build_command_set(elements: &[((u16, u16), u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    for ((group, element), value) in elements {
        body.extend_from_slice(&group.to_le_bytes());
        body.extend_from_slice(&element.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&value.to_le_bytes());
    }

    let mut bytes = Vec::with_capacity(body.len() + 12);
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes
}
