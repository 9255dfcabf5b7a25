//! DIMSE message fragmentation and reassembly.
//!
//! Outbound, a command set and optional data set are cut into
//! presentation data values no larger than the negotiated maximum
//! PDU length allows, and grouped into P-DATA-TF PDUs.
//! Inbound, a [`Reassembly`] accumulates arriving fragments into at
//! most one in-flight message per association,
//! scanning the command set as soon as its last fragment lands
//! so that the engine can decide how to receive the data set
//! before it starts flowing.
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;
use tracing::debug;

use crate::command::CommandSet;
use crate::pdu::{PDataValue, PDataValueType, Pdu};

/// The fixed overhead of one presentation data value item:
/// 4 bytes of length, 1 of context id, 1 of message control header.
pub const PDV_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Received a command fragment on context {} while reassembling a message on context {}",
        got,
        expected
    ))]
    UnexpectedCommandFragment {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Received a data set fragment on context {} without a preceding command set",
        presentation_context_id
    ))]
    UnexpectedDataFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Command set ended on an incomplete element stream"))]
    IncompleteCommand { backtrace: Backtrace },

    #[snafu(display("Could not scan command set: {}", source))]
    MalformedCommand {
        #[snafu(backtrace)]
        source: crate::command::Error,
    },

    #[snafu(display("Could not forward data set bytes to the sink: {}", source))]
    WriteDataset {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Split a payload into fragments of at most `max_fragment_length` bytes.
///
/// An empty payload yields no fragments.
fn split_fragments(payload: &[u8], max_fragment_length: usize) -> Vec<&[u8]> {
    payload.chunks(max_fragment_length).collect()
}

/// Cut a DIMSE message into P-DATA-TF PDUs ready to be written out.
///
/// Every presentation data value carries at most
/// `max_pdu_length - 6` bytes of payload.
/// By default each value travels in its own PDU;
/// with `combine_command_data`, consecutive values are packed together
/// as long as the PDU stays within the maximum length.
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    data_set: Option<&[u8]>,
    max_pdu_length: u32,
    combine_command_data: bool,
) -> Vec<Pdu> {
    let max_fragment_length = (max_pdu_length - PDV_HEADER_SIZE) as usize;

    let mut values = Vec::new();
    let command_fragments = split_fragments(command, max_fragment_length);
    let command_count = command_fragments.len();
    for (i, fragment) in command_fragments.into_iter().enumerate() {
        values.push(PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: i + 1 == command_count,
            data: fragment.to_vec(),
        });
    }
    if let Some(data_set) = data_set {
        let data_fragments = split_fragments(data_set, max_fragment_length);
        let data_count = data_fragments.len();
        for (i, fragment) in data_fragments.into_iter().enumerate() {
            values.push(PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Data,
                is_last: i + 1 == data_count,
                data: fragment.to_vec(),
            });
        }
    }

    if !combine_command_data {
        return values
            .into_iter()
            .map(|value| Pdu::PData { data: vec![value] })
            .collect();
    }

    // greedy packing under the PDU length limit
    let mut pdus: Vec<Pdu> = Vec::new();
    let mut current: Vec<PDataValue> = Vec::new();
    let mut current_len = 0u32;
    for value in values {
        let value_len = PDV_HEADER_SIZE + value.data.len() as u32;
        if !current.is_empty() && current_len + value_len > max_pdu_length {
            pdus.push(Pdu::PData {
                data: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        current_len += value_len;
        current.push(value);
    }
    if !current.is_empty() {
        pdus.push(Pdu::PData { data: current });
    }
    pdus
}

/// How the engine should receive the data set of a message
/// whose command set announced one.
pub enum DatasetHandling {
    /// Accumulate the data set bytes in memory
    /// and hand them over on the assembled message.
    Buffer,
    /// Push the data set bytes into the given sink as they arrive;
    /// the assembled message carries no bytes of its own.
    Stream(Box<dyn Write + Send>),
}

impl std::fmt::Debug for DatasetHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetHandling::Buffer => f.write_str("Buffer"),
            DatasetHandling::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The data set portion of an assembled DIMSE message.
#[derive(Debug, PartialEq)]
pub enum DatasetPayload {
    /// the command set announced no data set
    None,
    /// the accumulated data set bytes;
    /// `truncated` is set when accumulation stopped at the
    /// configured boundary tag
    Buffered { bytes: Vec<u8>, truncated: bool },
    /// the bytes went to a streaming sink
    Streamed,
}

/// A fully reassembled DIMSE message.
#[derive(Debug)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the scanned command set
    pub command: CommandSet,
    /// the data set portion
    pub data_set: DatasetPayload,
}

/// What a pushed fragment produced.
#[derive(Debug)]
pub enum ReassemblyEvent {
    /// more fragments are needed
    Pending,
    /// the command set is complete and announces a data set;
    /// the caller should pick a [`DatasetHandling`] before
    /// pushing further fragments
    CommandComplete(CommandSet),
    /// the whole message is complete
    MessageComplete(DimseMessage),
}

enum DatasetSink {
    Buffer {
        bytes: Vec<u8>,
        scan_position: usize,
        capped: bool,
    },
    Stream(Box<dyn Write + Send>),
}

struct Record {
    presentation_context_id: u8,
    command_bytes: Vec<u8>,
    command: Option<CommandSet>,
    sink: DatasetSink,
}

/// Reassembles inbound presentation data values into DIMSE messages.
///
/// At most one message is in flight at a time:
/// a command fragment arriving while a data set is still pending
/// is a protocol violation.
pub struct Reassembly {
    record: Option<Record>,
    /// data set elements at or past this tag are not buffered
    stop_tag: Option<(u16, u16)>,
}

impl Reassembly {
    pub fn new(stop_tag: Option<(u16, u16)>) -> Self {
        Reassembly {
            record: None,
            stop_tag,
        }
    }

    /// Whether a message is currently being reassembled.
    pub fn in_flight(&self) -> bool {
        self.record.is_some()
    }

    /// Choose how the pending data set is received.
    ///
    /// Only meaningful right after a
    /// [`CommandComplete`](ReassemblyEvent::CommandComplete) event.
    pub fn set_dataset_handling(&mut self, handling: DatasetHandling) {
        if let Some(record) = &mut self.record {
            record.sink = match handling {
                DatasetHandling::Buffer => DatasetSink::Buffer {
                    bytes: Vec::new(),
                    scan_position: 0,
                    capped: false,
                },
                DatasetHandling::Stream(sink) => DatasetSink::Stream(sink),
            };
        }
    }

    /// Drop any partially assembled message,
    /// abandoning its streaming sink if one was attached.
    pub fn cancel(&mut self) {
        self.record = None;
    }

    /// Feed one inbound presentation data value.
    pub fn push(&mut self, value: PDataValue) -> Result<ReassemblyEvent> {
        match value.value_type {
            PDataValueType::Command => self.push_command(value),
            PDataValueType::Data => self.push_data(value),
        }
    }

    fn push_command(&mut self, value: PDataValue) -> Result<ReassemblyEvent> {
        if let Some(record) = &self.record {
            // a second command may not start before
            // the previous message is complete
            snafu::ensure!(
                record.command.is_none()
                    && record.presentation_context_id == value.presentation_context_id,
                UnexpectedCommandFragmentSnafu {
                    expected: record.presentation_context_id,
                    got: value.presentation_context_id,
                }
            );
        }
        let record = self.record.get_or_insert_with(|| Record {
            presentation_context_id: value.presentation_context_id,
            command_bytes: Vec::new(),
            command: None,
            sink: DatasetSink::Buffer {
                bytes: Vec::new(),
                scan_position: 0,
                capped: false,
            },
        });

        record.command_bytes.extend_from_slice(&value.data);

        if !value.is_last {
            return Ok(ReassemblyEvent::Pending);
        }

        let command = CommandSet::scan(&record.command_bytes)
            .context(MalformedCommandSnafu)?
            .ok_or_else(|| IncompleteCommandSnafu.build())?;
        debug!(
            command_field = command.command_field,
            pc_id = record.presentation_context_id,
            "command set complete"
        );

        if command.has_data_set() {
            record.command = Some(command.clone());
            Ok(ReassemblyEvent::CommandComplete(command))
        } else {
            let presentation_context_id = record.presentation_context_id;
            self.record = None;
            Ok(ReassemblyEvent::MessageComplete(DimseMessage {
                presentation_context_id,
                command,
                data_set: DatasetPayload::None,
            }))
        }
    }

    fn push_data(&mut self, value: PDataValue) -> Result<ReassemblyEvent> {
        let stop_tag = self.stop_tag;
        let record = match &mut self.record {
            Some(record) if record.command.is_some() => record,
            _ => {
                return UnexpectedDataFragmentSnafu {
                    presentation_context_id: value.presentation_context_id,
                }
                .fail()
            }
        };
        snafu::ensure!(
            record.presentation_context_id == value.presentation_context_id,
            UnexpectedDataFragmentSnafu {
                presentation_context_id: value.presentation_context_id,
            }
        );

        match &mut record.sink {
            DatasetSink::Buffer {
                bytes,
                scan_position,
                capped,
            } => {
                if !*capped {
                    bytes.extend_from_slice(&value.data);
                    if let Some(stop_tag) = stop_tag {
                        *capped = cap_at_tag(bytes, scan_position, stop_tag);
                    }
                }
            }
            DatasetSink::Stream(sink) => {
                sink.write_all(&value.data).context(WriteDatasetSnafu)?;
            }
        }

        if !value.is_last {
            return Ok(ReassemblyEvent::Pending);
        }

        // presence and command completeness were checked above
        let (presentation_context_id, command, sink) = match self.record.take() {
            Some(Record {
                presentation_context_id,
                command: Some(command),
                sink,
                ..
            }) => (presentation_context_id, command, sink),
            _ => unreachable!(),
        };
        let data_set = match sink {
            DatasetSink::Buffer { bytes, capped, .. } => DatasetPayload::Buffered {
                bytes,
                truncated: capped,
            },
            DatasetSink::Stream(mut sink) => {
                sink.flush().context(WriteDatasetSnafu)?;
                DatasetPayload::Streamed
            }
        };
        Ok(ReassemblyEvent::MessageComplete(DimseMessage {
            presentation_context_id,
            command,
            data_set,
        }))
    }
}

/// Scan Implicit VR Little Endian elements in `bytes`
/// starting from `scan_position`,
/// truncating the buffer at the first element whose tag
/// is at or past `stop_tag`.
///
/// Returns whether the buffer was truncated.
/// Scanning halts without truncation on elements of undefined length,
/// whose extent cannot be known without a full codec.
fn cap_at_tag(bytes: &mut Vec<u8>, scan_position: &mut usize, stop_tag: (u16, u16)) -> bool {
    while *scan_position + 8 <= bytes.len() {
        let p = *scan_position;
        let group = u16::from_le_bytes([bytes[p], bytes[p + 1]]);
        let element = u16::from_le_bytes([bytes[p + 2], bytes[p + 3]]);
        let length = u32::from_le_bytes([bytes[p + 4], bytes[p + 5], bytes[p + 6], bytes[p + 7]]);

        if (group, element) >= stop_tag {
            bytes.truncate(p);
            return true;
        }
        if length == 0xFFFF_FFFF {
            return false;
        }
        match p.checked_add(8 + length as usize) {
            Some(next) => *scan_position = next,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{
        build_command_set, CommandField, NO_DATA_SET, TAG_COMMAND_DATA_SET_TYPE,
        TAG_COMMAND_FIELD, TAG_MESSAGE_ID, TAG_PRIORITY,
    };
    use matches::assert_matches;
    use rstest::rstest;

    const P: u32 = 4096;

    fn store_rq() -> Vec<u8> {
        build_command_set(&[
            (TAG_COMMAND_FIELD, CommandField::CStoreRq as u16),
            (TAG_MESSAGE_ID, 1),
            (TAG_PRIORITY, 0),
            (TAG_COMMAND_DATA_SET_TYPE, 0x0000),
        ])
    }

    fn echo_rq() -> Vec<u8> {
        build_command_set(&[
            (TAG_COMMAND_FIELD, CommandField::CEchoRq as u16),
            (TAG_MESSAGE_ID, 1),
            (TAG_COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        ])
    }

    fn data_values(pdus: &[Pdu]) -> Vec<&PDataValue> {
        pdus.iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data.iter(),
                _ => panic!("expected only P-Data"),
            })
            .collect()
    }

    #[rstest]
    #[case(0, 0)]
    #[case(P - 7, 1)]
    #[case(P - 6, 1)]
    #[case(P - 5, 2)]
    #[case(10 * P, 11)]
    fn data_set_fragment_count_is_ceil_of_payload_over_capacity(
        #[case] payload_length: u32,
        #[case] expected_fragments: u32,
    ) {
        let payload = vec![0xABu8; payload_length as usize];
        let pdus = fragment_message(1, &store_rq(), Some(&payload), P, false);
        let values = data_values(&pdus);
        let data_fragments = values
            .iter()
            .filter(|v| v.value_type == PDataValueType::Data)
            .count() as u32;
        assert_eq!(data_fragments, expected_fragments);
        for value in &values {
            assert!(value.data.len() <= (P - 6) as usize);
        }
    }

    #[test]
    fn fragments_reassemble_byte_exact() {
        let command_bytes = store_rq();
        let payload: Vec<u8> = (0..(3 * P + 17)).map(|i| (i % 251) as u8).collect();
        let pdus = fragment_message(5, &command_bytes, Some(&payload), P, false);

        let mut reassembly = Reassembly::new(None);
        let mut message = None;
        for value in data_values(&pdus) {
            match reassembly.push(value.clone()).unwrap() {
                ReassemblyEvent::MessageComplete(m) => message = Some(m),
                ReassemblyEvent::CommandComplete(command) => {
                    assert!(command.has_data_set());
                    reassembly.set_dataset_handling(DatasetHandling::Buffer);
                }
                ReassemblyEvent::Pending => {}
            }
        }
        let message = message.unwrap();
        assert_eq!(message.presentation_context_id, 5);
        assert_eq!(message.command.raw, command_bytes);
        assert_eq!(
            message.data_set,
            DatasetPayload::Buffered {
                bytes: payload,
                truncated: false,
            }
        );
    }

    #[test]
    fn command_without_data_set_completes_immediately() {
        let pdus = fragment_message(1, &echo_rq(), None, P, false);
        let mut reassembly = Reassembly::new(None);
        let mut events = Vec::new();
        for value in data_values(&pdus) {
            events.push(reassembly.push(value.clone()).unwrap());
        }
        assert_eq!(events.len(), 1);
        assert_matches!(
            events[0],
            ReassemblyEvent::MessageComplete(DimseMessage {
                data_set: DatasetPayload::None,
                ..
            })
        );
        assert!(!reassembly.in_flight());
    }

    #[test]
    fn combining_packs_command_and_data_into_one_pdu() {
        let payload = vec![0u8; 64];
        let pdus = fragment_message(1, &store_rq(), Some(&payload), P, true);
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].value_type, PDataValueType::Command);
                assert_eq!(data[1].value_type, PDataValueType::Data);
            }
            other => panic!("unexpected PDU: {:?}", other),
        }
    }

    #[test]
    fn command_fragment_during_pending_data_set_is_a_violation() {
        let mut reassembly = Reassembly::new(None);
        let pdus = fragment_message(1, &store_rq(), None, P, false);
        let command_value = data_values(&pdus)[0].clone();

        assert_matches!(
            reassembly.push(command_value.clone()),
            Ok(ReassemblyEvent::CommandComplete(_))
        );
        assert_matches!(
            reassembly.push(command_value),
            Err(Error::UnexpectedCommandFragment { .. })
        );
    }

    #[test]
    fn data_fragment_without_command_is_a_violation() {
        let mut reassembly = Reassembly::new(None);
        let value = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![1, 2, 3],
        };
        assert_matches!(
            reassembly.push(value),
            Err(Error::UnexpectedDataFragment { .. })
        );
    }

    #[test]
    fn streaming_sink_receives_all_data_set_bytes() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct SharedSink(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let payload: Vec<u8> = (0..9000u32).map(|i| (i % 256) as u8).collect();
        let pdus = fragment_message(1, &store_rq(), Some(&payload), P, false);
        let sink = SharedSink::default();

        let mut reassembly = Reassembly::new(None);
        let mut message = None;
        for value in data_values(&pdus) {
            match reassembly.push(value.clone()).unwrap() {
                ReassemblyEvent::CommandComplete(_) => {
                    reassembly
                        .set_dataset_handling(DatasetHandling::Stream(Box::new(sink.clone())));
                }
                ReassemblyEvent::MessageComplete(m) => message = Some(m),
                ReassemblyEvent::Pending => {}
            }
        }
        assert_eq!(message.unwrap().data_set, DatasetPayload::Streamed);
        assert_eq!(*sink.0.lock().unwrap(), payload);
    }

    #[test]
    fn buffering_stops_at_the_configured_tag() {
        // three elements; the buffer must stop before (7FE0,0010)
        let mut data_set = Vec::new();
        for (tag, value_len) in [
            ((0x0008u16, 0x0018u16), 8usize),
            ((0x0010, 0x0010), 4),
            ((0x7FE0, 0x0010), 1024),
        ] {
            data_set.extend_from_slice(&tag.0.to_le_bytes());
            data_set.extend_from_slice(&tag.1.to_le_bytes());
            data_set.extend_from_slice(&(value_len as u32).to_le_bytes());
            data_set.extend_from_slice(&vec![0x42; value_len]);
        }

        let pdus = fragment_message(1, &store_rq(), Some(&data_set), P, false);
        let mut reassembly = Reassembly::new(Some((0x7FE0, 0x0010)));
        let mut message = None;
        for value in data_values(&pdus) {
            match reassembly.push(value.clone()).unwrap() {
                ReassemblyEvent::CommandComplete(_) => {
                    reassembly.set_dataset_handling(DatasetHandling::Buffer);
                }
                ReassemblyEvent::MessageComplete(m) => message = Some(m),
                ReassemblyEvent::Pending => {}
            }
        }
        match message.unwrap().data_set {
            DatasetPayload::Buffered { bytes, truncated } => {
                assert!(truncated);
                // the first two elements only: (8 + 8) + (8 + 4)
                assert_eq!(bytes.len(), 28);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

}
