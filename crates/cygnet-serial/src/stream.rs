//! Incremental frame extraction from a delimited byte stream
//!
//! The link carries zero-delimited COBS-encoded frames. The parser consumes arbitrary read
//! chunks, cuts them at delimiters, decodes each segment, and parses the result as a frame.
//! Segments that fail either step are reported verbatim as out-of-band data: the stream may
//! carry line noise, boot messages, or another protocol's traffic between valid frames.

use cygnet_wire::WireFrame;

use crate::cobs;

const FRAME_DELIMITER: u8 = 0x00;

/// Cap on the accumulated segment size; protects against a stream with no delimiters
const MAX_SEGMENT_SIZE: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(WireFrame),
    /// A delimited segment that did not decode to a valid frame, as read off the wire
    OutOfBand(Vec<u8>),
}

/// Streaming parser state; one instance per direction of one link
#[derive(Default)]
pub struct StreamParser {
    segment: Vec<u8>,
    overflowed: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a read chunk, emitting an event per completed segment
    pub fn push(&mut self, chunk: &[u8], mut emit: impl FnMut(StreamEvent)) {
        for &byte in chunk {
            if byte != FRAME_DELIMITER {
                if self.segment.len() < MAX_SEGMENT_SIZE {
                    self.segment.push(byte);
                } else {
                    self.overflowed = true;
                }
                continue;
            }
            // Back-to-back delimiters produce empty segments; they are not even junk
            if self.segment.is_empty() && !self.overflowed {
                continue;
            }
            let segment = std::mem::take(&mut self.segment);
            if self.overflowed {
                self.overflowed = false;
                emit(StreamEvent::OutOfBand(segment));
                continue;
            }
            match cobs::decode(&segment).and_then(|image| WireFrame::parse(&image)) {
                Some(frame) => emit(StreamEvent::Frame(frame)),
                None => emit(StreamEvent::OutOfBand(segment)),
            }
        }
    }
}

/// Wrap one frame for the wire: delimiter, COBS image, delimiter
#[must_use]
pub fn encode_frame(frame: &WireFrame) -> Vec<u8> {
    let image = frame.compile();
    let encoded = cobs::encode(&image);
    let mut out = Vec::with_capacity(encoded.len() + 2);
    out.push(FRAME_DELIMITER);
    out.extend_from_slice(&encoded);
    out.push(FRAME_DELIMITER);
    out
}

#[cfg(test)]
mod tests {
    use cygnet_core::{DataSpecifier, Priority};
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(transfer_id: u64) -> WireFrame {
        WireFrame {
            priority: Priority::Nominal,
            source_node_id: Some(1),
            destination_node_id: Some(2),
            data_specifier: DataSpecifier::Message { subject_id: 6 },
            transfer_id,
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: b"some payload\x00with zeros\x00".to_vec(),
        }
    }

    fn collect(parser: &mut StreamParser, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        parser.push(bytes, |e| events.push(e));
        events
    }

    #[test]
    fn test_frames_extracted_across_chunk_boundaries() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(&frame(1)));
        wire.extend_from_slice(&encode_frame(&frame(2)));

        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        // Feed the stream one byte at a time
        for byte in wire {
            parser.push(&[byte], |e| events.push(e));
        }
        assert_eq!(
            events,
            vec![StreamEvent::Frame(frame(1)), StreamEvent::Frame(frame(2))]
        );
    }

    #[test]
    fn test_junk_between_frames_is_out_of_band() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"boot banner");
        wire.extend_from_slice(&encode_frame(&frame(5)));
        wire.extend_from_slice(b"noise\x01\x02");
        wire.push(0);

        let mut parser = StreamParser::new();
        let events = collect(&mut parser, &wire);
        assert_eq!(
            events,
            vec![
                StreamEvent::OutOfBand(b"boot banner".to_vec()),
                StreamEvent::Frame(frame(5)),
                StreamEvent::OutOfBand(b"noise\x01\x02".to_vec()),
            ]
        );
    }

    #[test]
    fn test_empty_segments_are_skipped() {
        let mut parser = StreamParser::new();
        assert_eq!(collect(&mut parser, &[0, 0, 0, 0]), vec![]);
    }

    #[test]
    fn test_corrupted_frame_is_out_of_band() {
        let mut image = encode_frame(&frame(9));
        // Corrupt one byte inside the COBS body without introducing a delimiter
        let middle = image.len() / 2;
        image[middle] = if image[middle] == 0xAA { 0xAB } else { 0xAA };
        let mut parser = StreamParser::new();
        let events = collect(&mut parser, &image);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::OutOfBand(_)));
    }
}
