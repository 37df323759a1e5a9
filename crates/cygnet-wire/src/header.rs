//! The fixed 24-byte frame header used by Cyphal/UDP and Cyphal/serial
//!
//! ```text
//! offset  field
//!      0  version (low nibble; high nibble reserved zero)
//!      1  priority (0 = highest .. 7 = lowest; high bits reserved zero)
//!      2  source node-ID, u16-LE (0xFFFF = anonymous)
//!      4  destination node-ID, u16-LE (0xFFFF = broadcast)
//!      6  data specifier + SNM, u16-LE:
//!         bit 15 = service-not-message; messages carry the subject-ID in the low 15 bits,
//!         services carry (request-not-response << 14) | service-ID
//!      8  transfer-ID, u64-LE
//!     16  frame index + EOT, u32-LE: bit 31 = end-of-transfer, low 31 bits = index
//!     20  user data, u16-LE (opaque; transmitted as zero, ignored on reception)
//!     22  header CRC, CRC-16/CCITT-FALSE over the preceding 22 bytes, big-endian
//! ```
//!
//! All malformed headers (bad version, bad CRC, out-of-range IDs) cause the frame to be dropped.

use byteorder::{ByteOrder, LittleEndian};

use cygnet_core::crc::TransferCrc16;
use cygnet_core::specifier::{ANONYMOUS_NODE_ID, SERVICE_ID_MASK, SUBJECT_ID_MASK};
use cygnet_core::{DataSpecifier, Priority, ServiceRole};

pub const HEADER_SIZE: usize = 24;
pub const VERSION: u8 = 1;

const SNM_BIT: u16 = 1 << 15;
const RNR_BIT: u16 = 1 << 14;
const EOT_BIT: u32 = 1 << 31;
const INDEX_MASK: u32 = EOT_BIT - 1;
/// Width of the wire service-ID field; values above [SERVICE_ID_MASK] are still dropped
const WIRE_SERVICE_ID_MASK: u16 = RNR_BIT - 1;

/// One high-overhead transport frame: header fields plus opaque payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    pub priority: Priority,
    pub source_node_id: Option<u16>,
    pub destination_node_id: Option<u16>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: u64,
    /// Frame index within the transfer, 31 bits
    pub index: u32,
    pub end_of_transfer: bool,
    pub user_data: u16,
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// A frame that is an entire transfer by itself
    #[inline]
    #[must_use]
    pub fn single_frame_transfer(&self) -> bool {
        self.index == 0 && self.end_of_transfer
    }

    /// Pack the 24-byte header. The payload is not included so callers can use vectored I/O.
    #[must_use]
    pub fn compile_header(&self) -> [u8; HEADER_SIZE] {
        let data_specifier_snm = match self.data_specifier {
            DataSpecifier::Message { subject_id } => subject_id,
            DataSpecifier::Service { service_id, role } => {
                let rnr = match role {
                    ServiceRole::Request => RNR_BIT,
                    ServiceRole::Response => 0,
                };
                SNM_BIT | rnr | service_id
            }
        };

        let mut header = [0u8; HEADER_SIZE];
        header[0] = VERSION;
        header[1] = u8::from(self.priority);
        LittleEndian::write_u16(
            &mut header[2..4],
            self.source_node_id.unwrap_or(ANONYMOUS_NODE_ID),
        );
        LittleEndian::write_u16(
            &mut header[4..6],
            self.destination_node_id.unwrap_or(ANONYMOUS_NODE_ID),
        );
        LittleEndian::write_u16(&mut header[6..8], data_specifier_snm);
        LittleEndian::write_u64(&mut header[8..16], self.transfer_id);
        let index_eot = (self.index & INDEX_MASK) | if self.end_of_transfer { EOT_BIT } else { 0 };
        LittleEndian::write_u32(&mut header[16..20], index_eot);
        LittleEndian::write_u16(&mut header[20..22], self.user_data);

        let mut crc = TransferCrc16::new();
        crc.add(&header[..22]);
        header[22..24].copy_from_slice(&crc.value_as_bytes());
        header
    }

    /// Header followed by payload, as transmitted in one datagram
    #[must_use]
    pub fn compile(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.compile_header());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a datagram image; `None` means the frame is not a valid Cyphal frame and must be
    /// dropped
    #[must_use]
    pub fn parse(image: &[u8]) -> Option<WireFrame> {
        if image.len() < HEADER_SIZE {
            return None;
        }
        let header = &image[..HEADER_SIZE];
        if header[0] != VERSION {
            return None;
        }
        let mut crc = TransferCrc16::new();
        crc.add(header);
        if !crc.check_residue() {
            return None;
        }

        let priority = Priority::try_from(header[1]).ok()?;
        let source_node_id = LittleEndian::read_u16(&header[2..4]);
        let destination_node_id = LittleEndian::read_u16(&header[4..6]);
        let data_specifier_snm = LittleEndian::read_u16(&header[6..8]);
        let transfer_id = LittleEndian::read_u64(&header[8..16]);
        let index_eot = LittleEndian::read_u32(&header[16..20]);
        let user_data = LittleEndian::read_u16(&header[20..22]);

        let data_specifier = if data_specifier_snm & SNM_BIT != 0 {
            let service_id = data_specifier_snm & WIRE_SERVICE_ID_MASK;
            if service_id > SERVICE_ID_MASK {
                return None;
            }
            let role = if data_specifier_snm & RNR_BIT != 0 {
                ServiceRole::Request
            } else {
                ServiceRole::Response
            };
            DataSpecifier::Service { service_id, role }
        } else {
            let subject_id = data_specifier_snm & !SNM_BIT;
            if subject_id > SUBJECT_ID_MASK {
                return None;
            }
            DataSpecifier::Message { subject_id }
        };

        let source_node_id = (source_node_id != ANONYMOUS_NODE_ID).then_some(source_node_id);
        let destination_node_id =
            (destination_node_id != ANONYMOUS_NODE_ID).then_some(destination_node_id);
        // Anonymous nodes cannot participate in service transfers
        if data_specifier.is_service() && source_node_id.is_none() {
            return None;
        }

        Some(WireFrame {
            priority,
            source_node_id,
            destination_node_id,
            data_specifier,
            transfer_id,
            index: index_eot & INDEX_MASK,
            end_of_transfer: index_eot & EOT_BIT != 0,
            user_data,
            payload: image[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn subject_frame(end_of_transfer: bool) -> WireFrame {
        WireFrame {
            priority: Priority::Slow,
            source_node_id: Some(1),
            destination_node_id: Some(2),
            data_specifier: DataSpecifier::Message { subject_id: 3 },
            transfer_id: 0x00DE_AD_BE_EF_C0_FF_EE_u64,
            index: 0x00DD_F00D,
            end_of_transfer,
            user_data: 0,
            payload: b"Well, I got here the same way the coin did.".to_vec(),
        }
    }

    fn service_frame(end_of_transfer: bool) -> WireFrame {
        WireFrame {
            data_specifier: DataSpecifier::Service {
                service_id: 3,
                role: ServiceRole::Request,
            },
            ..subject_frame(end_of_transfer)
        }
    }

    #[test]
    fn test_compile_subject_header() {
        let expected: &[u8] = &[
            0x01, // version
            0x06, // priority
            0x01, 0x00, // source_node_id
            0x02, 0x00, // destination_node_id
            0x03, 0x00, // data_specifier_snm
            0xEE, 0xFF, 0xC0, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, // transfer_id
            0x0D, 0xF0, 0xDD, 0x00, // index
            0x00, 0x00, // user_data
            0xF2, 0xCE, // header_crc
        ];
        assert_eq!(subject_frame(false).compile_header().as_slice(), expected);

        let expected_eot: &[u8] = &[
            0x01, 0x06, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, //
            0xEE, 0xFF, 0xC0, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, //
            0x0D, 0xF0, 0xDD, 0x80, // index with the EOT bit
            0x00, 0x00, //
            0xC9, 0x94, // header_crc
        ];
        assert_eq!(subject_frame(true).compile_header().as_slice(), expected_eot);
    }

    #[test]
    fn test_compile_service_header() {
        let expected: &[u8] = &[
            0x01, 0x06, 0x01, 0x00, 0x02, 0x00, //
            0x03, 0xC0, // data_specifier_snm: SNM | RNR | service_id
            0xEE, 0xFF, 0xC0, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, //
            0x0D, 0xF0, 0xDD, 0x00, //
            0x00, 0x00, //
            0x8C, 0xD5, // header_crc
        ];
        assert_eq!(service_frame(false).compile_header().as_slice(), expected);

        let expected_eot: &[u8] = &[
            0x01, 0x06, 0x01, 0x00, 0x02, 0x00, 0x03, 0xC0, //
            0xEE, 0xFF, 0xC0, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, //
            0x0D, 0xF0, 0xDD, 0x80, //
            0x00, 0x00, //
            0xB7, 0x8F, // header_crc
        ];
        assert_eq!(service_frame(true).compile_header().as_slice(), expected_eot);
    }

    #[test]
    fn test_parse_round_trip() {
        for frame in [
            subject_frame(false),
            subject_frame(true),
            service_frame(false),
            service_frame(true),
        ] {
            let parsed = WireFrame::parse(&frame.compile()).unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for size in 0..HEADER_SIZE {
            let image: Vec<u8> = (0..size as u8).collect();
            assert_eq!(WireFrame::parse(&image), None);
        }

        // Corrupted CRC
        let mut image = subject_frame(true).compile();
        image[22] ^= 0xFF;
        assert_eq!(WireFrame::parse(&image), None);

        // Unknown version
        let mut image = subject_frame(true).compile();
        image[0] = 2;
        assert_eq!(WireFrame::parse(&image), None);
    }

    #[test]
    fn test_parse_rejects_out_of_range_ids() {
        // Subject-ID with bits above the 13-bit limit; recompute the CRC so only the range check
        // can reject it
        let mut image = subject_frame(true).compile();
        LittleEndian::write_u16(&mut image[6..8], 0x3FFF);
        let mut crc = TransferCrc16::new();
        crc.add(&image[..22]);
        image[22..24].copy_from_slice(&crc.value_as_bytes());
        assert_eq!(WireFrame::parse(&image), None);

        // Service-ID above the 9-bit limit
        let mut image = service_frame(true).compile();
        LittleEndian::write_u16(&mut image[6..8], SNM_BIT | RNR_BIT | 0x0300);
        let mut crc = TransferCrc16::new();
        crc.add(&image[..22]);
        image[22..24].copy_from_slice(&crc.value_as_bytes());
        assert_eq!(WireFrame::parse(&image), None);
    }

    #[test]
    fn test_parse_rejects_anonymous_service() {
        let mut frame = service_frame(true);
        frame.source_node_id = None;
        assert_eq!(WireFrame::parse(&frame.compile()), None);
    }

    #[test]
    fn test_anonymous_and_broadcast_node_ids() {
        let frame = WireFrame {
            priority: Priority::Nominal,
            source_node_id: None,
            destination_node_id: None,
            data_specifier: DataSpecifier::Message { subject_id: 10 },
            transfer_id: 1,
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: b"x".to_vec(),
        };
        let image = frame.compile();
        assert_eq!(LittleEndian::read_u16(&image[2..4]), ANONYMOUS_NODE_ID);
        assert_eq!(LittleEndian::read_u16(&image[4..6]), ANONYMOUS_NODE_ID);
        let parsed = WireFrame::parse(&image).unwrap();
        assert_eq!(parsed.source_node_id, None);
        assert_eq!(parsed.destination_node_id, None);
    }
}
