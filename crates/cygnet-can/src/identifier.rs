//! 29-bit CAN identifier layout
//!
//! Message: `priority(3) | 0 | anonymous(1) | 00 | subject_id(13) | 00 | source_node_id(7)`
//!
//! Service: `priority(3) | 1 | request-not-response(1) | 0 | service_id(9) | destination(7) |
//! source(7)`
//!
//! Frames whose reserved bits are nonzero are not Cyphal frames and are dropped without
//! complaint; the bus may be shared with other protocols.

use cygnet_core::crc::TransferCrc16;
use cygnet_core::{DataSpecifier, Priority, ServiceRole};

use crate::MAX_NODE_ID;

const SERVICE_NOT_MESSAGE_BIT: u32 = 1 << 25;
const ANONYMOUS_BIT: u32 = 1 << 24;
const REQUEST_NOT_RESPONSE_BIT: u32 = 1 << 24;
const SERVICE_RESERVED_BIT: u32 = 1 << 23;
const MESSAGE_RESERVED_MASK: u32 = (0b11 << 22) | (0b11 << 7);

const SUBJECT_ID_MASK: u32 = (1 << 13) - 1;
const SERVICE_ID_MASK: u32 = (1 << 9) - 1;
const NODE_ID_MASK: u32 = MAX_NODE_ID as u32;

/// Pseudo node-ID bits available to anonymous senders
const PSEUDO_ID_MASK: u16 = (1 << 5) - 1;

/// A parsed (or to-be-compiled) Cyphal/CAN identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanId {
    Message {
        priority: Priority,
        subject_id: u16,
        /// `None` = anonymous; the wire carries a payload-derived pseudo-ID instead
        source_node_id: Option<u8>,
    },
    Service {
        priority: Priority,
        service_id: u16,
        request_not_response: bool,
        destination_node_id: u8,
        source_node_id: u8,
    },
}

impl CanId {
    /// Compile the 29-bit identifier
    ///
    /// Anonymous messages derive a pseudo source-ID from the first payload fragment (the five
    /// least significant bits of its CRC) to reduce identifier collisions between concurrent
    /// anonymous senders.
    #[must_use]
    pub fn compile(&self, first_fragment: &[u8]) -> u32 {
        match *self {
            CanId::Message {
                priority,
                subject_id,
                source_node_id,
            } => {
                let (source, anonymous) = match source_node_id {
                    Some(id) => (id as u32, 0),
                    None => (
                        (TransferCrc16::of(first_fragment) & PSEUDO_ID_MASK) as u32,
                        ANONYMOUS_BIT,
                    ),
                };
                (u8::from(priority) as u32) << 26
                    | anonymous
                    | (subject_id as u32 & SUBJECT_ID_MASK) << 9
                    | source
            }
            CanId::Service {
                priority,
                service_id,
                request_not_response,
                destination_node_id,
                source_node_id,
            } => {
                (u8::from(priority) as u32) << 26
                    | SERVICE_NOT_MESSAGE_BIT
                    | if request_not_response {
                        REQUEST_NOT_RESPONSE_BIT
                    } else {
                        0
                    }
                    | (service_id as u32 & SERVICE_ID_MASK) << 14
                    | (destination_node_id as u32 & NODE_ID_MASK) << 7
                    | (source_node_id as u32 & NODE_ID_MASK)
            }
        }
    }

    /// Parse a 29-bit identifier; `None` means the frame is not a Cyphal frame
    #[must_use]
    pub fn parse(identifier: u32) -> Option<CanId> {
        let priority = Priority::try_from(((identifier >> 26) & 0b111) as u8)
            .expect("3-bit priority is always valid");
        if identifier & SERVICE_NOT_MESSAGE_BIT == 0 {
            if identifier & MESSAGE_RESERVED_MASK != 0 {
                return None;
            }
            let anonymous = identifier & ANONYMOUS_BIT != 0;
            Some(CanId::Message {
                priority,
                subject_id: ((identifier >> 9) & SUBJECT_ID_MASK) as u16,
                source_node_id: (!anonymous).then_some((identifier & NODE_ID_MASK) as u8),
            })
        } else {
            if identifier & SERVICE_RESERVED_BIT != 0 {
                return None;
            }
            Some(CanId::Service {
                priority,
                service_id: ((identifier >> 14) & SERVICE_ID_MASK) as u16,
                request_not_response: identifier & REQUEST_NOT_RESPONSE_BIT != 0,
                destination_node_id: ((identifier >> 7) & NODE_ID_MASK) as u8,
                source_node_id: (identifier & NODE_ID_MASK) as u8,
            })
        }
    }

    #[inline]
    #[must_use]
    pub fn priority(&self) -> Priority {
        match *self {
            CanId::Message { priority, .. } | CanId::Service { priority, .. } => priority,
        }
    }

    #[inline]
    #[must_use]
    pub fn source_node_id(&self) -> Option<u8> {
        match *self {
            CanId::Message { source_node_id, .. } => source_node_id,
            CanId::Service { source_node_id, .. } => Some(source_node_id),
        }
    }

    #[inline]
    #[must_use]
    pub fn destination_node_id(&self) -> Option<u8> {
        match *self {
            CanId::Message { .. } => None,
            CanId::Service {
                destination_node_id,
                ..
            } => Some(destination_node_id),
        }
    }

    #[must_use]
    pub fn data_specifier(&self) -> DataSpecifier {
        match *self {
            CanId::Message { subject_id, .. } => DataSpecifier::Message { subject_id },
            CanId::Service {
                service_id,
                request_not_response,
                ..
            } => DataSpecifier::Service {
                service_id,
                role: if request_not_response {
                    ServiceRole::Request
                } else {
                    ServiceRole::Response
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let id = CanId::Message {
            priority: Priority::Immediate,
            subject_id: 2345,
            source_node_id: Some(5),
        };
        let compiled = id.compile(b"");
        assert_eq!(compiled, (1 << 26) | (2345 << 9) | 5);
        assert_eq!(CanId::parse(compiled), Some(id));
    }

    #[test]
    fn test_anonymous_message() {
        let id = CanId::Message {
            priority: Priority::Nominal,
            subject_id: 100,
            source_node_id: None,
        };
        let compiled = id.compile(b"abcdef");
        assert_ne!(compiled & ANONYMOUS_BIT, 0);
        let pseudo = compiled & NODE_ID_MASK;
        assert_eq!(pseudo, (TransferCrc16::of(b"abcdef") & 0x1F) as u32);
        // The pseudo-ID does not round-trip into a source node-ID
        assert_eq!(
            CanId::parse(compiled),
            Some(CanId::Message {
                priority: Priority::Nominal,
                subject_id: 100,
                source_node_id: None,
            })
        );
    }

    #[test]
    fn test_service_round_trip() {
        let id = CanId::Service {
            priority: Priority::Slow,
            service_id: 400,
            request_not_response: true,
            destination_node_id: 13,
            source_node_id: 42,
        };
        let compiled = id.compile(b"");
        assert_eq!(CanId::parse(compiled), Some(id));

        let response = CanId::Service {
            priority: Priority::Slow,
            service_id: 400,
            request_not_response: false,
            destination_node_id: 13,
            source_node_id: 42,
        };
        assert_eq!(CanId::parse(response.compile(b"")), Some(response));
    }

    #[test]
    fn test_reserved_bits_reject() {
        let id = CanId::Message {
            priority: Priority::Nominal,
            subject_id: 10,
            source_node_id: Some(1),
        };
        let compiled = id.compile(b"");
        assert_eq!(CanId::parse(compiled | (1 << 23)), None);
        assert_eq!(CanId::parse(compiled | (1 << 7)), None);

        let service = CanId::Service {
            priority: Priority::Nominal,
            service_id: 1,
            request_not_response: false,
            destination_node_id: 2,
            source_node_id: 3,
        };
        assert_eq!(CanId::parse(service.compile(b"") | (1 << 23)), None);
    }
}
