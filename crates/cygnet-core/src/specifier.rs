use crate::error::{Result, TransportError};

/// Maximum subject-ID on any transport (13 bits)
pub const SUBJECT_ID_MASK: u16 = (1 << 13) - 1;

/// Maximum service-ID (9 bits)
///
/// The high-overhead frame header reserves 14 bits for the service-ID, but only 9-bit values are
/// valid; frames with a larger service-ID are dropped on reception.
pub const SERVICE_ID_MASK: u16 = (1 << 9) - 1;

/// Node-ID value that represents an anonymous node on the wire
pub const ANONYMOUS_NODE_ID: u16 = 0xFFFF;

/// Whether a service transfer carries a request or a response
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceRole {
    Request,
    Response,
}

/// Identifies a logical channel: a subject, or a service paired with a role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSpecifier {
    Message { subject_id: u16 },
    Service { service_id: u16, role: ServiceRole },
}

impl DataSpecifier {
    pub fn message(subject_id: u16) -> Result<Self> {
        if subject_id > SUBJECT_ID_MASK {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "subject-ID {subject_id} exceeds the maximum of {SUBJECT_ID_MASK}"
            )));
        }
        Ok(DataSpecifier::Message { subject_id })
    }

    pub fn service(service_id: u16, role: ServiceRole) -> Result<Self> {
        if service_id > SERVICE_ID_MASK {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "service-ID {service_id} exceeds the maximum of {SERVICE_ID_MASK}"
            )));
        }
        Ok(DataSpecifier::Service { service_id, role })
    }

    #[inline]
    #[must_use]
    pub fn is_service(&self) -> bool {
        matches!(self, DataSpecifier::Service { .. })
    }
}

/// Selects which transfers an input session accepts
///
/// `remote_node_id = Some(n)` is a selective session that only accepts transfers from node `n`;
/// `None` is a promiscuous session that accepts transfers from every source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub remote_node_id: Option<u16>,
}

impl InputSessionSpecifier {
    pub fn new(data_specifier: DataSpecifier, remote_node_id: Option<u16>) -> Self {
        Self {
            data_specifier,
            remote_node_id,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_promiscuous(&self) -> bool {
        self.remote_node_id.is_none()
    }
}

/// Selects where an output session sends
///
/// `remote_node_id = Some(n)` is unicast to node `n`; `None` is broadcast. Service transfers must
/// be unicast. Unicast message transfers are a non-standard extension that individual transports
/// may reject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub remote_node_id: Option<u16>,
}

impl OutputSessionSpecifier {
    pub fn new(data_specifier: DataSpecifier, remote_node_id: Option<u16>) -> Result<Self> {
        if data_specifier.is_service() && remote_node_id.is_none() {
            return Err(TransportError::UnsupportedSessionConfiguration(
                "service transfers shall be unicast".into(),
            ));
        }
        if !data_specifier.is_service() && remote_node_id.is_some() {
            tracing::warn!(
                "Unicast message transfers are an experimental protocol extension; \
                 individual transports may reject this session"
            );
        }
        Ok(Self {
            data_specifier,
            remote_node_id,
        })
    }

    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.remote_node_id.is_none()
    }
}

/// The amount of payload memory a receiver commits to a session
///
/// Reassembled payloads beyond the extent are implicitly truncated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PayloadMetadata {
    pub extent_bytes: u32,
}

impl PayloadMetadata {
    pub fn new(extent_bytes: u32) -> Self {
        Self { extent_bytes }
    }

    #[inline]
    #[must_use]
    pub fn extent(&self) -> usize {
        self.extent_bytes as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_specifier_limits() {
        assert!(DataSpecifier::message(8191).is_ok());
        assert!(DataSpecifier::message(8192).is_err());
        assert!(DataSpecifier::service(511, ServiceRole::Request).is_ok());
        assert!(DataSpecifier::service(512, ServiceRole::Response).is_err());
    }

    #[test]
    fn test_broadcast_service_rejected() {
        let ds = DataSpecifier::service(42, ServiceRole::Request).unwrap();
        let err = OutputSessionSpecifier::new(ds, None).unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnsupportedSessionConfiguration(_)
        ));
    }

    #[test]
    fn test_message_broadcast_and_unicast() {
        let ds = DataSpecifier::message(100).unwrap();
        assert!(OutputSessionSpecifier::new(ds, None).is_ok());
        // Experimental, but representable; transports decide whether to honor it
        assert!(OutputSessionSpecifier::new(ds, Some(7)).is_ok());
    }
}
