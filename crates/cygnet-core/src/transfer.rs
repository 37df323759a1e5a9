use crate::priority::Priority;
use crate::time::Timestamp;

/// Transfer payload as an ordered sequence of byte fragments
///
/// A fragmented payload is semantically equal to the concatenation of its fragments. Reassemblers
/// produce one fragment per received frame; serializers accept any fragmentation the application
/// finds convenient.
pub type FragmentedPayload = Vec<Vec<u8>>;

/// Total number of payload bytes across all fragments
#[inline]
#[must_use]
pub fn payload_length(fragments: &[Vec<u8>]) -> usize {
    fragments.iter().map(Vec::len).sum()
}

/// Concatenate the fragments into one contiguous buffer
#[must_use]
pub fn concatenate(fragments: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload_length(fragments));
    for fragment in fragments {
        out.extend_from_slice(fragment);
    }
    out
}

/// Content-wise fragmented payload equality: differently fragmented but identical byte sequences
/// compare equal
#[must_use]
pub fn payload_equals(a: &[Vec<u8>], b: &[Vec<u8>]) -> bool {
    if payload_length(a) != payload_length(b) {
        return false;
    }
    let flat_a = a.iter().flat_map(|f| f.iter());
    let flat_b = b.iter().flat_map(|f| f.iter());
    flat_a.eq(flat_b)
}

/// An outgoing transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub timestamp: Timestamp,
    pub priority: Priority,
    /// The full logical transfer-ID. Transports with a cyclic transfer-ID (CAN) reduce it modulo
    /// their own limit for the wire only.
    pub transfer_id: u64,
    pub fragmented_payload: FragmentedPayload,
}

/// A received transfer, annotated with its origin
#[derive(Clone, Debug)]
pub struct TransferFrom {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: u64,
    pub fragmented_payload: FragmentedPayload,
    /// `None` means the sender is anonymous.
    pub source_node_id: Option<u16>,
}

impl TransferFrom {
    #[inline]
    #[must_use]
    pub fn payload_length(&self) -> usize {
        payload_length(&self.fragmented_payload)
    }
}

impl PartialEq for TransferFrom {
    /// Payloads compare content-wise, ignoring fragmentation
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.priority == other.priority
            && self.transfer_id == other.transfer_id
            && self.source_node_id == other.source_node_id
            && payload_equals(&self.fragmented_payload, &other.fragmented_payload)
    }
}

impl Eq for TransferFrom {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_equality_ignores_fragmentation() {
        let a = vec![b"abc".to_vec(), b"def".to_vec()];
        let b = vec![b"abcd".to_vec(), b"".to_vec(), b"ef".to_vec()];
        let c = vec![b"abcdef".to_vec()];
        assert!(payload_equals(&a, &b));
        assert!(payload_equals(&a, &c));
        assert!(!payload_equals(&a, &[]));
        assert!(!payload_equals(&a, &[b"abcdeg".to_vec()]));
    }

    #[test]
    fn test_concatenate() {
        let fragments = vec![b"hello ".to_vec(), b"world".to_vec()];
        assert_eq!(concatenate(&fragments), b"hello world");
        assert_eq!(payload_length(&fragments), 11);
    }
}
