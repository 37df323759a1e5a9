//! Consistent Overhead Byte Stuffing
//!
//! Byte-stream links delimit frames with zero bytes; COBS guarantees that the encoded frame body
//! contains none. Worst-case overhead is one byte per 254 bytes of payload.

/// Longest run a single code byte can describe
const MAX_BLOCK: u8 = 0xFF;

/// Worst-case encoded size for a given payload size, excluding delimiters
#[inline]
#[must_use]
pub fn max_encoded_size(payload_size: usize) -> usize {
    payload_size + payload_size.div_ceil(254).max(1)
}

/// Encode; the output contains no zero bytes
#[must_use]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoded_size(data.len()));
    let mut rest = data;
    loop {
        // Each group is up to 254 leading non-zero bytes, prefixed with its length plus one
        let run = rest.iter().take(254).take_while(|&&byte| byte != 0).count();
        out.push(run as u8 + 1);
        out.extend_from_slice(&rest[..run]);
        rest = &rest[run..];
        if run == 254 {
            // A full group implies no zero; continue with the remainder, if any
            if rest.is_empty() {
                break;
            }
        } else if rest.is_empty() {
            break;
        } else {
            // Consume the zero the group ended on
            rest = &rest[1..];
        }
    }
    out
}

/// Decode; `None` if the input is not a valid COBS image (contains zeros or truncated blocks)
#[must_use]
pub fn decode(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        if code == 0 {
            return None;
        }
        i += 1;
        let block = data.get(i..i + code as usize - 1)?;
        if block.contains(&0) {
            return None;
        }
        out.extend_from_slice(block);
        i += block.len();
        if code != MAX_BLOCK && i < data.len() {
            out.push(0);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(data: &[u8]) -> Vec<u8> {
        let encoded = encode(data);
        assert!(!encoded.contains(&0), "encoded image contains a zero byte");
        decode(&encoded).unwrap()
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(encode(&[]), vec![0x01]);
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(encode(&[0x00, 0x00]), vec![0x01, 0x01, 0x01]);
        assert_eq!(
            encode(&[0x11, 0x22, 0x00, 0x33]),
            vec![0x03, 0x11, 0x22, 0x02, 0x33]
        );
        assert_eq!(
            encode(&[0x11, 0x00, 0x00, 0x00]),
            vec![0x02, 0x11, 0x01, 0x01, 0x01]
        );
        let long: Vec<u8> = (1..=254).map(|i| i as u8).collect();
        let mut expected = vec![0xFF];
        expected.extend_from_slice(&long);
        assert_eq!(encode(&long), expected);
    }

    #[test]
    fn test_round_trips() {
        for data in [
            &b""[..],
            &b"\x00"[..],
            &b"hello"[..],
            &b"he\x00llo\x00"[..],
        ] {
            assert_eq!(round_trip(data), data);
        }
        // Lengths around the 254-byte block boundary
        for length in [253usize, 254, 255, 508, 509, 1000] {
            let data: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
            assert_eq!(round_trip(&data), data);
        }
    }

    #[test]
    fn test_decode_rejects_invalid() {
        assert_eq!(decode(&[]), Some(vec![]));
        assert_eq!(decode(&[0x00]), None); // Zero inside the image
        assert_eq!(decode(&[0x03, 0x11]), None); // Truncated block
        assert_eq!(decode(&[0x02, 0x00]), None);
    }
}
