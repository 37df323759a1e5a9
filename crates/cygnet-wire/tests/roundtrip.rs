//! Randomized serialize → reassemble round-trips
//!
//! For every payload and MTU, feeding the serializer's output back through the reassembler must
//! reproduce the original transfer byte for byte, regardless of delivery order.

use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use cygnet_core::{DataSpecifier, Priority, Timestamp};
use cygnet_wire::{TransferReassembler, WireFrame, serialize_transfer};

const TIMEOUT: Duration = Duration::from_secs(2);

fn frame_factory(
    transfer_id: u64,
) -> impl Fn(u32, bool, Vec<u8>) -> WireFrame {
    move |index, end_of_transfer, payload| WireFrame {
        priority: Priority::Nominal,
        source_node_id: Some(77),
        destination_node_id: None,
        data_specifier: DataSpecifier::Message { subject_id: 1000 },
        transfer_id,
        index,
        end_of_transfer,
        user_data: 0,
        payload,
    }
}

#[test]
fn test_random_payloads_round_trip_in_order() {
    let mut rng = rand::rng();
    let mut reassembler = TransferReassembler::new(77, 1 << 20);
    for transfer_id in 0..200u64 {
        let payload_len = rng.random_range(0..2000);
        let payload: Vec<u8> = (0..payload_len).map(|_| rng.random()).collect();
        // Random fragmentation of the application payload
        let mut fragments: Vec<Vec<u8>> = Vec::new();
        let mut rest = payload.as_slice();
        while !rest.is_empty() {
            let take = rng.random_range(1..=rest.len());
            fragments.push(rest[..take].to_vec());
            rest = &rest[take..];
        }

        let mtu = rng.random_range(16..=600);
        let frames = serialize_transfer(&fragments, mtu, frame_factory(transfer_id));

        let mut delivered = None;
        for frame in frames {
            // The header must survive its own wire round-trip too
            let frame = WireFrame::parse(&frame.compile()).expect("the frame must parse back");
            delivered = reassembler
                .process_frame(Timestamp::new(0, transfer_id), frame, TIMEOUT, &mut |e| {
                    panic!("unexpected reassembly error: {e:?}")
                })
                .or(delivered);
        }
        let delivered = delivered.expect("the transfer must complete");
        assert_eq!(delivered.transfer_id, transfer_id);
        assert_eq!(
            cygnet_core::transfer::concatenate(&delivered.fragmented_payload),
            payload
        );
    }
}

#[test]
fn test_random_payloads_round_trip_shuffled() {
    let mut rng = rand::rng();
    for transfer_id in 0..100u64 {
        // A fresh reassembler per iteration: shuffled delivery spans one transfer at a time
        let mut reassembler = TransferReassembler::new(77, 1 << 20);
        let payload_len = rng.random_range(100..3000);
        let payload: Vec<u8> = (0..payload_len).map(|_| rng.random()).collect();
        let mut frames = serialize_transfer(&[payload.clone()], 128, frame_factory(transfer_id));
        frames.shuffle(&mut rng);

        let mut delivered = None;
        for frame in frames {
            delivered = reassembler
                .process_frame(Timestamp::new(0, 1), frame, TIMEOUT, &mut |e| {
                    panic!("unexpected reassembly error: {e:?}")
                })
                .or(delivered);
        }
        let delivered = delivered.expect("the transfer must complete");
        assert_eq!(
            cygnet_core::transfer::concatenate(&delivered.fragmented_payload),
            payload
        );
    }
}
