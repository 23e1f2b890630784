// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Integrity drills for the packet codec.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

use crate::wire::{decode_packet, decode_reply, encode_reply, WireError, CHECKSUM_LEN, HEADER_LEN};
use crate::{Btt, Delta, Envelope, Reply, Response};

fn runner(cases: u32) -> TestRunner {
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &[42; 32]);
    TestRunner::new_with_rng(
        PropConfig {
            cases,
            ..PropConfig::default()
        },
        rng,
    )
}

fn sample_reply() -> Reply {
    let mut delta = Delta::empty(Btt::new("trunk", 1, 0), Btt::new("trunk", 1, 4));
    let g = delta.graph("physical");
    g.nodes.insert("kobold".into(), true);
    g.node_val
        .entry("kobold".into())
        .or_default()
        .insert("hp".into(), Some(serde_json::json!(3)));
    g.graph_val.insert("weather".into(), None);
    g.character_rulebook = Some(None);
    Reply {
        id: 9,
        btt: Btt::new("trunk", 1, 4),
        response: Response::Delta(delta.clone()),
        delta: Some(delta),
    }
}

/// DRILL: deltas keep their null-means-absent entries through the wire.
#[test]
fn drill_delta_nulls_survive() {
    let reply = sample_reply();
    let (back, _) = decode_reply(&encode_reply(&reply).unwrap()).unwrap();
    let delta = back.delta.unwrap();
    assert_eq!(delta.graphs["physical"].graph_val.get("weather"), Some(&None));
    assert_eq!(delta.graphs["physical"].character_rulebook, Some(None));
    assert_eq!(back.response, reply.response);
}

/// DRILL: flipping any single bit of a packet is detected.
#[test]
fn drill_single_bit_flips_never_decode() {
    let bytes = encode_reply(&sample_reply()).unwrap();
    let mut runner = runner(256);
    runner
        .run(&(0..bytes.len(), 0u8..8), |(at, bit)| {
            let mut bad = bytes.clone();
            bad[at] ^= 1 << bit;
            prop_assert!(decode_reply(&bad).is_err());
            Ok(())
        })
        .unwrap();
}

/// DRILL: arbitrary input yields an error or a value, never a panic.
#[test]
fn drill_decoder_fuzzer() {
    let mut runner = runner(1000);
    runner
        .run(&proptest::collection::vec(any::<u8>(), 0..1024), |data| {
            let _ = decode_packet::<Envelope>(&data);
            Ok(())
        })
        .unwrap();
}

/// DRILL: a header that promises more bytes than arrived is a short buffer.
#[test]
fn drill_truncated_payload_reports_expected_length() {
    let bytes = encode_reply(&sample_reply()).unwrap();
    let cut = &bytes[..HEADER_LEN + CHECKSUM_LEN + 1];
    assert_eq!(
        decode_reply(cut),
        Err(WireError::ShortBuffer {
            need: bytes.len(),
            have: cut.len(),
        })
    );
}
