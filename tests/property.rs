//! Property-based tests for the frame decoder, masking and compression.
//!
//! These tests use proptest to fuzz the decoding logic and find edge cases.

use bytes::BytesMut;
use proptest::prelude::*;
use rsws_engine::config::Limits;
use rsws_engine::protocol::mask::{apply_mask, apply_mask_at, apply_mask_fast};
use rsws_engine::protocol::{Frame, FrameDecoder, OpCode};
use rsws_engine::{Error, Role};

fn data_opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![
        Just(OpCode::Text),
        Just(OpCode::Binary),
        Just(OpCode::Continuation),
    ]
}

fn control_opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![Just(OpCode::Close), Just(OpCode::Ping), Just(OpCode::Pong),]
}

/// Feed `wire` in chunks of `chunk` bytes and collect every decoded frame.
fn decode_chunked(decoder: &mut FrameDecoder, wire: &[u8], chunk: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    for piece in wire.chunks(chunk.max(1)) {
        decoder.feed(piece);
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }
    frames
}

/// Length fencepost sizes, each checked through a masked encode and a
/// server-side decode.
#[test]
fn test_masked_round_trip_at_length_boundaries() {
    const SIZES: [usize; 6] = [0, 1, 125, 126, 65_535, 65_536];
    let opcodes = [
        OpCode::Text,
        OpCode::Binary,
        OpCode::Ping,
        OpCode::Pong,
        OpCode::Close,
    ];
    let limits = Limits::default();

    for opcode in opcodes {
        for size in SIZES {
            let payload = match opcode {
                _ if opcode.is_control() && size > 125 => continue,
                // A close body is either empty or starts with a status code.
                OpCode::Close if size == 1 => continue,
                OpCode::Close if size > 0 => {
                    let mut body = 1000u16.to_be_bytes().to_vec();
                    body.resize(size, b'r');
                    body
                }
                OpCode::Text => vec![b't'; size],
                _ => (0..size).map(|i| (i % 251) as u8).collect(),
            };
            let frame = Frame::new(true, opcode, payload);
            let wire = frame.encode(Some([0x9c, 0x01, 0xe4, 0x7d]));
            assert_eq!(wire.len(), frame.wire_size(true), "{opcode} x {size}");

            let length_marker = match size {
                0..=125 => size as u8,
                126..=65_535 => 126,
                _ => 127,
            };
            assert_eq!(wire[1], 0x80 | length_marker, "{opcode} x {size}");

            let mut decoder = FrameDecoder::new(Role::Server, &limits);
            decoder.feed(&wire);
            let decoded = decoder.next_frame().unwrap().expect("one whole frame");
            assert_eq!(decoded.opcode, opcode);
            assert!(decoded.fin);
            assert_eq!(decoded.payload(), frame.payload(), "{opcode} x {size}");
            assert_eq!(decoder.next_frame(), Ok(None));
        }
    }
}

proptest! {
    // =========================================================================
    // Decoding does not depend on how the input is split
    // =========================================================================
    #[test]
    fn test_chunking_is_invisible(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..70_000), 1..4),
        opcode in data_opcode_strategy(),
        chunk in prop_oneof![Just(1usize), Just(2), Just(7), Just(usize::MAX)],
    ) {
        let mut wire = BytesMut::new();
        let sent: Vec<Frame> = payloads
            .iter()
            .map(|p| Frame::new(true, opcode, p.clone()))
            .collect();
        for frame in &sent {
            frame.encode_into(&mut wire, None);
        }

        let chunk = chunk.min(wire.len());
        let mut decoder = FrameDecoder::new(Role::Client, &Limits::default());
        let got = decode_chunked(&mut decoder, &wire, chunk);
        prop_assert_eq!(got, sent);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_control_frames_decode_in_single_bytes(
        opcode in control_opcode_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..=125),
    ) {
        let frame = Frame::new(true, opcode, payload);
        let wire = frame.encode(None);
        let mut decoder = FrameDecoder::new(Role::Client, &Limits::default());
        let got = decode_chunked(&mut decoder, &wire, 1);
        prop_assert_eq!(got, vec![frame]);
    }

    // =========================================================================
    // A server-side decoder unmasks whatever key the client picked
    // =========================================================================
    #[test]
    fn test_masked_frames_unmask(
        payload in prop::collection::vec(any::<u8>(), 0..2000),
        mask in any::<[u8; 4]>(),
        chunk in 1usize..64,
    ) {
        let frame = Frame::binary(payload);
        let wire = frame.encode(Some(mask));
        prop_assert_eq!(wire.len(), frame.wire_size(true));

        let mut decoder = FrameDecoder::new(Role::Server, &Limits::default());
        let got = decode_chunked(&mut decoder, &wire, chunk);
        prop_assert_eq!(got, vec![frame]);
    }

    #[test]
    fn test_mask_variants_agree(
        data in prop::collection::vec(any::<u8>(), 0..300),
        mask in any::<[u8; 4]>(),
        split in 0usize..300,
    ) {
        let mut simple = data.clone();
        apply_mask(&mut simple, mask);

        let mut fast = data.clone();
        apply_mask_fast(&mut fast, mask);
        prop_assert_eq!(&fast, &simple);

        // Masking in two pieces with offsets matches masking in one.
        let split = split.min(data.len());
        let mut pieces = data.clone();
        let (head, tail) = pieces.split_at_mut(split);
        apply_mask_at(head, mask, 0);
        apply_mask_at(tail, mask, split);
        prop_assert_eq!(&pieces, &simple);

        apply_mask(&mut simple, mask);
        prop_assert_eq!(simple, data);
    }

    // =========================================================================
    // Lengths with the top bit set are never accepted
    // =========================================================================
    #[test]
    fn test_high_bit_length_rejected(low in any::<u64>()) {
        let len = low | (1 << 63);
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&len.to_be_bytes());

        let mut decoder = FrameDecoder::new(Role::Client, &Limits::default());
        decoder.feed(&wire);
        prop_assert_eq!(decoder.next_frame(), Err(Error::InvalidPayloadLength(len)));
    }

    #[test]
    fn test_oversized_frame_rejected(extra in 1u64..1_000_000) {
        let limits = Limits::default().with_max_frame_size(1024);
        let len = 1024 + extra;
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&len.to_be_bytes());

        let mut decoder = FrameDecoder::new(Role::Client, &limits);
        decoder.feed(&wire);
        let rejected = matches!(decoder.next_frame(), Err(Error::FrameTooLarge { .. }));
        prop_assert!(rejected);
    }

    #[test]
    fn test_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut decoder = FrameDecoder::new(Role::Client, &Limits::default());
        decoder.feed(&data);
        while let Ok(Some(_)) = decoder.next_frame() {}
    }
}

#[cfg(feature = "compression")]
mod deflate {
    use proptest::prelude::*;
    use rsws_engine::DeflateConfig;
    use rsws_engine::extensions::deflate::PerMessageDeflate;
    use rsws_engine::extensions::{CompressionHandler, ExtensionOffer};

    fn negotiated(response: &str) -> PerMessageDeflate {
        let mut handler = PerMessageDeflate::new(DeflateConfig::default());
        handler
            .negotiate(&ExtensionOffer::parse(response).unwrap())
            .unwrap();
        handler
    }

    proptest! {
        #[test]
        fn test_inflate_restores_deflated_messages(
            messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..5000), 1..5),
            no_context_takeover in any::<bool>(),
        ) {
            let response = if no_context_takeover {
                "permessage-deflate; client_no_context_takeover; server_no_context_takeover"
            } else {
                "permessage-deflate"
            };
            let mut sender = negotiated(response);
            let mut receiver = negotiated(response);

            for message in &messages {
                let compressed = sender.compress(message).unwrap();
                prop_assert!(!compressed.ends_with(&[0x00, 0x00, 0xff, 0xff]));
                let restored = receiver.decompress(&compressed, usize::MAX).unwrap();
                prop_assert_eq!(&restored[..], &message[..]);
            }
        }

        #[test]
        fn test_inflate_respects_size_limit(size in 2048usize..20_000) {
            let mut sender = negotiated("permessage-deflate");
            let mut receiver = negotiated("permessage-deflate");
            let compressed = sender.compress(&vec![b'a'; size]).unwrap();
            let too_large = matches!(
                receiver.decompress(&compressed, size - 1),
                Err(rsws_engine::Error::MessageTooLarge { .. })
            );
            prop_assert!(too_large);
        }
    }
}
