//! Property-based tests for the live and history codecs.
//!
//! Uses proptest to verify:
//! 1. Any valid inbound frame survives encode → decode unchanged.
//! 2. Arbitrary text never causes a panic in any decoder.
//! 3. Outbound frames keep their recipient, with `0` meaning broadcast.
//! 4. A history page never reports more records than the array holds.

use chrono::{DateTime, Utc};
use flagchat_proto::codec;
use flagchat_proto::frame::{InboundFrame, OutboundFrame};
use flagchat_proto::history;
use flagchat_proto::ids::UserId;
use proptest::prelude::*;

/// Strategy for generating non-zero user ids.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    (1u64..=u64::from(u32::MAX)).prop_map(UserId::new)
}

/// Strategy for timestamps between 2000 and 2100 at millisecond precision.
fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800_000i64..4_102_444_800_000i64)
        .prop_map(|ms| DateTime::from_timestamp_millis(ms).unwrap_or_default())
}

/// Non-blank message content.
fn arb_content() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ,.!?]{0,200}[a-zA-Z0-9]"
}

fn arb_inbound_frame() -> impl Strategy<Value = InboundFrame> {
    (
        proptest::option::of(any::<u64>()),
        arb_user_id(),
        proptest::option::of(arb_user_id()),
        proptest::option::of("[a-zA-Z ]{0,20}"),
        proptest::option::of("https://cdn\\.example/[a-z]{1,10}\\.png"),
        arb_content(),
        arb_timestamp(),
    )
        .prop_map(
            |(id, from, to, user_name, user_avatar, content, created_at)| InboundFrame {
                id,
                from,
                to,
                user_name,
                user_avatar,
                content,
                created_at,
            },
        )
}

proptest! {
    #[test]
    fn inbound_frame_round_trips(frame in arb_inbound_frame()) {
        let text = codec::encode_inbound(&frame).unwrap();
        let decoded = codec::decode_inbound(&text).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_inbound_never_panics(text in ".*") {
        let _ = codec::decode_inbound(&text);
    }

    #[test]
    fn decode_outbound_never_panics(text in ".*") {
        let _ = codec::decode_outbound(&text);
    }

    #[test]
    fn decode_page_never_panics(text in ".*") {
        let _ = history::decode_page(&text);
    }

    #[test]
    fn outbound_recipient_is_preserved(content in arb_content(), to in 0u64..1_000_000) {
        let frame = OutboundFrame::direct(content, UserId::new(to));
        let text = codec::encode_outbound(&frame).unwrap();
        let decoded = codec::decode_outbound(&text).unwrap();
        prop_assert_eq!(decoded.to.is_broadcast(), to == 0);
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn history_page_is_bounded_by_input(frames in prop::collection::vec(arb_inbound_frame(), 0..20)) {
        let records: Vec<serde_json::Value> = frames
            .iter()
            .enumerate()
            .map(|(i, f)| {
                serde_json::json!({
                    "id": i,
                    "from": f.from,
                    "user_name": f.user_name,
                    "content": f.content,
                    "created_at": f.created_at,
                })
            })
            .collect();
        let body = serde_json::Value::Array(records).to_string();
        let page = history::decode_page(&body).unwrap();
        prop_assert_eq!(page.records.len() + page.skipped, frames.len());
        prop_assert_eq!(page.skipped, 0);
    }
}
