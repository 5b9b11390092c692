//! Frozen-model properties that depend on the runtime context: hash key
//! lengths, canonical scalars, and structural identity.

use chrono::TimeZone;
use miniagents::{Frozen, FrozenValue, Message, MiniAgents};
use serde_json::json;
use uuid::Uuid;

#[test]
fn hash_keys_are_truncated_outside_any_context() {
    let record = Frozen::from_json("Sample", json!({"x": 1})).unwrap();
    assert_eq!(record.hash_key().len(), 40);
}

#[tokio::test]
async fn longer_hash_keys_apply_within_the_configured_context() {
    let record = Frozen::from_json("Sample", json!({"x": 1})).unwrap();
    let short = record.hash_key();

    let runtime = MiniAgents::builder().longer_hash_keys(true).build();
    let long = runtime
        .run(async { Ok(record.hash_key()) })
        .await
        .unwrap();

    assert_eq!(long.len(), 64);
    assert!(long.starts_with(&short));
}

#[test]
fn structural_equality_ignores_field_order_and_identity() {
    let a = Message::text_with("same", json!({"role": "user", "rank": 3})).unwrap();
    let b = Message::text_with("same", json!({"rank": 3, "role": "user"})).unwrap();

    assert_eq!(a, b);
    assert_eq!(a.hash_key(), b.hash_key());
    assert_eq!(a.serialized_json(), b.serialized_json());
}

#[test]
fn canonical_scalars_serialize_deterministically() {
    let when = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap();
    let id = Uuid::nil();

    let build = || {
        Message::builder()
            .content("scalar soup")
            .field("id", id)
            .field("when", when)
            .field("blob", FrozenValue::bytes(vec![0xde, 0xad, 0xbe, 0xef]))
            .field("took", chrono::TimeDelta::milliseconds(1500))
            .build()
            .unwrap()
    };

    let first = build();
    let second = build();
    assert_eq!(first.hash_key(), second.hash_key());

    let serialized = first.serialized_json();
    assert!(serialized.contains("00000000-0000-0000-0000-000000000000"));
    assert!(serialized.contains("2026-08-01T09:30:00+00:00"));
    assert!(serialized.contains("3q2+7w=="));
    assert!(serialized.contains("1.5"));
}

#[test]
fn nested_json_freezes_into_records_and_tuples() {
    let message = Message::builder()
        .content("nested")
        .fields(json!({
            "profile": {"name": "ada", "tags": ["math", "engines"]},
            "scores": [1, 2, 3],
        }))
        .build()
        .unwrap();

    match message.get("profile") {
        Some(FrozenValue::Record(profile)) => {
            assert_eq!(profile.get_str("name"), Some("ada"));
            assert!(matches!(profile.get("tags"), Some(FrozenValue::Tuple(_))));
        }
        other => panic!("expected a nested record, got {other:?}"),
    }
    match message.get("scores") {
        Some(FrozenValue::Tuple(scores)) => assert_eq!(scores.len(), 3),
        other => panic!("expected a tuple, got {other:?}"),
    }
}

#[test]
fn tuple_of_messages_externalizes_to_hash_list() {
    let one = Message::text("one");
    let two = Message::text("two");
    let digest = Message::builder()
        .content("digest")
        .field(
            "sources",
            FrozenValue::tuple(vec![one.clone(), two.clone()]),
        )
        .build()
        .unwrap();

    let serialized = digest.serialized_json();
    assert!(serialized.contains("sources__hash_keys"));
    assert!(serialized.contains(&one.hash_key()));
    assert!(serialized.contains(&two.hash_key()));

    let subs = digest.sub_messages();
    assert_eq!(subs.len(), 2);
}

#[test]
fn full_json_and_serialized_json_differ_only_by_externalization() {
    let plain = Message::text("no nesting here");
    assert_eq!(plain.full_json(), plain.serialized_json());

    let parent = Message::builder()
        .content("outer")
        .field("inner", Message::text("nested"))
        .build()
        .unwrap();
    assert_ne!(parent.full_json(), parent.serialized_json());
    assert!(parent.full_json().contains("nested"));
}
