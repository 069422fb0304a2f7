use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use msg_gateway::config::DedupConfig;
use msg_gateway::dedup::{msg_fingerprint, DedupEngine};
use msg_gateway::fast_store::MemoryFastStore;
use msg_gateway::types::{
    Channel, ChannelAddress, ChannelType, ChannelUuid, ConfigMap, IncomingMsg, MsgUuid,
};
use msg_gateway::urns::Urn;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn channel() -> Channel {
    Channel {
        id: 1,
        uuid: ChannelUuid(Uuid::new_v4()),
        org_id: 1,
        channel_type: ChannelType::new("TG"),
        name: None,
        schemes: vec!["telegram".to_string()],
        address: ChannelAddress::new("bot123"),
        country: None,
        role: "SR".to_string(),
        config: ConfigMap::default(),
        org_config: ConfigMap::default(),
        org_is_anon: false,
    }
}

fn engine() -> (DedupEngine, Arc<MemoryFastStore>) {
    let store = Arc::new(MemoryFastStore::new());
    (DedupEngine::new(store.clone(), DedupConfig::default()), store)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn msg(channel: &Channel, text: &str, external_id: Option<&str>) -> IncomingMsg {
    IncomingMsg::new(channel, Urn::parse("telegram:12345").unwrap(), text, external_id)
}

#[tokio::test]
async fn test_same_text_within_window_is_duplicate() {
    let (engine, _) = engine();
    let channel = channel();
    let original = msg(&channel, "hello", Some("ext-1"));
    engine.mark_seen_at(at(1_000), &original).await.unwrap();

    let retry = msg(&channel, "hello", Some("ext-1"));
    let found = engine.check_incoming_at(at(1_001), &retry).await.unwrap();
    assert_eq!(found, Some(original.uuid));
}

#[tokio::test]
async fn test_previous_window_is_consulted() {
    let (engine, _) = engine();
    let channel = channel();
    let original = msg(&channel, "hello", None);
    engine.mark_seen_at(at(1_001), &original).await.unwrap();

    // next window, the original sits in the previous bucket
    let retry = msg(&channel, "hello", None);
    assert_eq!(
        engine.check_incoming_at(at(1_002), &retry).await.unwrap(),
        Some(original.uuid)
    );
    // two windows on, it is no longer consulted
    assert_eq!(engine.check_incoming_at(at(1_004), &retry).await.unwrap(), None);
}

#[tokio::test]
async fn test_different_text_is_not_duplicate() {
    let (engine, _) = engine();
    let channel = channel();
    engine
        .mark_seen_at(at(1_000), &msg(&channel, "hello", None))
        .await
        .unwrap();

    let other = msg(&channel, "goodbye", None);
    assert_eq!(engine.check_incoming_at(at(1_000), &other).await.unwrap(), None);

    let prefix = msg(&channel, "hell", None);
    assert_eq!(engine.check_incoming_at(at(1_000), &prefix).await.unwrap(), None);
}

#[tokio::test]
async fn test_other_channel_is_not_duplicate() {
    let (engine, _) = engine();
    let first = channel();
    let second = channel();
    engine
        .mark_seen_at(at(1_000), &msg(&first, "hello", None))
        .await
        .unwrap();

    let elsewhere = msg(&second, "hello", None);
    assert_eq!(engine.check_incoming_at(at(1_000), &elsewhere).await.unwrap(), None);
}

#[tokio::test]
async fn test_media_retry_matches_on_external_id() {
    let (engine, _) = engine();
    let channel = channel();
    let original = msg(&channel, "caption", Some("media-77")).with_attachment("https://cdn/a.jpg", Some("image/jpeg"));
    engine.mark_seen_at(at(1_000), &original).await.unwrap();

    let retry = msg(&channel, "", Some("media-77")).with_attachment("https://cdn/a.jpg", Some("image/jpeg"));
    assert_eq!(
        engine.check_incoming_at(at(1_000), &retry).await.unwrap(),
        Some(original.uuid)
    );

    // without attachments the external id alone is not trusted
    let text_only = msg(&channel, "", Some("media-77"));
    assert_eq!(engine.check_incoming_at(at(1_000), &text_only).await.unwrap(), None);
}

#[tokio::test]
async fn test_pipe_in_text_is_not_read_as_external_id() {
    let (engine, _) = engine();
    let channel = channel();
    engine
        .mark_seen_at(at(1_000), &msg(&channel, "a|b", None))
        .await
        .unwrap();

    let media = msg(&channel, "", Some("b")).with_attachment("https://cdn/b.jpg", Some("image/jpeg"));
    assert_eq!(engine.check_incoming_at(at(1_000), &media).await.unwrap(), None);

    let same = msg(&channel, "a|b", Some("ext-9"));
    assert!(engine.check_incoming_at(at(1_000), &same).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fingerprint_expires_with_bucket() {
    let (engine, store) = engine();
    let channel = channel();
    let original = msg(&channel, "hello", None);
    engine.mark_seen_at(at(1_000), &original).await.unwrap();
    assert_eq!(store.live_buckets(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let retry = msg(&channel, "hello", None);
    assert_eq!(engine.check_incoming_at(at(1_000), &retry).await.unwrap(), None);
    assert_eq!(store.live_buckets(), 0);
}

#[tokio::test]
async fn test_clear_seen_forgets_fingerprint() {
    let (engine, _) = engine();
    let channel = channel();
    let original = msg(&channel, "hello", None);
    engine.mark_seen_at(at(1_000), &original).await.unwrap();

    engine
        .clear_seen_at(at(1_001), &channel.uuid, &original.urn.identity())
        .await
        .unwrap();
    assert_eq!(engine.check_incoming_at(at(1_001), &original).await.unwrap(), None);
}

#[tokio::test]
async fn test_external_id_seen_for_two_days() {
    let (engine, _) = engine();
    let channel = channel();
    let msg_uuid = MsgUuid::new();
    let noon = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();

    assert_eq!(
        engine.check_external_id_at(noon, &channel.uuid, "wamid.1").await.unwrap(),
        None
    );
    engine
        .write_external_id_seen_at(noon, &channel.uuid, "wamid.1", msg_uuid)
        .await
        .unwrap();

    assert_eq!(
        engine.check_external_id_at(noon, &channel.uuid, "wamid.1").await.unwrap(),
        Some(msg_uuid)
    );
    let next_day = noon + ChronoDuration::days(1);
    assert_eq!(
        engine.check_external_id_at(next_day, &channel.uuid, "wamid.1").await.unwrap(),
        Some(msg_uuid)
    );
    let day_after = noon + ChronoDuration::days(2);
    assert_eq!(
        engine.check_external_id_at(day_after, &channel.uuid, "wamid.1").await.unwrap(),
        None
    );
    assert_eq!(
        engine.check_external_id_at(noon, &ChannelUuid(Uuid::new_v4()), "wamid.1").await.unwrap(),
        None
    );
}

#[test]
fn test_msg_fingerprint_format() {
    let uuid = ChannelUuid(Uuid::nil());
    assert_eq!(
        msg_fingerprint(&uuid, "tel:+12065551212"),
        "00000000-0000-0000-0000-000000000000|tel:+12065551212"
    );
}
