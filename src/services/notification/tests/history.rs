mod common;

use common::{create_test_config, noon, Harness};
use notification_engine::ChannelKind;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_history_evicts_oldest_when_full() -> anyhow::Result<()> {
    let mut config = create_test_config();
    config.engine.history_capacity = 5;
    let h = Harness::new(config, noon()).await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let dispatch = h
            .service
            .send(h.note(&format!("user-{}", i), &[ChannelKind::WebSocket]))
            .await?;
        ids.push(dispatch.notification.id);
    }

    let manager = h.service.manager();
    assert_eq!(manager.history_len(), 5);
    for evicted in &ids[..3] {
        assert!(manager.history_entry(evicted).is_none());
    }
    for kept in &ids[3..] {
        assert!(manager.history_entry(kept).is_some());
    }
    assert!(h.service.history("user-0", 10).is_empty());
    assert_eq!(h.service.history("user-7", 10).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_history_query_respects_limit() -> anyhow::Result<()> {
    let h = Harness::new(create_test_config(), noon()).await;
    for _ in 0..4 {
        h.service
            .send(h.note("user-1", &[ChannelKind::WebSocket]))
            .await?;
    }

    let recent = h.service.history("user-1", 2);
    assert_eq!(recent.len(), 2);
    assert!(recent[0].sequence < recent[1].sequence);
    Ok(())
}
