use super::*;
use crate::events::{
    DOCUMENT_CONFLICT, DOCUMENT_DIRTY, DOCUMENT_ERROR, DOCUMENT_SAVED, DOCUMENT_SAVING,
    SESSION_LOGOUT,
};
use crate::models::Content;
use crate::test_support::{backoff_config, document, QueueFixture};

fn content(text: &str) -> DocumentPatch {
    DocumentPatch::default().with_content(Content::text(text))
}

#[tokio::test]
async fn noop_patch_emits_nothing_and_queues_nothing() {
    let fx = QueueFixture::new(&[document("7", "FADE IN:")]);
    let id = DocumentId::from("7");
    let cached = fx.cache.get(&id).expect("cached");

    let queued = fx
        .queue
        .queue_patch(
            &id,
            DocumentPatch::default()
                .with_title(cached.title)
                .with_content(Content::text("FADE IN:"))
                .with_visibility(cached.visibility),
            PatchReason::Typing,
        )
        .expect("queue");
    assert!(!queued);
    assert!(fx.queue.pending(&id).is_none());
    assert_eq!(fx.log.count(DOCUMENT_DIRTY), 0);
    assert_eq!(fx.queue.flush_patch(&id).await, FlushOutcome::Idle);
}

#[tokio::test]
async fn line_ending_only_changes_are_noops() {
    let fx = QueueFixture::new(&[document("7", "a\nb")]);
    let id = DocumentId::from("7");
    let queued = fx
        .queue
        .queue_patch(&id, content("a\r\nb"), PatchReason::Typing)
        .expect("queue");
    assert!(!queued);
    assert_eq!(fx.log.count(DOCUMENT_DIRTY), 0);
}

#[tokio::test]
async fn patches_merge_per_field_before_flush() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");

    fx.queue
        .queue_patch(
            &id,
            DocumentPatch::default().with_title("A"),
            PatchReason::Metadata,
        )
        .expect("title");
    fx.queue
        .queue_patch(&id, content("X"), PatchReason::Typing)
        .expect("content");

    let pending = fx.queue.pending(&id).expect("pending");
    assert_eq!(
        pending.patch,
        DocumentPatch::default()
            .with_title("A")
            .with_content(Content::text("X"))
    );
    assert_eq!(pending.reason, PatchReason::Typing);
    assert_eq!(fx.log.count(DOCUMENT_DIRTY), 2);

    let cached = fx.cache.get(&id).expect("cached");
    assert_eq!(cached.title, "A");
    assert_eq!(cached.content, Content::text("X"));
    assert_eq!(cached.local_stamp, pending.queued_at);
}

#[tokio::test]
async fn document_42_round_trip() {
    let fx = QueueFixture::new(&[document("42", "")]);
    let id = DocumentId::from("42");
    fx.cache.set_current(Some(&id)).expect("select");

    let queued = fx
        .queue
        .queue_patch(&id, content("line one"), PatchReason::Typing)
        .expect("queue");
    assert!(queued);
    match fx.log.events().first() {
        Some(SyncEvent::Dirty { id: dirty, reason, fields }) => {
            assert_eq!(dirty, &id);
            assert_eq!(reason, &PatchReason::Typing);
            assert_eq!(fields, &vec!["content"]);
        }
        other => panic!("expected dirty event, got {:?}", other),
    }
    assert_eq!(
        fx.cache.current().map(|doc| doc.content),
        Some(Content::text("line one"))
    );

    let outcome = fx.queue.flush_patch(&id).await;
    assert!(matches!(outcome, FlushOutcome::Saved(ref doc) if doc.version == 2));
    assert_eq!(fx.log.topics(), vec![DOCUMENT_DIRTY, DOCUMENT_SAVING, DOCUMENT_SAVED]);

    let updates = fx.store.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, id);
    assert_eq!(updates[0].1.content, Content::text("line one"));
    assert_eq!(updates[0].1.version, 1);

    let cached = fx.cache.get(&id).expect("cached");
    assert_eq!(cached.content, Content::text("line one"));
    assert_eq!(cached.version, 2);
    assert!(fx.queue.pending(&id).is_none());
    assert!(!fx.queue.is_flushing(&id));
}

#[tokio::test]
async fn concurrent_flushes_make_one_write() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");
    let gate = fx.store.hold_updates();

    let (first, second) = tokio::join!(fx.queue.flush_patch(&id), async {
        fx.store.update_started().await;
        assert!(fx.queue.is_flushing(&id));
        let second = fx.queue.flush_patch(&id).await;
        gate.add_permits(1);
        second
    });

    assert!(matches!(first, FlushOutcome::Saved(_)));
    assert_eq!(second, FlushOutcome::AlreadyFlushing);
    assert_eq!(fx.store.update_calls(), 1);
}

#[tokio::test]
async fn stale_redundant_patch_resolves_without_network() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("from editor"), PatchReason::Typing)
        .expect("queue");
    let queued_at = fx.queue.pending(&id).expect("pending").queued_at;

    let mut external = document("7", "from editor");
    external.version = 2;
    let stamp = fx.cache.upsert(external);
    assert!(stamp > queued_at);

    let outcome = fx.queue.flush_patch(&id).await;
    assert_eq!(outcome, FlushOutcome::Moot);
    assert_eq!(fx.store.update_calls(), 0);
    assert!(fx.queue.pending(&id).is_none());
    assert!(matches!(
        fx.log.events().last(),
        Some(SyncEvent::Saved { moot: true, version: 2, .. })
    ));
}

#[tokio::test]
async fn stale_patch_is_narrowed_to_remaining_fields() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(
            &id,
            DocumentPatch::default()
                .with_title("Second Draft")
                .with_content(Content::text("shared text")),
            PatchReason::Typing,
        )
        .expect("queue");

    // Another tab already saved the same content but kept the old title.
    let mut external = fx.store.stored("7").expect("stored");
    external.content = Content::text("shared text");
    external.version = 2;
    fx.store.put(external.clone());
    fx.cache.upsert(external);

    let outcome = fx.queue.flush_patch(&id).await;
    assert!(matches!(outcome, FlushOutcome::Saved(ref doc) if doc.version == 3));

    let updates = fx.store.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.title, "Second Draft");
    assert_eq!(updates[0].1.content, Content::text("shared text"));
    assert_eq!(updates[0].1.version, 2);
    assert!(fx.queue.pending(&id).is_none());
}

#[tokio::test]
async fn rate_limit_backoff_is_monotonic_and_capped() {
    let fx = QueueFixture::with_config(&[document("7", "")], backoff_config(1_000, 5_000));
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");
    assert_eq!(fx.queue.retry_delay(&id), Duration::from_millis(1_000));

    fx.store.fail_next(
        std::iter::repeat(StoreError::RateLimited { retry_after: None }).take(4),
    );
    let mut delays = Vec::new();
    for _ in 0..4 {
        let outcome = fx.queue.flush_patch(&id).await;
        assert!(matches!(
            outcome,
            FlushOutcome::Failed(StoreError::RateLimited { .. })
        ));
        delays.push(fx.queue.retry_delay(&id));
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(2_000),
            Duration::from_millis(4_000),
            Duration::from_millis(5_000),
            Duration::from_millis(5_000),
        ]
    );
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(fx.queue.pending(&id).is_some(), "patch survives rate limits");

    match fx.log.events().last() {
        Some(SyncEvent::Error { kind, retry_in, .. }) => {
            assert_eq!(*kind, FailureKind::RateLimited);
            assert_eq!(*retry_in, Duration::from_millis(5_000));
        }
        other => panic!("expected error event, got {:?}", other),
    }

    assert!(matches!(
        fx.queue.flush_patch(&id).await,
        FlushOutcome::Saved(_)
    ));
    assert_eq!(fx.queue.retry_delay(&id), Duration::from_millis(1_000));
}

#[tokio::test]
async fn retry_after_hint_never_lowers_the_delay() {
    let fx = QueueFixture::with_config(&[document("7", "")], backoff_config(1_000, 60_000));
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");

    fx.store.fail_next([
        StoreError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        },
        StoreError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        },
        StoreError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        },
    ]);
    fx.queue.flush_patch(&id).await;
    assert_eq!(fx.queue.retry_delay(&id), Duration::from_secs(30));
    fx.queue.flush_patch(&id).await;
    assert_eq!(fx.queue.retry_delay(&id), Duration::from_secs(60));
    fx.queue.flush_patch(&id).await;
    assert_eq!(fx.queue.retry_delay(&id), Duration::from_secs(60));
}

#[tokio::test]
async fn transient_failures_keep_patch_and_delay() {
    let fx = QueueFixture::with_config(&[document("7", "")], backoff_config(1_000, 5_000));
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");

    fx.store.fail_next([
        StoreError::Network("connection reset".to_string()),
        StoreError::Server {
            status: 503,
            message: "unavailable".to_string(),
        },
    ]);
    for _ in 0..2 {
        let outcome = fx.queue.flush_patch(&id).await;
        assert!(matches!(outcome, FlushOutcome::Failed(_)));
        assert_eq!(fx.queue.retry_delay(&id), Duration::from_millis(1_000));
    }
    assert_eq!(fx.log.count(DOCUMENT_ERROR), 2);
    assert_eq!(
        fx.cache.get(&id).map(|doc| doc.content),
        Some(Content::text("draft")),
        "optimistic value survives failures"
    );

    assert!(matches!(
        fx.queue.flush_patch(&id).await,
        FlushOutcome::Saved(_)
    ));
    assert_eq!(
        fx.store.stored("7").map(|doc| doc.content),
        Some(Content::text("draft"))
    );
}

#[tokio::test]
async fn response_without_id_fails_only_this_attempt() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");

    fx.store.answer_malformed(true);
    let outcome = fx.queue.flush_patch(&id).await;
    assert!(matches!(
        outcome,
        FlushOutcome::Failed(StoreError::InvalidResponse(_))
    ));
    assert!(fx.queue.pending(&id).is_some());
    assert_eq!(fx.cache.get(&id).map(|doc| doc.version), Some(1));

    fx.store.answer_malformed(false);
    assert!(matches!(
        fx.queue.flush_patch(&id).await,
        FlushOutcome::Saved(_)
    ));
}

#[tokio::test]
async fn unauthorized_tears_down_the_session() {
    let fx = QueueFixture::new(&[document("7", ""), document("8", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("secret"), PatchReason::Typing)
        .expect("queue 7");
    fx.queue
        .queue_patch(&DocumentId::from("8"), content("other"), PatchReason::Typing)
        .expect("queue 8");

    fx.store.fail_next([StoreError::Unauthorized]);
    assert_eq!(fx.queue.flush_patch(&id).await, FlushOutcome::Unauthorized);

    assert!(fx.cache.is_empty());
    assert!(fx.queue.pending_ids().is_empty());
    assert!(!fx.queue.is_flushing(&id));
    assert_eq!(fx.log.count(SESSION_LOGOUT), 1);
    assert_eq!(fx.log.count(DOCUMENT_ERROR), 0);
}

#[tokio::test]
async fn version_conflict_is_reported_and_patch_kept() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    let mut newer = document("7", "written elsewhere");
    newer.version = 2;
    fx.store.put(newer);

    fx.queue
        .queue_patch(&id, content("mine"), PatchReason::Typing)
        .expect("queue");
    let outcome = fx.queue.flush_patch(&id).await;
    assert_eq!(
        outcome,
        FlushOutcome::Failed(StoreError::Conflict { current_version: 2 })
    );
    assert!(fx.queue.pending(&id).is_some());
    assert_eq!(fx.log.count(DOCUMENT_CONFLICT), 1);
    assert!(fx.log.events().iter().any(|event| matches!(
        event,
        SyncEvent::Conflict {
            local_version: 1,
            server_version: 2,
            ..
        }
    )));
}

#[tokio::test]
async fn edits_during_flight_stay_pending_over_server_state() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("first"), PatchReason::Typing)
        .expect("queue first");
    let gate = fx.store.hold_updates();

    let (outcome, ()) = tokio::join!(fx.queue.flush_patch(&id), async {
        fx.store.update_started().await;
        fx.queue
            .queue_patch(&id, content("second"), PatchReason::Typing)
            .expect("queue second");
        gate.add_permits(1);
    });
    assert!(matches!(outcome, FlushOutcome::Saved(ref doc) if doc.version == 2));

    let pending = fx.queue.pending(&id).expect("newer edit still pending");
    assert_eq!(pending.patch, content("second"));
    let cached = fx.cache.get(&id).expect("cached");
    assert_eq!(cached.version, 2);
    assert_eq!(cached.content, Content::text("second"));
    assert_eq!(cached.local_stamp, pending.queued_at);

    gate.add_permits(1);
    assert!(matches!(
        fx.queue.flush_patch(&id).await,
        FlushOutcome::Saved(ref doc) if doc.version == 3
    ));
    let updates = fx.store.updates();
    assert_eq!(updates[1].1.content, Content::text("second"));
    assert_eq!(updates[1].1.version, 2);
    assert!(fx.queue.pending(&id).is_none());
}

#[tokio::test]
async fn validation_errors_queue_nothing() {
    let fx = QueueFixture::with_config(
        &[document("7", "")],
        QueueConfig {
            max_content_size: 8,
            ..QueueConfig::default()
        },
    );

    assert_eq!(
        fx.queue
            .queue_patch(&DocumentId::from(" "), content("x"), PatchReason::Typing),
        Err(SyncError::MissingId)
    );
    assert_eq!(
        fx.queue
            .queue_patch(&DocumentId::from("404"), content("x"), PatchReason::Typing),
        Err(SyncError::UnknownDocument("404".to_string()))
    );
    assert_eq!(
        fx.queue.queue_patch(
            &DocumentId::from("7"),
            content("way too long"),
            PatchReason::Typing
        ),
        Err(SyncError::ContentTooLarge { size: 12, max: 8 })
    );

    let mut unsaved = document("9", "");
    unsaved.version = 0;
    fx.cache.upsert(unsaved);
    assert_eq!(
        fx.queue
            .queue_patch(&DocumentId::from("9"), content("x"), PatchReason::Typing),
        Err(SyncError::MissingVersion("9".to_string()))
    );

    assert!(fx.queue.pending_ids().is_empty());
    assert_eq!(fx.log.count(DOCUMENT_DIRTY), 0);
}

#[tokio::test]
async fn document_removed_before_flush_drops_patch() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");
    fx.cache.remove(&id);

    assert_eq!(
        fx.queue.flush_patch(&id).await,
        FlushOutcome::Invalid(SyncError::UnknownDocument("7".to_string()))
    );
    assert!(fx.queue.pending(&id).is_none());
    assert_eq!(fx.store.update_calls(), 0);
}

#[tokio::test]
async fn flush_all_writes_every_pending_document() {
    let fx = QueueFixture::new(&[document("a", ""), document("b", ""), document("c", "")]);
    for id in ["a", "c"] {
        fx.queue
            .queue_patch(&DocumentId::from(id), content(id), PatchReason::Typing)
            .expect("queue");
    }

    let outcomes = fx.queue.flush_all().await;
    let ids: Vec<&str> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| matches!(outcome, FlushOutcome::Saved(_))));
    assert!(!fx.queue.has_pending());
    assert_eq!(fx.store.update_calls(), 2);
}

#[tokio::test]
async fn aborted_flush_releases_the_active_marker() {
    let fx = QueueFixture::new(&[document("7", "")]);
    let id = DocumentId::from("7");
    fx.queue
        .queue_patch(&id, content("draft"), PatchReason::Typing)
        .expect("queue");
    let _gate = fx.store.hold_updates();

    let queue = Arc::clone(&fx.queue);
    let flush_id = id.clone();
    let handle = tokio::spawn(async move { queue.flush_patch(&flush_id).await });
    fx.store.update_started().await;
    assert!(fx.queue.is_flushing(&id));

    handle.abort();
    let _ = handle.await;
    assert!(!fx.queue.is_flushing(&id));
    assert!(fx.queue.pending(&id).is_some());
}
