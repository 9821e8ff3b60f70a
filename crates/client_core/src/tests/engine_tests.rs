use super::*;
use chrono::TimeZone;
use shared::domain::{GroupId, REMOVED_PLACEHOLDER};

const ID_A: &str = "65a1b2c3d4e5f60718293a4b";
const ID_B: &str = "65a1b2c3d4e5f60718293a4c";
const ID_C: &str = "65a1b2c3d4e5f60718293a4d";

fn alice() -> UserName {
    UserName::new("alice")
}

fn bob() -> UserName {
    UserName::new("bob")
}

fn dm_with(peer: &str) -> ConversationKey {
    ConversationKey::direct(alice(), UserName::new(peer))
}

fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(offset_ms)
}

fn wire(id: &str, sender: &str, receiver: &str, content: &str, ts: DateTime<Utc>) -> WireMessage {
    WireMessage {
        id: Some(serde_json::Value::String(id.to_string())),
        sender_id: Some(sender.to_string()),
        receiver_id: Some(receiver.to_string()),
        content: Some(content.to_string()),
        timestamp: Some(ts.to_rfc3339()),
        ..WireMessage::default()
    }
}

fn confirmed(id: &str, sender: &str, receiver: &str, content: &str, ts: DateTime<Utc>) -> Message {
    wire(id, sender, receiver, content, ts)
        .to_message(&IdFormat::default(), None)
        .expect("confirmed message")
}

fn engine_bound_to(peer: &str, history: &[WireMessage]) -> ReconciliationEngine {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    let request = engine.bind(dm_with(peer));
    assert!(matches!(
        engine.apply_history(&request, history),
        HistoryOutcome::Applied { .. }
    ));
    engine
}

fn ids(engine: &ReconciliationEngine) -> Vec<String> {
    engine
        .snapshot()
        .iter()
        .map(|message| message.handle().to_string())
        .collect()
}

#[test]
fn optimistic_send_then_confirmation_leaves_one_confirmed_entry() {
    let mut engine = engine_bound_to("bob", &[]);

    let (pending, command) = engine.send_optimistic_at("hi", at(0)).expect("send");
    assert!(!pending.is_confirmed());
    assert!(pending.handle().starts_with(shared::domain::LOCAL_ID_PREFIX));
    match command {
        ClientCommand::Message {
            sender_id,
            receiver_id,
            content,
            ..
        } => {
            assert_eq!(sender_id, alice());
            assert_eq!(receiver_id, bob());
            assert_eq!(content, "hi");
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert_eq!(engine.snapshot().len(), 1);

    let outcome = engine.apply_confirmation(confirmed(ID_A, "Alice", "BOB", "hi", at(1_200)));
    assert_eq!(
        outcome,
        ConfirmOutcome::Appended {
            replaced_optimistic: 1
        }
    );

    let visible = engine.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id().map(MessageId::as_str), Some(ID_A));
    assert_eq!(visible[0].content, "hi");
    assert!(visible[0].liked_by.is_empty());
    assert!(visible[0].deleted_for.is_empty());
}

#[test]
fn confirmation_outside_tolerance_keeps_the_optimistic_entry() {
    let mut engine = engine_bound_to("bob", &[]);
    engine.send_optimistic_at("hi", at(0)).expect("send");

    let outcome = engine.apply_confirmation(confirmed(ID_A, "alice", "bob", "hi", at(6_000)));

    assert_eq!(
        outcome,
        ConfirmOutcome::Appended {
            replaced_optimistic: 0
        }
    );
    assert_eq!(engine.snapshot().len(), 2);
}

#[test]
fn tolerance_window_is_exclusive() {
    let mut engine = engine_bound_to("bob", &[]);
    engine.send_optimistic_at("hi", at(0)).expect("send");

    engine.apply_confirmation(confirmed(ID_A, "alice", "bob", "hi", at(5_000)));

    assert_eq!(engine.snapshot().len(), 2);
}

#[test]
fn confirmation_with_different_content_does_not_replace() {
    let mut engine = engine_bound_to("bob", &[]);
    engine.send_optimistic_at("hi", at(0)).expect("send");

    engine.apply_confirmation(confirmed(ID_A, "alice", "bob", "hi!", at(100)));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(!snapshot[0].is_confirmed());
}

#[test]
fn redelivered_events_converge_to_the_same_state() {
    let events = |engine: &mut ReconciliationEngine| {
        engine.apply_confirmation(confirmed(ID_A, "alice", "bob", "one", at(0)));
        engine.apply_confirmation(confirmed(ID_B, "bob", "alice", "two", at(1_000)));
        engine.apply_confirmation(confirmed(ID_C, "alice", "bob", "three", at(2_000)));
        engine.apply_like(ID_A, &["bob".to_string()]);
        engine.apply_delete(ID_B, &["alice".to_string()], None);
        engine.apply_delete(ID_C, &["*".to_string()], None);
    };

    let mut once = engine_bound_to("bob", &[]);
    events(&mut once);

    let mut twice = engine_bound_to("bob", &[]);
    events(&mut twice);
    events(&mut twice);

    assert_eq!(once.visible(), twice.visible());
    assert_eq!(ids(&twice), vec![ID_A.to_string(), ID_B.to_string()]);
}

#[test]
fn confirmation_redelivered_after_wildcard_delete_stays_removed() {
    let mut engine = engine_bound_to("bob", &[]);
    let message = confirmed(ID_A, "bob", "alice", "regret", at(0));

    engine.apply_confirmation(message.clone());
    engine.apply_delete(ID_A, &["*".to_string()], None);

    assert_eq!(engine.apply_confirmation(message), ConfirmOutcome::Discarded);
    assert!(engine.snapshot().is_empty());
}

#[test]
fn wildcard_delete_before_confirmation_discards_it() {
    let mut engine = engine_bound_to("bob", &[]);

    assert_eq!(
        engine.apply_delete(ID_A, &["*".to_string()], None),
        MutationOutcome::Missing { refetch: None }
    );
    let outcome = engine.apply_confirmation(confirmed(ID_A, "bob", "alice", "gone", at(0)));

    assert_eq!(outcome, ConfirmOutcome::Discarded);
    assert!(engine.snapshot().is_empty());
}

#[test]
fn duplicate_confirmation_is_dropped() {
    let mut engine = engine_bound_to("bob", &[]);
    let message = confirmed(ID_A, "bob", "alice", "yo", at(0));

    engine.apply_confirmation(message.clone());
    let outcome = engine.apply_confirmation(message);

    assert_eq!(
        outcome,
        ConfirmOutcome::Duplicate {
            replaced_optimistic: 0
        }
    );
    assert_eq!(engine.snapshot().len(), 1);
}

#[test]
fn dedup_keeps_first_occurrence_and_is_idempotent() {
    let list = vec![
        confirmed(ID_A, "alice", "bob", "same", at(100)),
        confirmed(ID_B, "bob", "alice", "other", at(200)),
        confirmed(ID_C, "ALICE", "bob", "same", at(900)),
    ];

    let once = dedup_messages(&list);
    let twice = dedup_messages(&once);

    assert_eq!(once, twice);
    assert_eq!(once.len(), 2);
    assert_eq!(once[0].id().map(MessageId::as_str), Some(ID_A));
    assert_eq!(once[1].id().map(MessageId::as_str), Some(ID_B));
}

#[test]
fn rebinding_does_not_resurrect_unacknowledged_sends() {
    let mut engine = engine_bound_to("bob", &[]);
    engine.send_optimistic_at("lost", at(0)).expect("send");

    let to_carol = engine.bind(dm_with("carol"));
    assert!(engine.snapshot().is_empty());
    engine.apply_history(&to_carol, &[]);

    let back_to_bob = engine.bind(dm_with("bob"));
    engine.apply_history(
        &back_to_bob,
        &[wire(ID_A, "bob", "alice", "earlier", at(-60_000))],
    );

    let visible = engine.visible();
    assert_eq!(visible.len(), 1);
    assert!(visible.iter().all(Message::is_confirmed));
    assert_eq!(visible[0].content, "earlier");
}

#[test]
fn late_history_for_an_unbound_conversation_is_ignored() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    let to_bob = engine.bind(dm_with("bob"));
    let to_carol = engine.bind(dm_with("carol"));

    let outcome = engine.apply_history(&to_bob, &[wire(ID_A, "bob", "alice", "x", at(0))]);

    assert_eq!(outcome, HistoryOutcome::Stale);
    assert!(engine.snapshot().is_empty());
    assert_eq!(engine.bound_conversation(), Some(&to_carol.conversation));
}

#[test]
fn initial_load_from_an_earlier_binding_of_the_same_key_is_stale() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    let first = engine.bind(dm_with("bob"));
    engine.bind(dm_with("carol"));
    let second = engine.bind(dm_with("bob"));

    assert_eq!(
        engine.apply_history(&first, &[wire(ID_A, "bob", "alice", "old", at(0))]),
        HistoryOutcome::Stale
    );
    assert!(matches!(
        engine.apply_history(&second, &[wire(ID_B, "bob", "alice", "new", at(0))]),
        HistoryOutcome::Applied { inserted: 1, .. }
    ));
    assert_eq!(ids(&engine), vec![ID_B.to_string()]);
}

#[test]
fn replace_keeps_events_that_arrived_during_the_fetch() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    let request = engine.bind(dm_with("bob"));
    engine.apply_confirmation(confirmed(ID_B, "bob", "alice", "pushed", at(2_000)));

    engine.apply_history(
        &request,
        &[
            wire(ID_A, "alice", "bob", "stored", at(0)),
            wire(ID_B, "bob", "alice", "pushed", at(2_000)),
        ],
    );

    assert_eq!(ids(&engine), vec![ID_A.to_string(), ID_B.to_string()]);
}

#[test]
fn initial_load_fetched_before_a_delete_does_not_restore_it() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    let request = engine.bind(dm_with("bob"));
    engine.apply_confirmation(confirmed(ID_A, "bob", "alice", "regret", at(0)));
    engine.apply_delete(ID_A, &["*".to_string()], None);

    engine.apply_history(
        &request,
        &[
            wire(ID_A, "bob", "alice", "regret", at(0)),
            wire(ID_B, "alice", "bob", "kept", at(1_000)),
        ],
    );

    assert_eq!(ids(&engine), vec![ID_B.to_string()]);
}

#[test]
fn merge_does_not_restore_messages_removed_for_everyone() {
    let mut engine = engine_bound_to(
        "bob",
        &[
            wire(ID_A, "bob", "alice", "regret", at(0)),
            wire(ID_B, "alice", "bob", "kept", at(1_000)),
        ],
    );
    let request = engine.request_merge_refetch().expect("merge request");
    engine.apply_delete(ID_A, &["*".to_string()], None);

    engine.apply_history(
        &request,
        &[
            wire(ID_A, "bob", "alice", "regret", at(0)),
            wire(ID_B, "alice", "bob", "kept", at(1_000)),
        ],
    );

    assert_eq!(ids(&engine), vec![ID_B.to_string()]);
}

#[test]
fn removed_ids_are_forgotten_on_rebind() {
    let mut engine = engine_bound_to("bob", &[]);
    engine.apply_delete(ID_A, &["*".to_string()], None);

    let request = engine.bind(dm_with("bob"));
    engine.apply_history(&request, &[wire(ID_A, "bob", "alice", "restored", at(0))]);

    assert_eq!(ids(&engine), vec![ID_A.to_string()]);
}

#[test]
fn history_skips_records_deleted_for_everyone() {
    let mut deleted = wire(ID_B, "bob", "alice", "gone", at(1_000));
    deleted.deleted_by = vec!["*".to_string()];

    let engine = engine_bound_to("bob", &[wire(ID_A, "bob", "alice", "kept", at(0)), deleted]);

    assert_eq!(ids(&engine), vec![ID_A.to_string()]);
}

#[test]
fn wildcard_delete_removes_and_repeated_delete_is_a_no_op() {
    let mut engine = engine_bound_to(
        "bob",
        &[
            wire(ID_A, "alice", "bob", "first", at(0)),
            wire(ID_B, "bob", "alice", "second", at(1_000)),
        ],
    );
    let everyone = vec!["*".to_string()];

    assert_eq!(
        engine.apply_delete(ID_A, &everyone, None),
        MutationOutcome::Removed
    );
    assert_eq!(ids(&engine), vec![ID_B.to_string()]);

    assert_eq!(
        engine.apply_delete(ID_A, &everyone, None),
        MutationOutcome::Missing { refetch: None }
    );
    assert_eq!(ids(&engine), vec![ID_B.to_string()]);
}

#[test]
fn partial_delete_updates_in_place_and_renders_placeholder() {
    let mut engine = engine_bound_to("bob", &[wire(ID_A, "alice", "bob", "secret", at(0))]);

    let outcome = engine.apply_delete(
        ID_A,
        &[" Bob ".to_string()],
        Some(&["Alice".to_string()]),
    );

    assert_eq!(outcome, MutationOutcome::Updated);
    let snapshot = engine.snapshot();
    let entry = &snapshot[0];
    assert!(entry.deleted_for.contains(&bob()));
    assert!(entry.liked_by.contains(&alice()));
    assert_eq!(entry.display_content(&bob()), REMOVED_PLACEHOLDER);
    assert_eq!(entry.display_content(&alice()), "secret");
}

#[test]
fn like_replaces_the_like_set_by_authoritative_id() {
    let mut engine = engine_bound_to("bob", &[wire(ID_A, "alice", "bob", "hey", at(0))]);

    let wrapped = format!("ObjectId('{ID_A}')");
    assert_eq!(
        engine.apply_like(&wrapped, &["BOB".to_string(), "alice".to_string()]),
        MutationOutcome::Updated
    );
    assert_eq!(engine.snapshot()[0].liked_by.len(), 2);

    assert_eq!(
        engine.apply_like(ID_A, &["alice".to_string()]),
        MutationOutcome::Updated
    );
    let snapshot = engine.snapshot();
    assert_eq!(
        snapshot[0].liked_by.iter().collect::<Vec<_>>(),
        vec![&alice()]
    );
}

#[test]
fn like_for_unknown_id_triggers_a_single_merge_refetch() {
    let mut engine = engine_bound_to(
        "bob",
        &[
            wire(ID_A, "alice", "bob", "first", at(0)),
            wire(ID_B, "bob", "alice", "second", at(1_000)),
        ],
    );

    let MutationOutcome::Missing {
        refetch: Some(request),
    } = engine.apply_like(ID_C, &["bob".to_string()])
    else {
        panic!("expected a merge re-fetch");
    };
    assert_eq!(request.mode, FetchMode::Merge);
    assert_eq!(request.conversation, dm_with("bob"));
    assert_eq!(
        engine.apply_like(ID_C, &["bob".to_string()]),
        MutationOutcome::Missing { refetch: None }
    );

    let mut liked_first = wire(ID_A, "alice", "bob", "first", at(0));
    liked_first.likes = vec!["bob".to_string()];
    let mut third = wire(ID_C, "alice", "bob", "third", at(2_000));
    third.likes = vec!["bob".to_string()];
    let outcome = engine.apply_history(
        &request,
        &[liked_first, wire(ID_B, "bob", "alice", "second", at(1_000)), third],
    );

    assert_eq!(
        outcome,
        HistoryOutcome::Applied {
            inserted: 1,
            updated: 1
        }
    );
    assert_eq!(
        ids(&engine),
        vec![ID_A.to_string(), ID_B.to_string(), ID_C.to_string()]
    );
    let snapshot = engine.snapshot();
    assert!(snapshot[0].liked_by.contains(&bob()));
    assert!(snapshot[2].liked_by.contains(&bob()));

    assert!(engine.request_merge_refetch().is_some());
}

#[test]
fn merge_never_removes_entries() {
    let mut engine = engine_bound_to("bob", &[wire(ID_A, "alice", "bob", "kept", at(0))]);
    engine.send_optimistic_at("pending", at(10_000)).expect("send");
    let request = engine.request_merge_refetch().expect("merge request");

    engine.apply_history(&request, &[]);

    assert_eq!(engine.snapshot().len(), 2);
}

#[test]
fn merge_promotes_a_matching_optimistic_entry_in_place() {
    let mut engine = engine_bound_to("bob", &[wire(ID_A, "bob", "alice", "question", at(0))]);
    engine.send_optimistic_at("answer", at(10_000)).expect("send");
    let request = engine.request_merge_refetch().expect("merge request");

    engine.apply_history(
        &request,
        &[
            wire(ID_A, "bob", "alice", "question", at(0)),
            wire(ID_B, "alice", "bob", "answer", at(10_400)),
        ],
    );

    assert_eq!(ids(&engine), vec![ID_A.to_string(), ID_B.to_string()]);
}

#[test]
fn failed_merge_allows_a_later_refetch() {
    let mut engine = engine_bound_to("bob", &[]);
    let request = engine.request_merge_refetch().expect("merge request");
    assert!(engine.request_merge_refetch().is_none());

    engine.history_failed(&request);

    assert!(engine.request_merge_refetch().is_some());
}

#[test]
fn merge_from_an_earlier_binding_does_not_release_the_current_one() {
    let mut engine = engine_bound_to("bob", &[]);
    let earlier = engine.request_merge_refetch().expect("merge request");

    let rebound = engine.bind(dm_with("bob"));
    engine.apply_history(&rebound, &[]);
    let current = engine.request_merge_refetch().expect("merge request");

    assert!(matches!(
        engine.apply_history(&earlier, &[wire(ID_A, "bob", "alice", "late", at(0))]),
        HistoryOutcome::Applied { .. }
    ));
    assert!(engine.request_merge_refetch().is_none());
    engine.history_failed(&earlier);
    assert!(engine.request_merge_refetch().is_none());

    engine.apply_history(&current, &[]);
    assert!(engine.request_merge_refetch().is_some());
}

#[test]
fn confirmation_for_another_conversation_is_not_applied() {
    let mut engine = engine_bound_to("bob", &[]);

    let outcome = engine.apply_confirmation(confirmed(ID_A, "carol", "alice", "psst", at(0)));

    assert_eq!(outcome, ConfirmOutcome::NotBound);
    assert!(engine.snapshot().is_empty());
}

#[test]
fn confirmation_already_deleted_for_everyone_is_discarded() {
    let mut engine = engine_bound_to("bob", &[]);
    let mut message = confirmed(ID_A, "bob", "alice", "oops", at(0));
    message.deleted_for = DeletedFor::Everyone;

    assert_eq!(engine.apply_confirmation(message), ConfirmOutcome::Discarded);
    assert!(engine.snapshot().is_empty());
}

#[test]
fn snapshots_are_not_affected_by_later_transitions() {
    let mut engine = engine_bound_to("bob", &[]);
    let before = engine.snapshot();

    engine.apply_confirmation(confirmed(ID_A, "bob", "alice", "new", at(0)));

    assert!(before.is_empty());
    assert_eq!(engine.snapshot().len(), 1);
}

#[test]
fn sends_are_rejected_without_binding_or_content() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    assert_eq!(
        engine.send_optimistic("hello").unwrap_err(),
        ClientError::NotBound
    );

    engine.bind(dm_with("bob"));
    assert_eq!(
        engine.send_optimistic("   ").unwrap_err(),
        ClientError::EmptyContent
    );
    assert!(engine.snapshot().is_empty());
}

#[test]
fn group_send_uses_group_message_command() {
    let mut engine = ReconciliationEngine::new(alice(), EngineSettings::default());
    engine.bind(ConversationKey::group(GroupId::new("G1")));

    let (message, command) = engine.send_optimistic_at("hello all", at(0)).expect("send");

    assert_eq!(message.recipient(), "g1");
    assert_eq!(
        command,
        ClientCommand::GroupMessage {
            group_id: GroupId::new("g1"),
            from: alice(),
            content: "hello all".to_string(),
        }
    );
}

#[test]
fn mutation_commands_require_an_authoritative_id() {
    let mut engine = engine_bound_to("bob", &[]);
    let (pending, _) = engine.send_optimistic_at("draft", at(0)).expect("send");

    assert_eq!(
        engine.like_command(pending.handle()).unwrap_err(),
        ClientError::UnconfirmedTarget(pending.handle().to_string())
    );
    assert_eq!(
        engine.delete_command("not-an-id").unwrap_err(),
        ClientError::InvalidIdentifier("not-an-id".to_string())
    );
    assert_eq!(
        engine.delete_command(ID_A).expect("delete command"),
        ClientCommand::Delete {
            message_id: IdFormat::default().parse(ID_A).expect("id"),
            is_group: false,
            group_id: None,
        }
    );

    engine.bind(ConversationKey::group(GroupId::new("g1")));
    assert_eq!(
        engine.like_command(ID_A).expect("like command"),
        ClientCommand::Like {
            message_id: IdFormat::default().parse(ID_A).expect("id"),
            is_group: true,
            group_id: Some(GroupId::new("g1")),
        }
    );
}

#[test]
fn configured_id_length_is_respected() {
    let settings = EngineSettings {
        id_format: IdFormat::hex(8),
        ..EngineSettings::default()
    };
    let mut engine = ReconciliationEngine::new(alice(), settings);
    let request = engine.bind(dm_with("bob"));
    engine.apply_history(&request, &[wire("deadbeef", "bob", "alice", "short", at(0))]);

    assert_eq!(ids(&engine), vec!["deadbeef".to_string()]);
    assert_eq!(
        engine.apply_like(ID_A, &[]),
        MutationOutcome::Ignored
    );
}
