//! Session lifecycle against a scripted in-memory server.
//!
//! Run with: cargo test --test session_test

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use notebook_sync::transport::memory;
use notebook_sync::{
    CellType, CellTypeChange, EventKind, ExecuteScope, ExecutionState, Session, SessionError,
    SessionState, TextPatch,
};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
async fn test_open_authenticates_then_subscribes_document() {
    init_logging();
    let (connector, mut listener) = memory::pair();
    let snapshots = notebook_sync::MemorySnapshots::new(snapshot(3, vec![code("a", "1 + 1")]));
    let mut config = config();
    config.subscribe_kernel_channel = true;

    let opening = tokio::spawn(Session::open(
        config,
        Arc::new(connector.clone()),
        Arc::new(snapshots.clone()),
    ));

    let mut conn = accept(&mut listener).await;
    let auth = next_frame(&mut conn).await;
    assert_eq!(auth["event"], "authenticate_request");
    assert_eq!(auth["channel"], "system");
    assert_eq!(auth["data"]["token"], "secret-token");
    conn.send_json(&reply(&auth, "authenticate_reply", json!({"success": true})));

    let files = next_frame(&mut conn).await;
    assert_eq!(files["channel"], DOC_CHANNEL);
    assert_eq!(files["data"], json!({"from_version": 3}));
    conn.send_json(&reply(&files, "subscribe_reply", json!({"success": true})));

    let kernels = next_frame(&mut conn).await;
    assert_eq!(kernels["channel"], "kernels/notebook-kernel-file1");
    assert_eq!(kernels["data"], json!({"file_id": FILE_ID}));
    conn.send_json(&reply(
        &kernels,
        "subscribe_reply",
        json!({
            "success": true,
            "kernel_session": {"session_id": "s1", "kernel": {"name": "python3", "execution_state": "idle"}}
        }),
    ));

    let session = opening.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.watermark(), 3);
    assert_eq!(session.document().cell_ids(), vec!["a"]);
    assert_eq!(session.kernel_state().unwrap().execution_state, "idle");
    assert_eq!(
        session.subscriptions(),
        vec![DOC_CHANNEL.to_string(), "kernels/notebook-kernel-file1".to_string()]
    );
    assert_eq!(snapshots.fetches(), 1);
    assert!(connector.urls()[0].starts_with("ws://memory/api"));

    session.close().await;
}

#[tokio::test]
async fn test_auth_rejection_is_terminal() {
    init_logging();
    let (connector, mut listener) = memory::pair();
    let snapshots = notebook_sync::MemorySnapshots::new(snapshot(0, Vec::new()));

    let opening = tokio::spawn(Session::open(
        config(),
        Arc::new(connector.clone()),
        Arc::new(snapshots),
    ));

    let mut conn = accept(&mut listener).await;
    let auth = next_frame(&mut conn).await;
    conn.send_json(&reply(&auth, "authenticate_reply", json!({"success": false})));

    let result = opening.await.unwrap();
    assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_open() {
    init_logging();
    let (connector, listener) = memory::pair();
    // Every attempt fails once nobody is listening.
    drop(listener);
    let mut config = config();
    config.backoff.max_attempts = 3;

    let result = Session::open(
        config,
        Arc::new(connector.clone()),
        Arc::new(notebook_sync::MemorySnapshots::new(snapshot(0, Vec::new()))),
    )
    .await;

    assert_eq!(result.err(), Some(SessionError::RetryBudgetExhausted { attempts: 3 }));
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test]
async fn test_refused_connections_are_retried() {
    init_logging();
    let (connector, mut listener) = memory::pair();
    connector.refuse_next("first");
    connector.refuse_next("second");

    let opening = tokio::spawn(Session::open(
        config(),
        Arc::new(connector.clone()),
        Arc::new(notebook_sync::MemorySnapshots::new(snapshot(0, Vec::new()))),
    ));
    let _conn = handshake(&mut listener, 0).await;

    let session = opening.await.unwrap().unwrap();
    assert_eq!(connector.attempts(), 3);
    session.close().await;
}

#[tokio::test]
async fn test_reconnect_fails_pending_and_replays_subscriptions_in_order() {
    let Harness {
        session,
        mut conn,
        mut listener,
        connector,
        snapshots,
    } = open(snapshot(2, vec![code("a", "1")])).await;

    for channel in ["channel-a", "channel-b"] {
        let server = async {
            let frame = next_frame(&mut conn).await;
            assert_eq!(frame["channel"], channel);
            conn.send_json(&reply(&frame, "subscribe_reply", json!({"success": true})));
        };
        let (result, ()) = tokio::join!(session.subscribe(channel, json!({"scope": channel})), server);
        result.unwrap();
    }

    let pings: Vec<_> = (0..2)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.ping().await })
        })
        .collect();
    for _ in 0..2 {
        assert_eq!(next_frame(&mut conn).await["event"], "ping_request");
    }

    // Server vanishes with two pings unanswered.
    drop(conn);
    for ping in pings {
        assert_eq!(ping.await.unwrap(), Err(SessionError::ConnectionLost));
    }

    let mut conn = authenticate(&mut listener).await;
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let frame = next_frame(&mut conn).await;
        assert_eq!(frame["event"], "subscribe_request");
        replayed.push(frame["channel"].as_str().unwrap().to_string());
        conn.send_json(&reply(&frame, "subscribe_reply", json!({"success": true})));
    }
    assert_eq!(replayed, vec![DOC_CHANNEL, "channel-a", "channel-b"]);

    session
        .wait_for_state(|s| *s == SessionState::Ready, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(connector.attempts(), 2);
    // No snapshot refetch on a clean resume.
    assert_eq!(snapshots.fetches(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_server_close_frame_triggers_reconnect() {
    let Harness {
        session,
        conn,
        mut listener,
        connector,
        ..
    } = open(snapshot(0, Vec::new())).await;
    conn.close(1000, "going away");

    let _conn = handshake(&mut listener, 0).await;
    session
        .wait_for_state(|s| *s == SessionState::Ready, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(connector.attempts(), 2);
    session.close().await;
}

#[tokio::test]
async fn test_rejected_subscription_leaves_registry() {
    let Harness { session, mut conn, .. } = open(snapshot(0, Vec::new())).await;

    let server = async {
        let frame = next_frame(&mut conn).await;
        conn.send_json(&reply(&frame, "permission_denied", json!({"message": "nope"})));
    };
    let (result, ()) = tokio::join!(session.subscribe("secret", json!({})), server);

    assert_eq!(
        result,
        Err(SessionError::Rejected {
            kind: "permission_denied".into(),
            message: "nope".into(),
        })
    );
    assert_eq!(session.subscriptions(), vec![DOC_CHANNEL.to_string()]);
    assert!(matches!(
        session.unsubscribe(DOC_CHANNEL).await,
        Err(SessionError::InvalidState(_))
    ));
    session.close().await;
}

#[tokio::test]
async fn test_version_gap_refetches_snapshot_once() {
    let Harness { session, mut conn, snapshots, .. } = open(snapshot(5, vec![code("a", "1")])).await;
    snapshots.set(snapshot(8, vec![code("a", "1"), code("c", "3")]));

    // Version 6 and 7 were never delivered.
    conn.send_json(&push(
        DOC_CHANNEL,
        "new_delta_event",
        json!({
            "id": Uuid::new_v4(),
            "version": 8,
            "delta_type": "cell_contents",
            "delta_action": "replace",
            "resource_id": "a",
            "properties": {"source": "lost"}
        }),
    ));

    let resubscribe = next_frame(&mut conn).await;
    assert_eq!(resubscribe["channel"], DOC_CHANNEL);
    assert_eq!(resubscribe["data"]["from_version"], 8);
    conn.send_json(&reply(
        &resubscribe,
        "subscribe_reply",
        json!({
            "success": true,
            "deltas_to_apply": [{
                "id": Uuid::new_v4(),
                "version": 9,
                "delta_type": "nb_cells",
                "delta_action": "add",
                "properties": {
                    "id": "d",
                    "after_id": "c",
                    "cell": {"cell_type": "markdown", "source": "late", "metadata": {}}
                }
            }]
        }),
    ));

    eventually(|| session.watermark() == 9).await;
    assert_eq!(snapshots.fetches(), 2);
    assert_eq!(session.document().cell_ids(), vec!["a", "c", "d"]);
    assert_eq!(session.cell("a").unwrap().source, "1");
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await;
}

#[tokio::test]
async fn test_inconsistent_state_event_resyncs() {
    let Harness { session, mut conn, snapshots, .. } = open(snapshot(1, vec![code("a", "1")])).await;
    snapshots.set(snapshot(4, vec![markdown("z", "fresh")]));

    conn.send_json(&push(
        DOC_CHANNEL,
        "inconsistent_state_event",
        json!({"message": "diverged"}),
    ));

    let resubscribe = next_frame(&mut conn).await;
    assert_eq!(resubscribe["data"]["from_version"], 4);
    conn.send_json(&reply(&resubscribe, "subscribe_reply", json!({"success": true})));

    eventually(|| session.watermark() == 4).await;
    assert_eq!(session.document().cell_ids(), vec!["z"]);
    session.close().await;
}

#[tokio::test]
async fn test_edit_in_flight_survives_resync() {
    let Harness { session, mut conn, snapshots, .. } = open(snapshot(1, vec![code("a", "1")])).await;
    // Taken before the server recorded the new cell.
    snapshots.set(snapshot(2, vec![code("a", "1")]));

    let server = async {
        let request = next_frame(&mut conn).await;
        assert_eq!(request["event"], "new_delta_request");
        conn.send_json(&push(
            DOC_CHANNEL,
            "inconsistent_state_event",
            json!({"message": "diverged"}),
        ));

        let resubscribe = next_frame(&mut conn).await;
        assert_eq!(resubscribe["data"]["from_version"], 2);
        conn.send_json(&reply(&resubscribe, "subscribe_reply", json!({"success": true})));
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));

        let mut delta = request["data"]["delta"].clone();
        delta["version"] = json!(3);
        conn.send_json(&push(DOC_CHANNEL, "new_delta_event", delta));
    };
    let (cell, ()) = tokio::join!(session.add_cell(CellType::Code, "print(2)", None), server);

    let cell = cell.unwrap();
    assert_eq!(cell.source, "print(2)");
    assert_eq!(session.document().cell_ids(), vec!["a".to_string(), cell.id]);
    assert_eq!(session.watermark(), 3);
    session.close().await;
}

#[tokio::test]
async fn test_edit_already_in_snapshot_resolves_on_resync() {
    let Harness { session, mut conn, snapshots, .. } = open(snapshot(1, vec![code("a", "1")])).await;

    let server = async {
        let request = next_frame(&mut conn).await;
        let cell_id = request["data"]["delta"]["properties"]["id"].as_str().unwrap().to_string();
        snapshots.set(snapshot(2, vec![code("a", "1"), code(&cell_id, "print(3)")]));
        conn.send_json(&push(
            DOC_CHANNEL,
            "inconsistent_state_event",
            json!({"message": "diverged"}),
        ));

        let resubscribe = next_frame(&mut conn).await;
        conn.send_json(&reply(&resubscribe, "subscribe_reply", json!({"success": true})));
        // The server does not replay a delta the snapshot already holds.
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
    };
    let (cell, ()) = tokio::join!(session.add_cell(CellType::Code, "print(3)", None), server);

    assert_eq!(cell.unwrap().source, "print(3)");
    assert_eq!(session.watermark(), 2);
    session.close().await;
}

#[tokio::test]
async fn test_replies_resolve_out_of_order() {
    let Harness { session, mut conn, .. } = open(snapshot(0, Vec::new())).await;

    let server = async {
        let first = next_frame(&mut conn).await;
        let second = next_frame(&mut conn).await;
        for frame in [&second, &first] {
            match frame["event"].as_str().unwrap() {
                "whoami_request" => conn.send_json(&reply(
                    frame,
                    "whoami_reply",
                    json!({"user": {"id": "u1", "handle": "ada"}}),
                )),
                "ping_request" => conn.send_json(&reply(frame, "ping_reply", json!(null))),
                other => panic!("unexpected {other}"),
            };
        }
    };
    let (user, ping, ()) = tokio::join!(session.whoami(), session.ping(), server);

    assert_eq!(user.unwrap(), Some(json!({"id": "u1", "handle": "ada"})));
    assert!(ping.is_ok());
    session.close().await;
}

#[tokio::test]
async fn test_request_times_out_without_reply() {
    let mut config = config();
    config.request_timeout_ms = 50;
    let Harness { session, mut conn, .. } = open_with(config, snapshot(0, Vec::new())).await;

    let (result, frame) = tokio::join!(session.ping(), next_frame(&mut conn));
    assert_eq!(result, Err(SessionError::Timeout));

    // A late reply is ignored.
    conn.send_json(&reply(&frame, "ping_reply", json!(null)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await;
}

#[tokio::test]
async fn test_add_cell_resolves_after_broadcast() {
    let Harness { session, mut conn, .. } = open(snapshot(10, vec![code("a", "1"), markdown("b", "2")])).await;

    let server = async {
        let request = next_frame(&mut conn).await;
        assert_eq!(request["event"], "new_delta_request");
        let mut delta = request["data"]["delta"].clone();
        assert_eq!(delta["delta_type"], "nb_cells");
        assert_eq!(delta["delta_action"], "add");
        assert_eq!(delta["properties"]["after_id"], "b");
        assert_eq!(delta["file_id"], FILE_ID);

        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
        delta["version"] = json!(11);
        conn.send_json(&push(DOC_CHANNEL, "new_delta_event", delta));
    };
    let (cell, ()) = tokio::join!(session.add_cell(CellType::Code, "print(1)", None), server);

    let cell = cell.unwrap();
    assert_eq!(cell.source, "print(1)");
    let ids = session.document().cell_ids();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[2], cell.id);
    assert_eq!(session.watermark(), 11);
    session.close().await;
}

#[tokio::test]
async fn test_rejected_delta_surfaces_cause() {
    let Harness { session, mut conn, .. } = open(snapshot(0, vec![code("a", "1")])).await;

    let server = async {
        let request = next_frame(&mut conn).await;
        conn.send_json(&reply(&request, "delta_rejected", json!({"cause": "locked"})));
    };
    let (result, ()) = tokio::join!(session.delete_cell("a"), server);

    assert_eq!(
        result,
        Err(SessionError::Rejected {
            kind: "delta_rejected".into(),
            message: "locked".into(),
        })
    );
    assert_eq!(session.document().cell_ids(), vec!["a"]);
    assert!(matches!(
        session.delete_cell("missing").await,
        Err(SessionError::CellNotFound(_))
    ));
    session.close().await;
}

#[tokio::test]
async fn test_execution_completes_on_terminal_cell_state() {
    let Harness { session, mut conn, .. } = open(snapshot(0, vec![code("a", "1 + 1")])).await;

    let server = async {
        let request = next_frame(&mut conn).await;
        let delta = &request["data"]["delta"];
        assert_eq!(delta["delta_type"], "cell_execute");
        assert_eq!(delta["delta_action"], "execute");
        assert_eq!(delta["resource_id"], "a");
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
        for state in ["executing", "finished_with_no_error"] {
            conn.send_json(&push(
                "kernels/notebook-kernel-file1",
                "bulk_cell_state_update_event",
                json!({"cell_states": [{"cell_id": "a", "state": state}]}),
            ));
        }
    };
    let (handle, ()) = tokio::join!(session.queue_execution("a"), server);

    let cell = tokio::time::timeout(Duration::from_secs(1), handle.unwrap().wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell.id, "a");
    assert_eq!(cell.execution_state, ExecutionState::Complete);
    session.close().await;
}

#[tokio::test]
async fn test_deleted_cell_fails_its_execution_waiter() {
    let Harness { session, mut conn, .. } = open(snapshot(0, vec![code("a", "1 + 1")])).await;

    let server = async {
        let request = next_frame(&mut conn).await;
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
        conn.send_json(&push(
            DOC_CHANNEL,
            "new_delta_event",
            json!({
                "id": Uuid::new_v4(),
                "version": 1,
                "delta_type": "nb_cells",
                "delta_action": "delete",
                "properties": {"id": "a"}
            }),
        ));
    };
    let (handle, ()) = tokio::join!(session.queue_execution("a"), server);

    let result = handle.unwrap().wait().await;
    assert_eq!(result, Err(SessionError::CellDeleted("a".into())));
    session.close().await;
}

#[tokio::test]
async fn test_scope_without_runnable_cells_sends_nothing() {
    let Harness { session, mut conn, .. } = open(snapshot(
        0,
        vec![markdown("m", "# title"), code("blank", "   "), markdown("n", "text")],
    ))
    .await;

    let handles = session
        .queue_execution_scope(ExecuteScope::All, None)
        .await
        .unwrap();
    assert!(handles.is_empty());
    assert!(matches!(
        session.queue_execution("blank").await,
        Err(SessionError::InvalidState(_))
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(conn.try_recv().is_none());
    session.close().await;
}

#[tokio::test]
async fn test_execute_after_sends_one_delta_for_the_range() {
    let Harness { session, mut conn, .. } = open(snapshot(
        0,
        vec![code("a", "1"), code("b", "2"), markdown("m", "x"), code("c", "3")],
    ))
    .await;

    let server = async {
        let request = next_frame(&mut conn).await;
        let delta = &request["data"]["delta"];
        assert_eq!(delta["delta_action"], "execute_after");
        assert_eq!(delta["resource_id"], "b");
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
    };
    let (handles, ()) = tokio::join!(
        session.queue_execution_scope(ExecuteScope::After, Some("b")),
        server
    );

    let ids: Vec<_> = handles
        .unwrap()
        .iter()
        .map(|handle| handle.cell_id().to_string())
        .collect();
    assert_eq!(ids, vec!["b", "c"]);
    session.close().await;
}

#[tokio::test]
async fn test_callbacks_see_unrecognized_events_and_garbage_is_dropped() {
    let Harness { session, mut conn, .. } = open(snapshot(0, Vec::new())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = session.on_event(EventKind::Unrecognized, move |inbound| {
        let _ = tx.send(inbound.channel.clone());
    });

    conn.send(notebook_sync::ws::WsMessage::Text("not json".into()));
    conn.send_json(&push("custom/one", "mystery_event", json!({"a": 1})));

    let channel = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel, "custom/one");
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.remove_callback(id));

    let (ping, ()) = tokio::join!(session.ping(), async {
        let frame = next_frame(&mut conn).await;
        conn.send_json(&reply(&frame, "ping_reply", json!(null)));
    });
    assert!(ping.is_ok());
    session.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let Harness { session, mut conn, .. } = open(snapshot(0, Vec::new())).await;

    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.ping().await, Err(SessionError::Closed));
    // The server sees an orderly close.
    assert!(conn.recv_json().await.is_none());
}

#[tokio::test]
async fn test_query_type_change_writes_service_metadata() {
    let Harness { session, mut conn, .. } = open(snapshot(0, vec![code("a", "select 1")])).await;

    let change = CellTypeChange::Query {
        db_connection: None,
        assign_results_to: None,
    };
    let (cell, deltas) = tokio::join!(session.change_cell_type("a", change), accept_deltas(&mut conn, 2, 0));

    assert_eq!(deltas[0]["delta_type"], "cell_metadata");
    assert_eq!(deltas[0]["delta_action"], "replace");
    assert_eq!(deltas[0]["properties"]["language"], "sql");
    assert_eq!(deltas[1]["delta_action"], "update");
    assert_eq!(deltas[1]["properties"]["path"], json!(["noteable"]));

    let cell = cell.unwrap();
    assert_eq!(cell.cell_type, CellType::Code);
    assert!(cell.is_query());
    let service = &cell.metadata["noteable"];
    assert_eq!(service["db_connection"], "@noteable");
    assert!(service["assign_results_to"].as_str().unwrap().starts_with("df_"));
    assert_eq!(session.watermark(), 2);
    session.close().await;
}

#[tokio::test]
async fn test_patch_and_metadata_edits_round_trip() {
    let Harness { session, mut conn, .. } = open(snapshot(0, vec![code("a", "x = 1\ny = 2\n")])).await;

    let patch = TextPatch::between("x = 1\ny = 2\n", "x = 1\ny = 3\n");
    let (cell, _) = tokio::join!(session.update_cell_content("a", &patch), accept_deltas(&mut conn, 1, 0));
    assert_eq!(cell.unwrap().source, "x = 1\ny = 3\n");

    let (cell, deltas) = tokio::join!(
        session.update_cell_metadata("a", &["jupyter", "source_hidden"], json!(true)),
        accept_deltas(&mut conn, 1, 1)
    );
    assert_eq!(deltas[0]["properties"]["path"], json!(["jupyter", "source_hidden"]));
    assert_eq!(cell.unwrap().metadata["jupyter"]["source_hidden"], true);

    let bad = TextPatch::between("nothing like it", "at all");
    assert!(matches!(
        session.update_cell_content("a", &bad).await,
        Err(SessionError::InvalidState(_))
    ));
    session.close().await;
}

#[tokio::test]
async fn test_move_cell_reorders_document() {
    let Harness { session, mut conn, .. } =
        open(snapshot(0, vec![code("a", "1"), code("b", "2"), code("c", "3")])).await;

    let (moved, _) = tokio::join!(session.move_cell("c", None), accept_deltas(&mut conn, 1, 0));
    moved.unwrap();
    assert_eq!(session.document().cell_ids(), vec!["c", "a", "b"]);
    session.close().await;
}
