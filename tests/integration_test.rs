// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests over the bus: create a conversation, drive a turn
/// with the mock generator, and watch the typed stream land in storage.
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use freja::{App, AppOptions, GenEvent, Generator, Paths};
use freja_workers::generate::MockGenerator;

fn mock_factory(reply: &str) -> freja::GeneratorFactory {
    let script: Vec<GenEvent> = {
        let mut events: Vec<GenEvent> = reply
            .chars()
            .map(|c| GenEvent::TextDelta(c.to_string()))
            .collect();
        events.push(GenEvent::Done);
        events
    };
    Box::new(move |_model| Ok(Arc::new(MockGenerator::new(script.clone())) as Arc<dyn Generator>))
}

async fn test_app(reply: &str) -> (App, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new(AppOptions::new(
        Paths::under(tmp.path()),
        mock_factory(reply),
    ))
    .await
    .unwrap();
    (app, tmp)
}

async fn create_conversation(app: &App, workspace: &str) -> String {
    let reply = app
        .bus
        .call(
            "conversation:create",
            json!({
                "name": "itest",
                "type": "integrated",
                "extra": {"workspace": workspace},
                "model": {"id": "model-x"}
            }),
        )
        .await;
    assert!(reply.success, "create failed: {:?}", reply.msg);
    reply.data.unwrap()["id"].as_str().unwrap().to_string()
}

async fn messages_of(app: &App, id: &str) -> Vec<Value> {
    let reply = app
        .bus
        .call(
            "database:getConversationMessages",
            json!({"conversationId": id, "page": 1, "pageSize": 100}),
        )
        .await;
    assert!(reply.success);
    reply.data.unwrap()["data"].as_array().unwrap().clone()
}

/// Poll until `predicate` holds over the conversation's messages.
async fn wait_for_messages(
    app: &App,
    id: &str,
    predicate: impl Fn(&[Value]) -> bool,
) -> Vec<Value> {
    for _ in 0..400 {
        let messages = messages_of(app, id).await;
        if predicate(&messages) {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held for conversation {id}");
}

#[tokio::test]
async fn send_message_streams_and_persists() {
    let (app, _tmp) = test_app("all done").await;
    let id = create_conversation(&app, "/tmp/ws-int").await;

    let reply = app
        .bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "please refactor", "msg_id": "turn-1"}),
        )
        .await;
    assert!(reply.success, "send failed: {:?}", reply.msg);

    let messages = wait_for_messages(&app, &id, |messages| {
        messages.iter().any(|m| {
            m["content"]["type"] == "text"
                && m["content"]["content"] == "all done"
                && m["status"] == "finish"
        })
    })
    .await;

    // The user's message is on the right, the reply on the left.
    assert!(messages
        .iter()
        .any(|m| m["position"] == "right" && m["content"]["content"] == "please refactor"));

    app.shutdown().await;
}

#[tokio::test]
async fn response_stream_mirrors_events_to_subscribers() {
    let (app, _tmp) = test_app("hi").await;
    let id = create_conversation(&app, "/tmp/ws-stream").await;

    let mut events = app.bus.subscribe();
    app.bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "hello", "msg_id": "turn-1"}),
        )
        .await;

    let mut kinds = Vec::new();
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(event)) if event.channel == "conversation:responseStream" => {
                let kind = event.payload["type"].as_str().unwrap_or("").to_string();
                let done = kind == "finish";
                kinds.push(kind);
                if done {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(kinds.contains(&"user_content".to_string()));
    assert!(kinds.contains(&"content".to_string()));
    assert!(kinds.contains(&"finish".to_string()));
}

#[tokio::test]
async fn model_change_kills_worker_and_next_send_rebuilds() {
    let (app, _tmp) = test_app("ok").await;
    let id = create_conversation(&app, "/tmp/ws-model").await;

    // A turn ran, so a worker is registered.
    app.bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "first", "msg_id": "t1"}),
        )
        .await;
    wait_for_messages(&app, &id, |m| {
        m.iter()
            .any(|m| m["status"] == "finish" && m["content"]["type"] == "text")
    })
    .await;
    assert!(app.services.manager.get_task_by_id(&id).await.is_some());

    // Switching the model kills the worker...
    let reply = app
        .bus
        .call(
            "conversation:update",
            json!({"id": id, "updates": {"model": {"id": "model-y"}}}),
        )
        .await;
    assert!(reply.success);
    assert!(app.services.manager.get_task_by_id(&id).await.is_none());

    // ...and the next send lazily rebuilds it.
    let reply = app
        .bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "second", "msg_id": "t2"}),
        )
        .await;
    assert!(reply.success, "rebuild send failed: {:?}", reply.msg);
    assert!(app.services.manager.get_task_by_id(&id).await.is_some());
}

#[tokio::test]
async fn update_without_changes_only_advances_modify_time() {
    let (app, _tmp) = test_app("x").await;
    let id = create_conversation(&app, "/tmp/ws-touch").await;

    let before = app
        .bus
        .call("conversation:get", json!({"id": id}))
        .await
        .data
        .unwrap();
    let reply = app
        .bus
        .call("conversation:update", json!({"id": id, "updates": {}}))
        .await;
    assert!(reply.success);
    let after = reply.data.unwrap();

    assert_eq!(before["name"], after["name"]);
    assert_eq!(after["model"], before["model"]);
    let stamp = |v: &Value| {
        chrono::DateTime::parse_from_rfc3339(v["modify_time"].as_str().unwrap()).unwrap()
    };
    assert!(stamp(&after) > stamp(&before));
}

#[tokio::test]
async fn workspace_migration_moves_messages_and_deletes_source() {
    let (app, _tmp) = test_app("answer").await;
    let source = create_conversation(&app, "/tmp/ws-old").await;

    // Put some history in the source.
    app.bus
        .call(
            "conversation:sendMessage",
            json!({"id": source, "input": "history", "msg_id": "t1"}),
        )
        .await;
    wait_for_messages(&app, &source, |m| {
        m.iter()
            .any(|m| m["status"] == "finish" && m["content"]["type"] == "text")
    })
    .await;
    let source_count = messages_of(&app, &source).await.len();
    assert!(source_count >= 2);

    let reply = app
        .bus
        .call(
            "conversation:createWithConversation",
            json!({
                "conversation": {
                    "name": "moved",
                    "type": "integrated",
                    "extra": {"workspace": "/tmp/ws-new"},
                },
                "sourceConversationId": source,
            }),
        )
        .await;
    assert!(reply.success, "migration failed: {:?}", reply.msg);
    let data = reply.data.unwrap();
    assert_eq!(data["sourceDeleted"], true);
    let target = data["conversation"]["id"].as_str().unwrap().to_string();

    // All messages moved; the source row is gone.
    assert_eq!(messages_of(&app, &target).await.len(), source_count);
    let gone = app.bus.call("conversation:get", json!({"id": source})).await;
    assert!(!gone.success);
}

#[tokio::test]
async fn get_associate_conversation_finds_same_workspace() {
    let (app, _tmp) = test_app("x").await;
    let a = create_conversation(&app, "/tmp/ws-shared").await;
    let _b = create_conversation(&app, "/tmp/ws-other").await;

    let reply = app
        .bus
        .call(
            "conversation:getAssociateConversation",
            json!({"workspace": "/tmp/ws-shared"}),
        )
        .await;
    assert!(reply.success);
    let found = reply.data.unwrap();
    let ids: Vec<&str> = found
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![a.as_str()]);
}

#[tokio::test]
async fn remove_deletes_conversation_and_messages() {
    let (app, _tmp) = test_app("bye").await;
    let id = create_conversation(&app, "/tmp/ws-del").await;
    app.bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "hello", "msg_id": "t1"}),
        )
        .await;
    wait_for_messages(&app, &id, |m| !m.is_empty()).await;

    let reply = app.bus.call("conversation:remove", json!({"id": id})).await;
    assert!(reply.success);

    assert!(app.services.manager.get_task_by_id(&id).await.is_none());
    assert!(messages_of(&app, &id).await.is_empty());
}

#[tokio::test]
async fn system_info_reports_host_facts() {
    let (app, _tmp) = test_app("x").await;
    let reply = app.bus.call("system:systemInfo", json!({})).await;
    assert!(reply.success);
    let info = reply.data.unwrap();
    assert_eq!(info["platform"], std::env::consts::OS);
    assert_eq!(info["arch"], std::env::consts::ARCH);

    // Overrides persist and win.
    let reply = app
        .bus
        .call("system:updateSystemInfo", json!({"workDir": "/custom"}))
        .await;
    assert!(reply.success);
    let info = app
        .bus
        .call("system:systemInfo", json!({}))
        .await
        .data
        .unwrap();
    assert_eq!(info["workDir"], "/custom");
}

#[tokio::test]
async fn busy_worker_rejects_and_reports_tips() {
    // A generator that never finishes keeps the first turn in flight.
    struct Slow;
    #[async_trait::async_trait]
    impl Generator for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn generate(
            &self,
            _req: freja::GenRequest,
        ) -> anyhow::Result<freja_workers::generate::GenStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let factory: freja::GeneratorFactory =
        Box::new(|_| Ok(Arc::new(Slow) as Arc<dyn Generator>));
    let app = App::new(AppOptions::new(Paths::under(tmp.path()), factory))
        .await
        .unwrap();
    let id = create_conversation(&app, "/tmp/ws-busy").await;

    let first = app
        .bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "one", "msg_id": "t1"}),
        )
        .await;
    assert!(first.success);

    let second = app
        .bus
        .call(
            "conversation:sendMessage",
            json!({"id": id, "input": "two", "msg_id": "t2"}),
        )
        .await;
    assert!(!second.success);
    assert!(second.msg.unwrap().contains("turn is already in flight"));

    // The failure surfaced in the conversation as a center tips row.
    let messages = wait_for_messages(&app, &id, |m| {
        m.iter().any(|m| m["content"]["type"] == "tips")
    })
    .await;
    assert!(messages
        .iter()
        .any(|m| m["content"]["type"] == "tips" && m["position"] == "center"));

    app.shutdown().await;
}
