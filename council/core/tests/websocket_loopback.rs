//! Loopback tests over a real WebSocket
//!
//! A `CouncilServer` on 127.0.0.1 and a `ChatClient` talking to it.
//! Tests cover:
//! - A full turn reconciled on the client
//! - Local rejection while not connected
//! - Connection drop mid-turn, reconnect, and a clean follow-up turn
//! - A reconnect the owner never polled does not orphan the next turn

#![cfg(feature = "websocket")]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use council_core::{
    Applied, ChannelError, ChannelState, ChatClient, ClientConfig, ClientUpdate, CouncilServer,
    DispatchConfig, Dispatcher, InMemoryHistory, ModelId, ResponseStatus, ScriptStep, ScriptedBackend,
    ScriptedModel, ServerConfig, UsageLedger,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningServer {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}

async fn serve_on(listener: TcpListener, backend: ScriptedBackend) -> RunningServer {
    let dispatcher = Dispatcher::new(
        Arc::new(backend),
        Arc::new(InMemoryHistory::new()),
        Arc::new(UsageLedger::new()),
        DispatchConfig::default(),
    );
    let server = CouncilServer::new(ServerConfig::default(), dispatcher);
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let task = tokio::spawn(async move { server.serve(listener, flag).await });
    RunningServer { shutdown, task }
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        url: format!("ws://{addr}/chat/ws"),
        reconnect_delay: Duration::from_millis(50),
    }
}

fn ids(models: &[&str]) -> Vec<ModelId> {
    models.iter().map(|m| ModelId::from(*m)).collect()
}

#[tokio::test]
async fn full_turn_reconciled_over_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = ScriptedBackend::new()
        .with_model(ScriptedModel::replying("m1", ["Hi", " there"]))
        .with_model(
            ScriptedModel::new("m2")
                .then(ScriptStep::Token("Hel".into()))
                .then(ScriptStep::Fail("rate limited".into())),
        );
    let server = serve_on(listener, backend).await;

    let mut client = ChatClient::connect(&client_config(addr));
    let err = client.submit("too early", ids(&["m1"])).await.unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));
    assert!(!client.reconciler().is_pending());

    assert!(tokio::time::timeout(TEST_TIMEOUT, client.wait_open()).await.unwrap());
    client.submit("Say hi", ids(&["m1", "m2"])).await.unwrap();
    let last = tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(last, Some(ClientUpdate::Applied(Applied::TurnCompleted)));

    let turn = client.reconciler().turns()[0].clone();
    assert_eq!(turn.user_message.content, "Say hi");
    assert_eq!(turn.responses.len(), 2);
    assert_eq!(turn.responses[0].content, "Hi there");
    assert_eq!(turn.responses[0].status, ResponseStatus::Success);
    assert_eq!(turn.responses[1].content, "Hel");
    assert_eq!(turn.responses[1].error.as_deref(), Some("rate limited"));

    // Server-assigned ids make responses addressable
    let best = turn.responses[0].id.clone();
    assert!(client.select_best(&best).unwrap().is_selected);

    // Follow-up continues the same conversation
    let conversation = client.reconciler().conversation_id().cloned();
    client.submit("Again", ids(&["m1"])).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(client.reconciler().turns().len(), 2);
    assert_eq!(client.reconciler().conversation_id().cloned(), conversation);

    server.stop().await;
}

#[tokio::test]
async fn rejected_request_surfaces_as_turn_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = serve_on(listener, ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["x"]))).await;

    let mut client = ChatClient::connect(&client_config(addr));
    assert!(tokio::time::timeout(TEST_TIMEOUT, client.wait_open()).await.unwrap());
    client.submit("hello", ids(&["nope"])).await.unwrap();

    let last = tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(
        last,
        Some(ClientUpdate::Applied(Applied::TurnRejected("Unknown model: nope".into())))
    );
    assert!(!client.reconciler().is_pending());
    assert!(client.reconciler().turns().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn drop_mid_turn_leaves_turn_unresolved_then_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first = serve_on(
        listener,
        ScriptedBackend::new()
            .with_model(ScriptedModel::replying("m1", ["done"]))
            .with_model(ScriptedModel::silent("m2")),
    )
    .await;

    let mut client = ChatClient::connect(&client_config(addr));
    assert!(tokio::time::timeout(TEST_TIMEOUT, client.wait_open()).await.unwrap());
    client.submit("question", ids(&["m1", "m2"])).await.unwrap();

    // Wait for m1 to finish while m2 hangs
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(update) = client.next().await {
            if update == ClientUpdate::Applied(Applied::Finalized("m1".into())) {
                break;
            }
        }
    })
    .await
    .unwrap();

    first.stop().await;
    let update = tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(update, Some(ClientUpdate::State(ChannelState::Disconnected)));
    assert!(client.reconciler().turns().is_empty());
    assert_eq!(client.reconciler().unresolved().len(), 1);
    let stale = &client.reconciler().unresolved()[0];
    assert_eq!(stale.responses[0].content, "done");
    assert_eq!(stale.responses[1].status, ResponseStatus::Streaming);

    // Same address, fresh server
    let listener = TcpListener::bind(addr).await.unwrap();
    let second = serve_on(listener, ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["fresh"]))).await;

    assert!(tokio::time::timeout(TEST_TIMEOUT, client.wait_open()).await.unwrap());
    client.submit("next", ids(&["m1"])).await.unwrap();
    let last = tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(last, Some(ClientUpdate::Applied(Applied::TurnCompleted)));

    assert_eq!(client.reconciler().turns().len(), 1);
    assert_eq!(client.reconciler().turns()[0].responses[0].content, "fresh");
    assert_eq!(client.reconciler().unresolved().len(), 1);

    second.stop().await;
}

#[tokio::test]
async fn stale_disconnect_does_not_orphan_turn_on_new_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first = serve_on(listener, ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["old"]))).await;

    let mut client = ChatClient::connect(&client_config(addr));
    assert!(tokio::time::timeout(TEST_TIMEOUT, client.wait_open()).await.unwrap());

    // Drop and come back while nobody polls the client
    first.stop().await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        while client.state() == ChannelState::Open {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let second = serve_on(listener, ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["hello", " back"]))).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        while client.state() != ChannelState::Open {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The close of the first connection is still queued
    client.submit("hello", ids(&["m1"])).await.unwrap();
    let last = tokio::time::timeout(TEST_TIMEOUT, client.finish_turn()).await.unwrap();
    assert_eq!(last, Some(ClientUpdate::Applied(Applied::TurnCompleted)));

    assert!(client.reconciler().unresolved().is_empty());
    let turns = client.reconciler().turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].user_message.content, "hello");
    assert_eq!(turns[0].responses[0].content, "hello back");

    second.stop().await;
}
