//! End-to-end scenarios against the public `Fabric` / `Agent` API.

use agentfabric_kernel::{AgentContext, AgentRuntime, BoxError, Fabric, ReceiveMode};
use agentfabric_types::agent::{AgentId, AgentState};
use agentfabric_types::config::FabricConfig;
use agentfabric_types::error::{ErrorKind, FabricError};
use agentfabric_types::event::EventPayload;
use agentfabric_types::fabric::FabricStatus;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fabric_with_capacity(capacity: usize) -> Fabric {
    Fabric::new(FabricConfig {
        channel_capacity: capacity,
        send_timeout_ms: 100,
        receive_timeout_ms: 100,
        ..FabricConfig::default()
    })
}

fn short_wait() -> ReceiveMode {
    ReceiveMode::Blocking {
        timeout: Duration::from_millis(30),
    }
}

// ─── Basic scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_connect_relay_disconnect_unregister() {
    let fabric = Fabric::default();
    fabric.register("A", "nlp").unwrap();
    let b = fabric.register("B", "vision").unwrap();

    fabric.connect("A", "B").unwrap();
    fabric.relay("A", "B", "hello").await.unwrap();

    let msg = b.receive(ReceiveMode::NonBlocking).await.unwrap().unwrap();
    assert_eq!(msg.payload, "hello");
    assert_eq!(msg.from.as_str(), "A");
    assert_eq!(msg.to.as_str(), "B");

    let report = fabric.disconnect("A", "B").unwrap();
    assert_eq!(report.discarded, 0);

    let record = fabric.unregister("A").unwrap();
    assert_eq!(record.domain, "nlp");
    assert_eq!(fabric.agent_count(), 1);
}

#[tokio::test]
async fn test_unknown_peer_is_not_found() {
    let fabric = Fabric::default();
    fabric.register("A", "nlp").unwrap();

    let err = fabric.connect("A", "ghost").unwrap_err();
    assert_eq!(err, FabricError::NotFound(AgentId::from("ghost")));

    let err = fabric.relay("A", "ghost", "x").await.unwrap_err();
    assert_eq!(err, FabricError::NotFound(AgentId::from("ghost")));
    assert!(fabric.neighbors("A").unwrap().is_empty());
}

#[test]
fn test_double_connect_keeps_one_edge() {
    let fabric = Fabric::default();
    fabric.register("A", "nlp").unwrap();
    fabric.register("B", "vision").unwrap();

    fabric.connect("A", "B").unwrap();
    let err = fabric.connect("A", "B").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConnected);

    let snapshot = fabric.snapshot();
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.channels, 1);
    assert_eq!(
        snapshot.agent("A").unwrap().resources.active_connections,
        1
    );
}

#[tokio::test]
async fn test_shared_neighbor_does_not_route() {
    let fabric = Fabric::default();
    for id in ["A", "B", "C"] {
        fabric.register(id, "nlp").unwrap();
    }
    fabric.connect("A", "B").unwrap();
    fabric.connect("B", "C").unwrap();

    let err = fabric.relay("A", "C", "via B?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(fabric.snapshot().pending_messages, 0);
}

#[test]
fn test_connect_disconnect_round_trip() {
    let fabric = Fabric::default();
    fabric.register("A", "nlp").unwrap();
    fabric.register("B", "vision").unwrap();
    fabric.register("C", "audio").unwrap();
    fabric.connect("B", "C").unwrap();

    let before = fabric.snapshot();
    fabric.connect("A", "B").unwrap();
    fabric.disconnect("A", "B").unwrap();
    let after = fabric.snapshot();

    assert_eq!(before.connections, after.connections);
    assert_eq!(before.channels, after.channels);
    for (x, y) in before.agents.iter().zip(after.agents.iter()) {
        assert_eq!(x.resources, y.resources);
    }
}

// ─── Messaging ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fifo_per_direction_under_concurrent_senders() {
    let fabric = Arc::new(Fabric::new(FabricConfig {
        channel_capacity: 8,
        ..FabricConfig::default()
    }));
    let hub = fabric.register("hub", "router").unwrap();
    for id in ["s1", "s2", "s3"] {
        fabric.register(id, "sensor").unwrap();
        fabric.connect(id, "hub").unwrap();
    }

    let mut tasks = Vec::new();
    for id in ["s1", "s2", "s3"] {
        let fabric = fabric.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                fabric
                    .relay_with_cancel(id, "hub", format!("{i}"), &CancellationToken::new())
                    .await
                    .unwrap();
            }
        }));
    }

    let mut last: std::collections::HashMap<String, i64> = Default::default();
    for _ in 0..150 {
        let msg = hub
            .receive(ReceiveMode::Blocking {
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap()
            .unwrap();
        let n: i64 = msg.payload.parse().unwrap();
        let prev = last.insert(msg.from.to_string(), n).unwrap_or(-1);
        assert_eq!(n, prev + 1, "out of order from {}", msg.from);
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(hub.try_receive().is_none());
}

#[tokio::test]
async fn test_receive_oldest_across_senders() {
    let fabric = Fabric::default();
    let a = fabric.register("a", "nlp").unwrap();
    for id in ["b", "c"] {
        fabric.register(id, "nlp").unwrap();
        fabric.connect("a", id).unwrap();
    }
    fabric.relay("c", "a", "first").await.unwrap();
    fabric.relay("b", "a", "second").await.unwrap();
    fabric.relay("c", "a", "third").await.unwrap();

    let order: Vec<String> = std::iter::from_fn(|| a.try_receive())
        .map(|m| m.payload)
        .collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_agent_send_reaches_peer() {
    let fabric = Fabric::default();
    let a = fabric.register("a", "nlp").unwrap();
    fabric.register("b", "vision").unwrap();

    let err = a.send("b", "too early").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoChannel);

    fabric.connect("a", "b").unwrap();
    a.send("b", "hi").await.unwrap();
    let msg = fabric
        .receive("b", fabric.blocking_receive_mode())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, "hi");
}

#[tokio::test]
async fn test_full_queue_times_out_without_dropping() {
    let fabric = fabric_with_capacity(2);
    let b = fabric.register("b", "vision").unwrap();
    fabric.register("a", "nlp").unwrap();
    fabric.connect("a", "b").unwrap();

    fabric.relay("a", "b", "1").await.unwrap();
    fabric.relay("a", "b", "2").await.unwrap();
    let err = fabric.relay("a", "b", "3").await.unwrap_err();
    assert_eq!(
        err,
        FabricError::Timeout {
            operation: "send",
            waited_ms: 100,
        }
    );

    assert_eq!(b.pending(), 2);
    assert_eq!(b.try_receive().unwrap().payload, "1");
    fabric.relay("a", "b", "3").await.unwrap();
    assert_eq!(b.try_receive().unwrap().payload, "2");
    assert_eq!(b.try_receive().unwrap().payload, "3");
}

#[tokio::test]
async fn test_blocked_relay_resumes_after_receive() {
    let fabric = Arc::new(fabric_with_capacity(1));
    let b = fabric.register("b", "vision").unwrap();
    fabric.register("a", "nlp").unwrap();
    fabric.connect("a", "b").unwrap();
    fabric.relay("a", "b", "1").await.unwrap();

    let pending = {
        let fabric = fabric.clone();
        tokio::spawn(async move { fabric.relay("a", "b", "2").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(b.try_receive().unwrap().payload, "1");
    pending.await.unwrap().unwrap();
    assert_eq!(b.try_receive().unwrap().payload, "2");
}

#[tokio::test]
async fn test_blocking_receive_wakes_on_arrival() {
    let fabric = Arc::new(Fabric::default());
    let b = fabric.register("b", "vision").unwrap();
    fabric.register("a", "nlp").unwrap();
    fabric.connect("a", "b").unwrap();

    let waiter = tokio::spawn(async move {
        b.receive(ReceiveMode::Blocking {
            timeout: Duration::from_secs(5),
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    fabric.relay("a", "b", "wake").await.unwrap();

    let msg = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(msg.payload, "wake");
}

#[tokio::test]
async fn test_cancelled_receive_leaves_messages() {
    let fabric = Arc::new(Fabric::default());
    let b = fabric.register("b", "vision").unwrap();
    fabric.register("a", "nlp").unwrap();
    fabric.connect("a", "b").unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let b = b.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            b.receive_with_cancel(
                ReceiveMode::Blocking {
                    timeout: Duration::from_secs(5),
                },
                &cancel,
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    fabric.relay("a", "b", "after").await.unwrap();
    let msg = b.receive(short_wait()).await.unwrap().unwrap();
    assert_eq!(msg.payload, "after");
}

#[tokio::test]
async fn test_disconnect_wakes_blocked_sender() {
    let fabric = fabric_with_capacity(1);
    let a = fabric.register("a", "nlp").unwrap();
    fabric.register("b", "vision").unwrap();
    fabric.connect("a", "b").unwrap();
    fabric.relay("a", "b", "stuck").await.unwrap();

    let sender = tokio::spawn(async move { a.send("b", "blocked").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = fabric.disconnect("a", "b").unwrap();
    assert_eq!(report.discarded, 1);
    let err = sender.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoChannel);
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Fails initialization until `ready` is set.
struct GatedRuntime {
    ready: AtomicBool,
}

#[async_trait]
impl AgentRuntime for GatedRuntime {
    async fn initialize(&self, ctx: &AgentContext) -> Result<(), BoxError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(format!("{} backend unavailable", ctx.domain).into())
        }
    }
}

#[tokio::test]
async fn test_failed_activation_degrades_fabric_until_retry() {
    let fabric = Fabric::default();
    let runtime = Arc::new(GatedRuntime {
        ready: AtomicBool::new(false),
    });
    fabric
        .register_with_runtime("ocr", "vision", runtime.clone())
        .unwrap();
    let mut events = fabric.subscribe();

    let err = fabric.activate("ocr").await.unwrap_err();
    assert_eq!(
        err,
        FabricError::InitializationFailure {
            id: AgentId::from("ocr"),
            reason: "vision backend unavailable".to_string(),
        }
    );
    assert_eq!(fabric.status(), FabricStatus::Degraded);
    let record = fabric.snapshot().agent("ocr").cloned().unwrap();
    assert_eq!(record.state, AgentState::Error);
    assert_eq!(record.last_error.as_deref(), Some("vision backend unavailable"));

    runtime.ready.store(true, Ordering::SeqCst);
    fabric.activate("ocr").await.unwrap();
    assert_eq!(fabric.status(), FabricStatus::Online);

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventPayload::Lifecycle { from, to, .. } = event.payload {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (AgentState::Idle, AgentState::Activating),
            (AgentState::Activating, AgentState::Error),
            (AgentState::Error, AgentState::Activating),
            (AgentState::Activating, AgentState::Active),
        ]
    );
}

struct SlowRuntime;

#[async_trait]
impl AgentRuntime for SlowRuntime {
    async fn initialize(&self, _ctx: &AgentContext) -> Result<(), BoxError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_activation_does_not_block_fabric() {
    let fabric = Arc::new(Fabric::default());
    fabric
        .register_with_runtime("slow", "llm", Arc::new(SlowRuntime))
        .unwrap();

    let activation = {
        let fabric = fabric.clone();
        tokio::spawn(async move { fabric.activate("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Registry traffic proceeds while the runtime initializes.
    fabric.register("fast", "nlp").unwrap();
    fabric.connect("fast", "slow").unwrap();
    let err = fabric.activate("slow").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransitionInProgress);

    activation.await.unwrap().unwrap();
    assert_eq!(
        fabric.agent("slow").unwrap().state(),
        AgentState::Active
    );
}

#[tokio::test]
async fn test_deactivated_agent_keeps_connection() {
    let fabric = Fabric::default();
    let a = fabric.register("a", "nlp").unwrap();
    let b = fabric.register("b", "vision").unwrap();
    fabric.connect("a", "b").unwrap();
    fabric.activate("b").await.unwrap();
    fabric.deactivate("b").await.unwrap();

    // b released its ports, so its own sends fail...
    let err = b.send("a", "x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoChannel);
    // ...but the connection and a's side are intact.
    assert!(fabric.is_connected("a", "b"));
    a.send("b", "queued").await.unwrap();
    assert_eq!(fabric.snapshot().pending_messages, 1);

    fabric.activate("b").await.unwrap();
    assert_eq!(b.try_receive().unwrap().payload, "queued");
}

#[tokio::test]
async fn test_connection_made_while_inactive_waits_for_activation() {
    let fabric = Fabric::default();
    let a = fabric.register("a", "nlp").unwrap();
    fabric.register("b", "vision").unwrap();
    let c = fabric.register("c", "speech").unwrap();
    fabric.connect("a", "b").unwrap();
    fabric.activate("a").await.unwrap();
    fabric.deactivate("a").await.unwrap();

    fabric.connect("a", "c").unwrap();
    assert!(fabric.is_connected("a", "c"));
    assert_eq!(a.resources().active_connections, 2);
    assert!(a.peers().is_empty());
    for peer in ["b", "c"] {
        let err = a.send(peer, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoChannel);
    }
    // The peer side and fabric relay still use the new channel.
    assert!(c.has_port("a"));
    fabric.relay("c", "a", "hello").await.unwrap();

    fabric.activate("a").await.unwrap();
    assert_eq!(a.peers(), vec![AgentId::from("b"), AgentId::from("c")]);
    a.send("c", "back").await.unwrap();
    assert_eq!(c.try_receive().unwrap().payload, "back");
    assert_eq!(a.try_receive().unwrap().payload, "hello");
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_cancels_blocked_waits() {
    let fabric = Arc::new(fabric_with_capacity(1));
    let b = fabric.register("b", "vision").unwrap();
    fabric.register("a", "nlp").unwrap();
    fabric.connect("a", "b").unwrap();

    let receiver = tokio::spawn(async move {
        b.receive(ReceiveMode::Blocking {
            timeout: Duration::from_secs(5),
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fabric.shutdown(), 0);
    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    assert_eq!(fabric.status(), FabricStatus::Offline);
    assert_eq!(fabric.unregister("a").unwrap_err(), FabricError::Offline);
    let history = fabric.events().history(1);
    assert_eq!(history[0].payload, EventPayload::Shutdown { discarded: 0 });
}

#[tokio::test]
async fn test_snapshot_serializes_for_observers() {
    let fabric = Fabric::default();
    let a = fabric.register("a", "nlp").unwrap();
    fabric.register("b", "vision").unwrap();
    fabric.connect("a", "b").unwrap();
    a.record_usage(1.5, 64.0).unwrap();
    fabric.refresh_usage();
    fabric.relay("a", "b", "queued").await.unwrap();

    let json = serde_json::to_value(fabric.snapshot()).unwrap();
    assert_eq!(json["status"], "online");
    assert_eq!(json["agents"][0]["id"], "a");
    assert_eq!(json["agents"][0]["state"], "idle");
    assert_eq!(json["agents"][1]["resources"]["active_connections"], 1);
    assert_eq!(json["connections"][0][1], "b");
    assert_eq!(json["pending_messages"], 1);
    assert_eq!(json["resource_usage"]["cpu"], 1.5);
}
