//! Request/reply correlation across services sharing one bus.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{assert_quiet, channel_context, continuation, recv_within, WAIT};
use serde_json::{json, Value};
use switchboard::bus::{Bus, ChannelBus, LossyBus, LossyConfig};
use switchboard::registry::{CallbackError, CallbackRegistry, RegistryConfig};
use switchboard::{Done, Envelope, Route, Service};
use tokio::sync::mpsc;

fn envelope(value: Value) -> Envelope {
    Envelope::from_payload(&value).unwrap()
}

fn echo_route() -> Route {
    Route::from_fn("/echo", |envelope: Envelope, done: Option<Done>| async move {
        let x = envelope.get("x").and_then(Value::as_i64).unwrap_or(0);
        if let Some(done) = done {
            let _ = done.send(&json!({"y": x + 1})).await;
        }
    })
    .unwrap()
}

fn square_route() -> Route {
    Route::from_fn("/job", |envelope: Envelope, done: Option<Done>| async move {
        let n = envelope.get("n").and_then(Value::as_i64).unwrap_or(0);
        if let Some(done) = done {
            let _ = done.send(&json!({"result": n * n})).await;
        }
    })
    .unwrap()
}

#[tokio::test]
async fn test_round_trip_invokes_callback_once() {
    let ctx = channel_context();
    let _echo = Service::builder("echo", ctx.bus.clone(), ctx.registry.clone())
        .route(echo_route())
        .build()
        .await
        .unwrap();
    let caller = Service::builder("caller", ctx.bus.clone(), ctx.registry.clone())
        .build()
        .await
        .unwrap();

    let (cb, mut rx) = continuation();
    caller
        .send_to("/echo", envelope(json!({"x": 1})), Some(cb))
        .await
        .unwrap();

    let params = recv_within(&mut rx, WAIT).await.unwrap().unwrap();
    assert_eq!(params, vec![json!({"y": 2})]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_scenario_square_job_between_two_services() {
    let ctx = channel_context();
    let svc_b = Service::builder("svcB", ctx.bus.clone(), ctx.registry.clone())
        .id("B1")
        .route(square_route())
        .build()
        .await
        .unwrap();
    let svc_a = Service::builder("svcA", ctx.bus.clone(), ctx.registry.clone())
        .id("A1")
        .build()
        .await
        .unwrap();
    assert_eq!(svc_b.id(), "B1");

    let (cb, mut rx) = continuation();
    let callback_id = svc_a
        .send_to("/job", envelope(json!({"n": 5})), Some(cb))
        .await
        .unwrap()
        .unwrap();

    let params = recv_within(&mut rx, WAIT).await.unwrap().unwrap();
    assert_eq!(params, vec![json!({"result": 25})]);
    assert!(!svc_a.registry().contains(&callback_id).await);
    assert_eq!(svc_a.registry().pending_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_reply_is_ignored() {
    let ctx = channel_context();
    let caller = Service::builder("caller", ctx.bus.clone(), ctx.registry.clone())
        .id("caller-1")
        .build()
        .await
        .unwrap();

    let (cb, mut rx) = continuation();
    let callback_id = caller
        .send_to("/nowhere", envelope(json!({})), Some(cb))
        .await
        .unwrap()
        .unwrap();

    let reply = json!({"callbackID": callback_id, "params": [1]}).to_string();
    ctx.bus.publish("caller-1", reply.clone()).await.unwrap();
    ctx.bus.publish("caller-1", reply).await.unwrap();

    assert_eq!(recv_within(&mut rx, WAIT).await.unwrap().unwrap(), vec![json!(1)]);
    assert_quiet(&mut rx).await;
    assert!(!ctx.registry.contains(&callback_id).await);
}

#[tokio::test]
async fn test_fire_and_forget_never_registers() {
    let ctx = channel_context();
    let (tx, mut seen) = mpsc::unbounded_channel::<bool>();
    let _sink = Service::builder("sink", ctx.bus.clone(), ctx.registry.clone())
        .route(
            Route::from_fn("/sink", move |_envelope, done: Option<Done>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(done.is_some());
                }
            })
            .unwrap(),
        )
        .build()
        .await
        .unwrap();
    let caller = Service::builder("caller", ctx.bus.clone(), ctx.registry.clone())
        .build()
        .await
        .unwrap();

    let id = caller
        .send_to("/sink", envelope(json!({"k": 1})), None)
        .await
        .unwrap();

    assert!(id.is_none());
    // The endpoint got no reply capability
    assert_eq!(recv_within(&mut seen, WAIT).await, Some(false));
    assert_eq!(ctx.registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_publish_to_unknown_path_has_no_effect() {
    let ctx = channel_context();
    let caller = Service::builder("caller", ctx.bus.clone(), ctx.registry.clone())
        .build()
        .await
        .unwrap();

    let result = caller.notify("/nobody/home", envelope(json!({"x": 1}))).await;

    assert!(result.is_ok());
    assert_eq!(ctx.registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_malformed_payload_does_not_reach_controller() {
    let ctx = channel_context();
    let (tx, mut calls) = mpsc::unbounded_channel::<Value>();
    let _svc = Service::builder("svc", ctx.bus.clone(), ctx.registry.clone())
        .route(
            Route::from_fn("/job", move |envelope: Envelope, _done| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Value::Object(envelope.payload));
                }
            })
            .unwrap(),
        )
        .build()
        .await
        .unwrap();

    ctx.bus
        .publish("/job", "this is not json".to_string())
        .await
        .unwrap();
    assert_quiet(&mut calls).await;

    // The node keeps serving
    ctx.bus
        .publish("/job", r#"{"ok":true}"#.to_string())
        .await
        .unwrap();
    assert_eq!(recv_within(&mut calls, WAIT).await, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_timeout_without_reply_removes_entry() {
    let ctx = channel_context();
    let caller = Service::builder("caller", ctx.bus.clone(), ctx.registry.clone())
        .build()
        .await
        .unwrap();

    let (cb, mut rx) = continuation();
    let started = Instant::now();
    let callback_id = caller
        .send_to_with_timeout(
            "/silent",
            envelope(json!({})),
            Duration::from_millis(100),
            cb,
        )
        .await
        .unwrap();

    let outcome = recv_within(&mut rx, WAIT).await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(CallbackError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1500));
    assert!(!ctx.registry.contains(&callback_id).await);
}

#[tokio::test]
async fn test_registry_default_timeout_applies_to_send_to() {
    let bus: Arc<dyn Bus> = Arc::new(ChannelBus::default());
    let registry = CallbackRegistry::new(RegistryConfig {
        default_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let caller = Service::builder("caller", bus, registry.clone())
        .build()
        .await
        .unwrap();

    let (cb, mut rx) = continuation();
    caller
        .send_to("/silent", envelope(json!({})), Some(cb))
        .await
        .unwrap();

    assert!(matches!(
        recv_within(&mut rx, WAIT).await,
        Some(Err(CallbackError::Timeout { .. }))
    ));
    assert_eq!(registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_route_replacement_on_live_bus() {
    let ctx = channel_context();
    let svc = Service::builder("svc", ctx.bus.clone(), ctx.registry.clone())
        .route(echo_route())
        .build()
        .await
        .unwrap();

    svc.set_route("/echo", |_envelope, done: Option<Done>| async move {
        if let Some(done) = done {
            let _ = done.send(&json!("replaced")).await;
        }
    })
    .await
    .unwrap();

    let params = svc
        .request("/echo", envelope(json!({"x": 1})), Some(WAIT))
        .await
        .unwrap();

    assert_eq!(params, vec![json!("replaced")]);
}

#[tokio::test]
async fn test_dropped_replies_end_in_timeout() {
    let base = ChannelBus::default();
    let registry = CallbackRegistry::new(RegistryConfig::default());

    // The responder's publishes, including replies, are all lost
    let lossy: Arc<dyn Bus> = Arc::new(LossyBus::new(
        base.linked(),
        LossyConfig::drop_all().with_logging(false),
    ));
    let _echo = Service::builder("echo", lossy, registry.clone())
        .route(echo_route())
        .build()
        .await
        .unwrap();

    let caller = Service::builder("caller", Arc::new(base), registry.clone())
        .build()
        .await
        .unwrap();

    let result = caller
        .request("/echo", envelope(json!({"x": 1})), Some(Duration::from_millis(150)))
        .await;

    assert!(matches!(
        result,
        Err(switchboard::NodeError::Callback(CallbackError::Timeout { .. }))
    ));
    assert_eq!(registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_duplicated_replies_invoke_once() {
    let base = ChannelBus::default();
    let registry = CallbackRegistry::new(RegistryConfig::default());

    let lossy = Arc::new(LossyBus::new(base.linked(), LossyConfig::duplicate_all()));
    let _echo = Service::builder("echo", lossy.clone(), registry.clone())
        .route(echo_route())
        .build()
        .await
        .unwrap();

    let caller = Service::builder("caller", Arc::new(base), registry.clone())
        .build()
        .await
        .unwrap();

    let (cb, mut rx) = continuation();
    caller
        .send_to("/echo", envelope(json!({"x": 41})), Some(cb))
        .await
        .unwrap();

    assert_eq!(
        recv_within(&mut rx, WAIT).await.unwrap().unwrap(),
        vec![json!({"y": 42})]
    );
    assert_quiet(&mut rx).await;
    assert_eq!(lossy.stats().duplicated(), 1);
    assert_eq!(registry.pending_count().await, 0);
}
