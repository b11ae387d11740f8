use super::*;
use crate::bus::{ChannelBus, MockBus};
use crate::envelope::Reply;
use crate::registry::RegistryConfig;
use crate::test_utils::{
    assert_quiet, recording_continuation, recv_within, LifecycleEvent, RecordingLifecycle,
};
use serde_json::json;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(1);
const QUIET: Duration = Duration::from_millis(50);

fn registry() -> Arc<CallbackRegistry> {
    CallbackRegistry::new(RegistryConfig::default())
}

fn envelope(value: Value) -> Envelope {
    Envelope::from_payload(&value).unwrap()
}

async fn mock_node(bus: &MockBus) -> Arc<Node> {
    Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_identity_defaults_tag_to_id() {
    let node = Node::builder(Arc::new(MockBus::new()), registry())
        .build()
        .await
        .unwrap();

    assert_eq!(node.tag_name(), node.id());
    assert_eq!(node.id().len(), crate::id::DEFAULT_ID_BYTES * 2);
}

#[tokio::test]
async fn test_builder_rejects_empty_id() {
    let result = Node::builder(Arc::new(MockBus::new()), registry())
        .id(" ")
        .build()
        .await;

    assert!(matches!(
        result,
        Err(NodeError::Registration(RegistrationError::EmptyId))
    ));
}

#[tokio::test]
async fn test_node_subscribes_to_own_id() {
    let bus = MockBus::new();
    let _node = mock_node(&bus).await;

    assert!(bus.is_subscribed("n1").await);
}

#[tokio::test]
async fn test_on_ready_fires_after_routes_bound() {
    let (lifecycle, mut events) = RecordingLifecycle::new();
    let bus = MockBus::new();

    let node = Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .lifecycle(lifecycle)
        .route(Route::from_fn("/a", |_envelope, _done| async {}).unwrap())
        .build()
        .await
        .unwrap();

    assert_eq!(events.try_recv().unwrap(), LifecycleEvent::Ready("n1".into()));
    assert!(bus.is_subscribed("/a").await);
    assert_eq!(node.routes().await, vec!["/a".to_string()]);
}

#[tokio::test]
async fn test_fire_and_forget_registers_nothing() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;

    let id = node
        .send_to("/log", envelope(json!({"line": "hi"})), None)
        .await
        .unwrap();

    assert!(id.is_none());
    assert_eq!(node.registry().pending_count().await, 0);

    let published = bus.published().await;
    assert_eq!(published.len(), 1);
    let wire: Value = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(wire, json!({"line": "hi"}));
}

#[tokio::test]
async fn test_send_with_callback_stamps_and_registers() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (continuation, _rx) = recording_continuation();

    let id = node
        .send_to("/echo", envelope(json!({"x": 1})), Some(continuation))
        .await
        .unwrap()
        .unwrap();

    assert!(node.registry().contains(&id).await);

    let published = bus.published().await;
    assert_eq!(published[0].channel, "/echo");
    let wire: Value = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(wire, json!({"x": 1, "callbackID": id, "fromPath": "n1"}));
}

#[tokio::test]
async fn test_publish_failure_discards_callback() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    bus.set_fail_on_publish(true).await;
    let (continuation, mut rx) = recording_continuation();

    let result = node
        .send_to("/echo", envelope(json!({})), Some(continuation))
        .await;

    assert!(matches!(result, Err(NodeError::Bus(BusError::Publish { .. }))));
    assert_eq!(node.registry().pending_count().await, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reply_resolves_once() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (continuation, mut rx) = recording_continuation();

    let id = node
        .send_to("/echo", envelope(json!({"x": 1})), Some(continuation))
        .await
        .unwrap()
        .unwrap();

    let reply = Reply::new(id.clone(), vec![json!({"y": 2})]).encode().unwrap();
    assert!(bus.deliver("n1", reply.clone()).await);
    assert_eq!(
        recv_within(&mut rx, WAIT).await.unwrap().unwrap(),
        vec![json!({"y": 2})]
    );

    // Duplicate delivery is a no-op
    assert!(bus.deliver("n1", reply).await);
    assert_quiet(&mut rx, QUIET).await;
    assert!(!node.registry().contains(&id).await);
}

#[tokio::test]
async fn test_malformed_reply_dropped_without_error_hook() {
    let (lifecycle, mut events) = RecordingLifecycle::new();
    let bus = MockBus::new();
    let node = Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .lifecycle(lifecycle)
        .build()
        .await
        .unwrap();
    assert!(matches!(events.recv().await, Some(LifecycleEvent::Ready(_))));

    // Handler reports the decode failure to the dispatcher, which logs it
    assert!(!bus.deliver("n1", "{not json").await);
    assert_quiet(&mut events, QUIET).await;

    // Still resolves well-formed replies afterwards
    let (continuation, mut rx) = recording_continuation();
    let id = node
        .send_to("/echo", envelope(json!({})), Some(continuation))
        .await
        .unwrap()
        .unwrap();
    bus.deliver("n1", Reply::new(id, vec![]).encode().unwrap())
        .await;
    assert!(recv_within(&mut rx, WAIT).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_route_replacement_dispatches_to_new_controller() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    let first = tx.clone();
    node.set_route("/job", move |_envelope, _done| {
        let first = first.clone();
        async move {
            let _ = first.send("old");
        }
    })
    .await
    .unwrap();

    let second = tx.clone();
    node.set_route("/job", move |_envelope, _done| {
        let second = second.clone();
        async move {
            let _ = second.send("new");
        }
    })
    .await
    .unwrap();

    bus.deliver("/job", "{}").await;

    assert_eq!(recv_within(&mut rx, WAIT).await, Some("new"));
    assert_quiet(&mut rx, QUIET).await;
    assert_eq!(node.routes().await, vec!["/job".to_string()]);
}

#[tokio::test]
async fn test_set_route_rejects_empty_path() {
    let node = mock_node(&MockBus::new()).await;

    let result = node.set_route("", |_envelope, _done| async {}).await;

    assert!(matches!(
        result,
        Err(NodeError::Registration(RegistrationError::EmptyPath))
    ));
}

#[tokio::test]
async fn test_endpoint_instance_is_owner() {
    let node = mock_node(&MockBus::new()).await;

    let endpoint = node
        .set_route("/who", |_envelope, _done| async {})
        .await
        .unwrap();

    assert_eq!(endpoint.instance().unwrap().id(), "n1");
    assert_eq!(node.get_route("/who").await.unwrap().path(), "/who");
    assert!(node.get_route("/missing").await.is_none());
}

#[tokio::test]
async fn test_endpoint_offers_done_only_with_both_fields() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();

    node.set_route("/probe", move |_envelope, done: Option<Done>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(done.is_some());
        }
    })
    .await
    .unwrap();

    bus.deliver("/probe", r#"{"callbackID":"cb"}"#).await;
    assert_eq!(recv_within(&mut rx, WAIT).await, Some(false));

    bus.deliver("/probe", r#"{"callbackID":"cb","fromPath":"x"}"#)
        .await;
    assert_eq!(recv_within(&mut rx, WAIT).await, Some(true));
}

#[tokio::test]
async fn test_malformed_request_skips_controller() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    node.set_route("/job", move |_envelope, _done| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(());
        }
    })
    .await
    .unwrap();

    assert!(!bus.deliver("/job", "not json").await);
    assert!(!bus.deliver("/job", "[1,2,3]").await);
    assert_quiet(&mut rx, QUIET).await;

    assert!(bus.deliver("/job", "{}").await);
    assert!(recv_within(&mut rx, WAIT).await.is_some());
}

#[tokio::test]
async fn test_controller_panic_is_contained() {
    let bus = MockBus::new();
    let node = mock_node(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<i64>();

    node.set_route("/fragile", move |envelope: Envelope, _done| {
        let tx = tx.clone();
        async move {
            let n = envelope.get("n").and_then(Value::as_i64).unwrap_or(0);
            if n == 0 {
                panic!("boom");
            }
            let _ = tx.send(n);
        }
    })
    .await
    .unwrap();

    bus.deliver("/fragile", r#"{"n":0}"#).await;
    bus.deliver("/fragile", r#"{"n":7}"#).await;

    assert_eq!(recv_within(&mut rx, WAIT).await, Some(7));
}

#[tokio::test]
async fn test_on_data_sees_inbound_payload() {
    let (lifecycle, mut events) = RecordingLifecycle::new();
    let bus = MockBus::new();
    let _node = Node::builder(Arc::new(bus.clone()), registry())
        .lifecycle(lifecycle)
        .route(Route::from_fn("/in", |_envelope, _done| async {}).unwrap())
        .build()
        .await
        .unwrap();
    let _ready = events.recv().await;

    bus.deliver("/in", r#"{"k":"v","callbackID":"c","fromPath":"f"}"#)
        .await;

    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::Data {
            path: "/in".into(),
            payload: json!({"k": "v"}),
        }
    );
}

#[tokio::test]
async fn test_transport_errors_reach_on_error() {
    let (lifecycle, mut events) = RecordingLifecycle::new();
    let bus = MockBus::new();
    let _node = Node::builder(Arc::new(bus.clone()), registry())
        .lifecycle(lifecycle)
        .build()
        .await
        .unwrap();
    let _ready = events.recv().await;

    bus.emit_error(BusError::Connection("reset".into()));

    assert_eq!(
        recv_within(&mut events, WAIT).await,
        Some(LifecycleEvent::Error(BusError::Connection("reset".into())))
    );
}

#[tokio::test]
async fn test_scratch_store() {
    let node = Node::builder(Arc::new(MockBus::new()), registry())
        .value("seed", json!(1))
        .build()
        .await
        .unwrap();

    node.set_value("greeting", json!("hello")).await;

    assert_eq!(node.get_value("seed").await, Some(json!(1)));
    assert_eq!(node.get_value("greeting").await, Some(json!("hello")));
    assert_eq!(node.values().await.len(), 2);
    assert_eq!(node.delete_value("greeting").await, Some(json!("hello")));
    assert_eq!(node.get_value("greeting").await, None);
}

#[tokio::test]
async fn test_close_fires_once_and_rejects_sends() {
    let (lifecycle, mut events) = RecordingLifecycle::new();
    let bus = MockBus::new();
    let node = Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .lifecycle(lifecycle)
        .build()
        .await
        .unwrap();
    let _ready = events.recv().await;

    node.close().await;
    node.close().await;

    assert_eq!(events.recv().await, Some(LifecycleEvent::Close("n1".into())));
    assert_quiet(&mut events, QUIET).await;
    assert!(node.is_closed());
    assert!(matches!(
        node.notify("/x", envelope(json!({}))).await,
        Err(NodeError::Closed(_))
    ));

    // Error feed no longer forwarded
    bus.emit_error(BusError::Closed);
    assert_quiet(&mut events, QUIET).await;
}

#[tokio::test]
async fn test_non_string_callback_id_dispatches_without_done() {
    let bus = MockBus::new();
    let (tx, mut seen) = mpsc::unbounded_channel::<bool>();
    let _node = Node::builder(Arc::new(bus.clone()), registry())
        .route(
            Route::from_fn("/job", move |_envelope, done: Option<Done>| {
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

    assert!(bus.deliver("/job", r#"{"callbackID":7,"fromPath":"n2"}"#).await);

    assert_eq!(recv_within(&mut seen, WAIT).await, Some(false));
    assert_eq!(bus.published_count().await, 0);
}

#[tokio::test]
async fn test_close_removes_bus_subscriptions() {
    let bus = MockBus::new();
    let node = Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .route(Route::from_fn("/a", |_envelope, _done| async {}).unwrap())
        .route(Route::from_fn("/b", |_envelope, _done| async {}).unwrap())
        .build()
        .await
        .unwrap();
    assert_eq!(bus.subscription_count().await, 3);

    node.close().await;

    assert_eq!(bus.subscription_count().await, 0);
    assert!(!bus.is_subscribed("n1").await);
    assert!(!bus.is_subscribed("/a").await);
}

#[tokio::test]
async fn test_closed_nodes_do_not_accumulate_on_channel_bus() {
    let channel_bus = Arc::new(ChannelBus::default());
    let bus: Arc<dyn Bus> = channel_bus.clone();

    for _ in 0..50 {
        let node = Node::builder(bus.clone(), registry())
            .route(Route::from_fn("/shared", |_envelope, _done| async {}).unwrap())
            .build()
            .await
            .unwrap();
        node.close().await;
    }

    assert_eq!(channel_bus.subscription_count().await, 0);
}

#[tokio::test]
async fn test_close_keeps_other_nodes_on_shared_path() {
    let bus = MockBus::new();
    let (tx, mut calls) = mpsc::unbounded_channel::<()>();
    let controller = move |_envelope: Envelope, _done: Option<Done>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(());
        }
    };
    let leaving = Node::builder(Arc::new(bus.clone()), registry())
        .route(Route::from_fn("/job", controller.clone()).unwrap())
        .build()
        .await
        .unwrap();
    let _staying = Node::builder(Arc::new(bus.clone()), registry())
        .route(Route::from_fn("/job", controller).unwrap())
        .build()
        .await
        .unwrap();

    leaving.close().await;
    assert!(bus.deliver("/job", "{}").await);

    assert!(recv_within(&mut calls, WAIT).await.is_some());
    assert_quiet(&mut calls, QUIET).await;
}

#[tokio::test]
async fn test_failed_build_leaves_nothing_subscribed() {
    let bus = MockBus::new();
    bus.refuse_subscriptions_to("/bad").await;

    let result = Node::builder(Arc::new(bus.clone()), registry())
        .id("n1")
        .route(Route::from_fn("/good", |_envelope, _done| async {}).unwrap())
        .route(Route::from_fn("/bad", |_envelope, _done| async {}).unwrap())
        .build()
        .await;

    assert!(matches!(result, Err(NodeError::Bus(BusError::Subscribe { .. }))));
    assert_eq!(bus.subscription_count().await, 0);
    assert!(!bus.is_subscribed("n1").await);
}

#[tokio::test]
async fn test_request_round_trip_over_channel_bus() {
    let bus: Arc<dyn Bus> = Arc::new(ChannelBus::default());
    let registry = registry();

    let _echo = Node::builder(bus.clone(), registry.clone())
        .route(
            Route::from_fn("/echo", |envelope: Envelope, done: Option<Done>| async move {
                let x = envelope.get("x").and_then(Value::as_i64).unwrap_or(0);
                if let Some(done) = done {
                    let _ = done.send(&json!({"y": x + 1})).await;
                }
            })
            .unwrap(),
        )
        .build()
        .await
        .unwrap();

    let caller = Node::builder(bus, registry.clone()).build().await.unwrap();

    let params = caller
        .request("/echo", envelope(json!({"x": 1})), Some(WAIT))
        .await
        .unwrap();

    assert_eq!(params, vec![json!({"y": 2})]);
    assert_eq!(registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let node = mock_node(&MockBus::new()).await;

    let result = node
        .request("/void", envelope(json!({})), Some(Duration::from_millis(30)))
        .await;

    assert!(matches!(
        result,
        Err(NodeError::Callback(CallbackError::Timeout { .. }))
    ));
    assert_eq!(node.registry().pending_count().await, 0);
}
