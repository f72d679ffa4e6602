//! Request routing and streaming behaviour through the session manager.

mod common;

use std::time::Duration;

use futures::StreamExt;
use llmstream_core::{
    engine::ScriptedBackend,
    events::{BridgeEvent, EventKind, RequestId},
    router::{CollectingSink, GenerateOptions, RequestState, StreamChunk},
    RequestError,
};

use common::{assert_quiet, collect_events, hello_backend, ready, wait_idle};

#[tokio::test]
async fn test_hello_streams_partials_then_completes() {
    let bridge = ready(hello_backend()).await;
    let mut handle = bridge.manager.generate_response("Hello").unwrap();
    let request_id = handle.request_id();

    let mut partials = Vec::new();
    while let Some(delta) = handle.next_partial().await {
        partials.push(delta);
    }
    let response = handle.finish().await.unwrap();

    assert_eq!(partials, vec!["He", "llo ", "there"]);
    assert_eq!(response.response, "Hello there");
    assert_eq!(response.request_id, request_id);
}

#[tokio::test]
async fn test_partials_concatenate_to_response() {
    let bridge = ready(ScriptedBackend::new()).await;

    for prompt in ["one", "two words", "and then three"] {
        let mut sink = CollectingSink::new();
        let response = bridge
            .manager
            .generate_with_sink(prompt, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.text(), response.response);
        assert!(sink.errors.is_empty());
    }
}

#[tokio::test]
async fn test_exactly_one_terminal_event() {
    let bridge = ready(hello_backend()).await;
    let mut listener = bridge.manager.events().add_listener(None);

    let response = bridge.manager.generate("Hello").await.unwrap();

    let events = collect_events(&mut listener, 4).await;
    assert_eq!(events.len(), 4);
    assert!(events[..3].iter().all(|e| e.kind() == EventKind::PartialResponse));
    assert_eq!(
        events[3],
        BridgeEvent::Complete {
            request_id: response.request_id,
            response: "Hello there".into(),
        }
    );
    assert_quiet(&mut listener).await;
    assert_eq!(bridge.manager.events().subscriber_count(), 0);
    assert_eq!(bridge.manager.router().request_state(response.request_id), None);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_interleave() {
    let backend = ScriptedBackend::new()
        .with_reply("first", ["a1 ", "a2 ", "a3"])
        .with_reply("second", ["b1 ", "b2 ", "b3"])
        .with_token_delay(Duration::from_millis(5));
    let bridge = ready(backend).await;
    let mut partial_events = bridge
        .manager
        .events()
        .add_listener(Some(EventKind::PartialResponse));

    let first = bridge.manager.generate_response("first").unwrap();
    let second = bridge.manager.generate_response("second").unwrap();
    let (first_id, second_id) = (first.request_id(), second.request_id());
    assert!(second_id > first_id);

    let (first_partials, second_partials) = tokio::join!(
        first.collect::<Vec<String>>(),
        second.collect::<Vec<String>>()
    );
    assert_eq!(first_partials, vec!["a1 ", "a2 ", "a3"]);
    assert_eq!(second_partials, vec!["b1 ", "b2 ", "b3"]);

    // FIFO: every token of the first request precedes the second's
    let order: Vec<RequestId> = collect_events(&mut partial_events, 6)
        .await
        .iter()
        .filter_map(BridgeEvent::request_id)
        .collect();
    assert_eq!(
        order,
        vec![first_id, first_id, first_id, second_id, second_id, second_id]
    );
}

#[tokio::test]
async fn test_generation_failure_is_isolated() {
    let backend = ScriptedBackend::new()
        .with_reply("Hello", ["He", "llo ", "there"])
        .fail_after("boom", 1, "kernel fault");
    let bridge = ready(backend).await;

    let failing = bridge.manager.generate_response("boom").unwrap();
    let healthy = bridge.manager.generate_response("Hello").unwrap();

    let mut sink = CollectingSink::new();
    let failed = failing.drive(&mut sink).await;
    assert_eq!(
        failed,
        Err(RequestError::Generation("kernel fault".into()))
    );
    assert_eq!(sink.partials, vec!["Echo: "]);
    assert_eq!(sink.errors.len(), 1);

    assert_eq!(healthy.finish().await.unwrap().response, "Hello there");

    let stats = bridge.manager.stats();
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_cancel_leaves_session_reusable() {
    let backend = ScriptedBackend::new()
        .with_reply("long", ["t1 ", "t2 ", "t3 ", "t4 ", "t5 ", "t6 ", "t7 ", "t8"])
        .with_token_delay(Duration::from_millis(20));
    let bridge = ready(backend).await;
    let mut errors = bridge
        .manager
        .events()
        .add_listener(Some(EventKind::ErrorResponse));

    let mut handle = bridge.manager.generate_response("long").unwrap();
    let request_id = handle.request_id();
    assert_eq!(handle.next_partial().await.as_deref(), Some("t1 "));

    handle.cancel();
    assert_eq!(handle.finish().await, Err(RequestError::Cancelled));
    assert_eq!(bridge.manager.router().request_state(request_id), None);

    let events = collect_events(&mut errors, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].request_id(), Some(request_id));

    // The stopped turn leaves no residue in the conversation
    let next = bridge.manager.generate("next").await.unwrap();
    assert_eq!(next.response, "Echo: next");
    assert_eq!(bridge.manager.stats().cancelled, 1);
}

#[tokio::test]
async fn test_cancel_queued_request() {
    let backend = ScriptedBackend::new()
        .with_reply("slow", ["s1 ", "s2 ", "s3"])
        .with_token_delay(Duration::from_millis(20));
    let bridge = ready(backend.clone()).await;

    let running = bridge.manager.generate_response("slow").unwrap();
    let queued = bridge.manager.generate_response("queued").unwrap();
    assert_eq!(
        bridge.manager.router().request_state(queued.request_id()),
        Some(RequestState::Pending)
    );
    assert!(bridge.manager.cancel(queued.request_id()));

    assert_eq!(running.finish().await.unwrap().response, "s1 s2 s3");
    assert_eq!(queued.finish().await, Err(RequestError::Cancelled));
    // Only the running request ever reached the engine
    assert_eq!(backend.generation_count(), 1);
}

#[tokio::test]
async fn test_queued_request_times_out_without_waiting() {
    let backend = ScriptedBackend::new()
        .with_reply("long", ["x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x"])
        .with_token_delay(Duration::from_millis(100));
    let bridge = ready(backend.clone()).await;

    let running = bridge.manager.generate_response("long").unwrap();
    let queued = bridge
        .manager
        .generate_with_options("queued", GenerateOptions::with_timeout(Duration::from_millis(50)))
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), queued.finish())
        .await
        .expect("queued request should time out while the first one streams");
    assert_eq!(result, Err(RequestError::Timeout(Duration::from_millis(50))));
    assert_eq!(
        bridge.manager.router().request_state(running.request_id()),
        Some(RequestState::Streaming)
    );
    assert_eq!(bridge.manager.stats().timed_out, 1);

    running.cancel();
    assert_eq!(running.finish().await, Err(RequestError::Cancelled));
    wait_idle(&bridge.manager).await;
    assert_eq!(backend.generation_count(), 1);
}

#[tokio::test]
async fn test_cancelled_queued_request_resolves_immediately() {
    let backend = ScriptedBackend::new()
        .with_reply("long", ["x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x"])
        .with_token_delay(Duration::from_millis(100));
    let bridge = ready(backend).await;

    let running = bridge.manager.generate_response("long").unwrap();
    let queued = bridge.manager.generate_response("queued").unwrap();
    queued.cancel();

    let result = tokio::time::timeout(Duration::from_millis(500), queued.finish())
        .await
        .expect("cancelled request should not wait for the first one");
    assert_eq!(result, Err(RequestError::Cancelled));
    assert_eq!(
        bridge.manager.router().request_state(running.request_id()),
        Some(RequestState::Streaming)
    );

    running.cancel();
    assert_eq!(running.finish().await, Err(RequestError::Cancelled));
}

#[tokio::test]
async fn test_timeout_rejects_and_stops_generation() {
    let backend = ScriptedBackend::new()
        .with_reply("stall", ["x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x ", "x"])
        .with_token_delay(Duration::from_millis(50));
    let bridge = ready(backend).await;

    let handle = bridge
        .manager
        .generate_with_options("stall", GenerateOptions::with_timeout(Duration::from_millis(30)))
        .unwrap();
    assert_eq!(
        handle.finish().await,
        Err(RequestError::Timeout(Duration::from_millis(30)))
    );
    assert_eq!(bridge.manager.stats().timed_out, 1);

    let after = bridge.manager.generate("after").await.unwrap();
    assert_eq!(after.response, "Echo: after");
}

#[tokio::test]
async fn test_configured_default_timeout() {
    let backend = ScriptedBackend::new()
        .with_reply("stall", ["x ", "x ", "x ", "x ", "x"])
        .with_token_delay(Duration::from_millis(400));
    let bridge = common::with_settings(backend, |settings| {
        settings.router.request_timeout_secs = Some(1);
    });
    bridge.manager.create_default_model().await.unwrap();

    let result = bridge.manager.generate("stall").await;
    assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(1))));
}

#[tokio::test]
async fn test_close_engine_fails_in_flight_with_closed() {
    let backend = ScriptedBackend::new()
        .with_reply("long", ["t1 ", "t2 ", "t3 ", "t4 ", "t5 ", "t6"])
        .with_token_delay(Duration::from_millis(20));
    let bridge = ready(backend).await;

    let mut in_flight = bridge.manager.generate_response("long").unwrap();
    let queued = bridge.manager.generate_response("queued").unwrap();
    assert!(in_flight.next_partial().await.is_some());

    bridge.manager.close_engine().await.unwrap();

    assert_eq!(in_flight.finish().await, Err(RequestError::Closed));
    assert_eq!(queued.finish().await, Err(RequestError::Closed));
    assert_eq!(bridge.manager.router().pending(), 0);
    assert_eq!(bridge.manager.events().subscriber_count(), 0);
}

#[tokio::test]
async fn test_reset_session_fails_in_flight_with_closed() {
    let backend = ScriptedBackend::new()
        .with_reply("long", ["t1 ", "t2 ", "t3 ", "t4"])
        .with_token_delay(Duration::from_millis(20));
    let bridge = ready(backend).await;

    let mut in_flight = bridge.manager.generate_response("long").unwrap();
    assert!(in_flight.next_partial().await.is_some());

    bridge.manager.reset_session().await.unwrap();
    assert_eq!(in_flight.finish().await, Err(RequestError::Closed));
    wait_idle(&bridge.manager).await;

    assert_eq!(bridge.manager.generate("hi").await.unwrap().response, "Echo: hi");
}

#[tokio::test]
async fn test_callbacks_and_stream_forms() {
    let bridge = ready(hello_backend()).await;

    let mut partials = Vec::new();
    let mut errors = Vec::new();
    let text = bridge
        .manager
        .generate_with_callbacks(
            "Hello",
            |delta, _| partials.push(delta.to_string()),
            |message, _| errors.push(message.to_string()),
        )
        .await
        .unwrap();
    assert_eq!(text, "Hello there");
    assert_eq!(partials.concat(), text);
    assert!(errors.is_empty());

    let chunks: Vec<StreamChunk> = bridge
        .manager
        .generate_response("Hello")
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[0], StreamChunk::Partial("He".into()));
    assert!(matches!(&chunks[3], StreamChunk::Done(r) if r.response == "Hello there"));
}
