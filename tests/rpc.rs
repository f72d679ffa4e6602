//! JSON call dispatch through the native bridge.

mod common;

use futures::StreamExt;
use llmstream_core::{
    engine::ScriptedBackend,
    events::BridgeEvent,
    rpc::{RpcCall, RpcReply},
};
use serde_json::{json, Value};

use common::{hello_backend, uninitialized};

fn call(id: u64, method: &str, params: Value) -> RpcCall {
    serde_json::from_value(json!({"id": id, "method": method, "params": params})).unwrap()
}

fn create_params() -> Value {
    json!({
        "maxTokens": 512,
        "topK": 40,
        "temperature": 0.8,
        "randomSeed": 0,
        "accelerator": "CPU"
    })
}

fn error_code(reply: &RpcReply) -> &str {
    reply.error.as_ref().map(|e| e.code.as_str()).unwrap_or("")
}

#[tokio::test]
async fn test_full_bridge_session() {
    let test = uninitialized(hello_backend());
    let bridge = test.bridge();

    let reply = bridge.handle_call(call(1, "generateResponse", json!({"requestId": 1, "prompt": "Hello"}))).await;
    assert_eq!(error_code(&reply), "E_NO_MODEL");

    let reply = bridge.handle_call(call(2, "createModel", create_params())).await;
    assert_eq!(reply.result, Some(json!("Model Creation Successful")));

    let reply = bridge.handle_call(call(3, "generateResponse", json!({"requestId": 1, "prompt": "Hello"}))).await;
    let result = reply.result.unwrap();
    assert_eq!(result["response"], "Hello there");
    assert!(result["requestId"].is_u64());

    let reply = bridge.handle_call(call(4, "closeSession", Value::Null)).await;
    assert_eq!(reply.result, Some(json!(true)));
    let reply = bridge.handle_call(call(5, "generateResponse", json!({"prompt": "Hello"}))).await;
    assert_eq!(error_code(&reply), "E_NO_MODEL");

    let reply = bridge.handle_call(call(6, "createModel", create_params())).await;
    assert_eq!(reply.result, Some(json!("Model already created")));

    let reply = bridge.handle_call(call(7, "resetSession", Value::Null)).await;
    assert_eq!(reply.result, Some(json!("Session reset")));

    let reply = bridge.handle_call(call(8, "closeEngine", Value::Null)).await;
    assert_eq!(reply.id, 8);
    assert_eq!(reply.result, Some(json!(true)));

    let reply = bridge.handle_call(call(9, "generateResponse", json!({"prompt": "Hello"}))).await;
    assert_eq!(error_code(&reply), "E_NO_MODEL");
}

#[tokio::test]
async fn test_caller_request_ids_are_not_reused() {
    let test = uninitialized(ScriptedBackend::new());
    let bridge = test.bridge();
    bridge.create_model(512, 40, 0.8, 0, "cpu").await.unwrap();

    // Callers that always send id 1 still get distinct ids back
    let first = bridge.handle_call(call(1, "generateResponse", json!({"requestId": 1, "prompt": "a"}))).await;
    let second = bridge.handle_call(call(2, "generateResponse", json!({"requestId": 1, "prompt": "b"}))).await;

    let first_id = first.result.unwrap()["requestId"].as_u64().unwrap();
    let second_id = second.result.unwrap()["requestId"].as_u64().unwrap();
    assert!(second_id > first_id);
}

#[tokio::test]
async fn test_event_stream_matches_wire_names() {
    let test = uninitialized(hello_backend());
    let bridge = test.bridge();
    bridge.create_model(512, 40, 0.8, 0, "CPU").await.unwrap();

    let events = bridge.events();
    let response = bridge.generate_response("Hello").await.unwrap();

    let encoded: Vec<Value> = events
        .take(4)
        .map(|event: BridgeEvent| serde_json::to_value(&event).unwrap())
        .collect()
        .await;
    let names: Vec<&str> = encoded.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec!["onPartialResponse", "onPartialResponse", "onPartialResponse", "onCompleteResponse"]
    );
    assert_eq!(encoded[0]["partial"], "He");
    assert_eq!(encoded[3]["requestId"], json!(response.request_id.0));
    assert_eq!(encoded[3]["response"], "Hello there");
}

#[tokio::test]
async fn test_invalid_create_parameters() {
    let test = uninitialized(ScriptedBackend::new());
    let bridge = test.bridge();

    let mut params = create_params();
    params["topK"] = json!(0);
    let reply = bridge.handle_call(call(1, "createModel", params)).await;
    assert_eq!(error_code(&reply), "E_MODEL_CREATION");

    let mut params = create_params();
    params["accelerator"] = json!("NPU");
    let reply = bridge.handle_call(call(2, "createModel", params)).await;
    assert_eq!(error_code(&reply), "E_MODEL_CREATION");
    assert_eq!(test.backend.load_count(), 0);
}

#[tokio::test]
async fn test_listener_hooks_and_cancel() {
    let test = uninitialized(ScriptedBackend::new());
    let bridge = test.bridge();

    let reply = bridge.handle_call(call(1, "addListener", json!({"eventName": "onPartialResponse"}))).await;
    assert_eq!(reply.result, Some(Value::Null));
    let reply = bridge.handle_call(call(2, "removeListeners", json!({"count": 1}))).await;
    assert_eq!(reply.result, Some(Value::Null));

    let reply = bridge.handle_call(call(3, "cancelGenerateResponse", json!({"requestId": 424242}))).await;
    assert_eq!(reply.result, Some(json!(false)));

    assert!(bridge.add_listener("logging").is_ok());
    assert_eq!(bridge.add_listener("onUnknown").err().unwrap().code, "E_INVALID_ARGUMENT");
}
