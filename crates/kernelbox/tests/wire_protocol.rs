//! End-to-end message folding against raw gateway-style JSON frames,
//! exercised through the public API only.

use kernelbox::output::Collect;
use kernelbox::{
    clean_ansi_codes, BoxError, CreateKernelRequest, ExecutionRequest, OutputCollector,
};
use serde_json::json;

fn frame(parent_id: &str, msg_type: &str, content: serde_json::Value) -> String {
    json!({
        "header": {"msg_id": "srv-1", "msg_type": msg_type, "session": "sess-1"},
        "parent_header": {"msg_id": parent_id, "msg_type": "execute_request"},
        "msg_type": msg_type,
        "metadata": {},
        "content": content,
        "buffers": [],
        "channel": "iopub"
    })
    .to_string()
}

#[test]
fn full_message_sequence_folds_into_output() {
    let request = ExecutionRequest::of_code("print('hi'); 42");
    let msg_id = request.msg_id().to_string();
    let mut collector = OutputCollector::new(&msg_id);

    let frames = [
        frame(&msg_id, "status", json!({"execution_state": "busy"})),
        frame(&msg_id, "execute_input", json!({"code": "print('hi'); 42", "execution_count": 1})),
        frame(&msg_id, "stream", json!({"name": "stdout", "text": "hi\n"})),
        frame(
            &msg_id,
            "execute_result",
            json!({"data": {"text/plain": "42"}, "metadata": {}, "execution_count": 1}),
        ),
        frame("someone-else", "stream", json!({"name": "stdout", "text": "noise"})),
        frame(&msg_id, "execute_reply", json!({"status": "ok", "execution_count": 1})),
        frame(&msg_id, "status", json!({"execution_state": "idle"})),
    ];

    let mut done = false;
    for raw in &frames {
        let response = serde_json::from_str(raw).expect("valid frame");
        if collector.absorb(&response).expect("absorb") == Collect::Done {
            done = true;
        }
    }
    assert!(done, "idle status must complete the fold");

    let out = collector.finish();
    assert_eq!(out.data.len(), 2, "foreign stream frame must be ignored");
    assert_eq!(out.data[0].text_plain.as_deref(), Some("hi\n"));
    assert_eq!(out.data[1].text_plain.as_deref(), Some("42"));
    assert!(out.error.is_none());
}

#[test]
fn error_sequence_maps_to_execution_error() {
    let request = ExecutionRequest::of_code("1 / 0");
    let msg_id = request.msg_id().to_string();
    let mut collector = OutputCollector::new(&msg_id);

    let frames = [
        frame(&msg_id, "status", json!({"execution_state": "busy"})),
        frame(
            &msg_id,
            "error",
            json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["\u{1b}[31mTraceback (most recent call last)\u{1b}[0m"]
            }),
        ),
        frame(&msg_id, "status", json!({"execution_state": "idle"})),
    ];

    for raw in &frames {
        let response = serde_json::from_str(raw).expect("valid frame");
        collector.absorb(&response).expect("absorb");
    }

    let out = collector.finish();
    let error = out.error.expect("error recorded");
    let err = BoxError::from_error_content(error);
    assert_eq!(err.to_string(), "Traceback (most recent call last)");
    assert_eq!(
        clean_ansi_codes("\u{1b}[31mdivision by zero\u{1b}[0m"),
        "division by zero"
    );
}

#[test]
fn create_kernel_request_round_trips_through_json() {
    let mut env = std::collections::BTreeMap::new();
    env.insert("KERNEL_ID".to_string(), json!("kid-9"));
    env.insert("KERNEL_VOLUMES".to_string(), json!([{"name": "scratch"}]));
    let request = CreateKernelRequest::with_env(env);

    let body = serde_json::to_value(&request).expect("serialize");
    assert_eq!(body["env"]["KERNEL_ID"], "kid-9");
    // Structured volume values travel as JSON-encoded strings.
    assert_eq!(body["env"]["KERNEL_VOLUMES"], r#"[{"name":"scratch"}]"#);
    assert!(body.get("name").is_none());

    let back: CreateKernelRequest = serde_json::from_value(body).expect("deserialize");
    assert_eq!(back, request);
}
