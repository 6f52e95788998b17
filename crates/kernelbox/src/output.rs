//! Execution output and the message fold shared by all backends.
//!
//! Both the local driver and the remote gateway deliver the same message
//! envelopes; [`OutputCollector`] folds them into one [`ExecutionOutput`]
//! so backend code only differs in transport.

use tracing::{debug, trace};

use crate::error::BoxResult;
use crate::schema::{
    ErrorContent, ExecutionResponse, ExecutionState, KernelMessage, MimeBundle, ReplyStatus,
};

/// Structured result of one code execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    /// Display data in arrival order (`execute_result`, `display_data`,
    /// and `stream` text folded in as `text/plain`).
    pub data: Vec<MimeBundle>,
    /// Error reported by the kernel, if any.
    pub error: Option<ErrorContent>,
}

impl ExecutionOutput {
    /// First `text/plain` payload, if any.
    pub fn text(&self) -> Option<&str> {
        self.data.iter().find_map(|b| b.text_plain.as_deref())
    }

    /// First `image/png` payload (base64), if any.
    pub fn png(&self) -> Option<&str> {
        self.data.iter().find_map(|b| b.image_png.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.error.is_none()
    }
}

/// Whether the collector needs more messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collect {
    Pending,
    Done,
}

/// Folds kernel messages belonging to one `execute_request` into an
/// [`ExecutionOutput`].
///
/// Folding rules, per the messaging spec:
/// - messages with a foreign `parent_header.msg_id` are ignored;
/// - `execute_input` broadcasts are ignored;
/// - `execute_result` / `display_data` append their data bundle;
/// - `stream` text is folded in as `text/plain` data;
/// - `error` (and an `execute_reply` with error status) record the error;
/// - `status: idle` completes the fold — the kernel publishes it after all
///   IOPub messages for the request.
#[derive(Debug)]
pub struct OutputCollector {
    request_msg_id: String,
    output: ExecutionOutput,
}

impl OutputCollector {
    pub fn new(request_msg_id: impl Into<String>) -> Self {
        Self {
            request_msg_id: request_msg_id.into(),
            output: ExecutionOutput::default(),
        }
    }

    /// Fold one message. Returns [`Collect::Done`] once the idle status for
    /// this request arrives.
    pub fn absorb(&mut self, response: &ExecutionResponse) -> BoxResult<Collect> {
        if response.parent_header.msg_id != self.request_msg_id {
            trace!(
                msg_id = %response.header.msg_id,
                "ignoring message from another execution"
            );
            return Ok(Collect::Pending);
        }

        match response.message()? {
            KernelMessage::Input(_) => {
                debug!("ignoring execute_input broadcast");
            }
            KernelMessage::Result(content) | KernelMessage::DisplayData(content) => {
                self.output.data.push(content.data);
            }
            KernelMessage::Stream(stream) => {
                // Stream text is appended as a `text/plain` bundle in
                // arrival order, so a stream that precedes the result is
                // what [`ExecutionOutput::text`] returns first.
                self.output.data.push(MimeBundle::text(stream.text));
            }
            KernelMessage::Error(error) => {
                self.output.error = Some(error);
            }
            KernelMessage::Reply(reply) => {
                if reply.status == ReplyStatus::Error && self.output.error.is_none() {
                    self.output.error = Some(ErrorContent {
                        ename: reply.ename.unwrap_or_default(),
                        evalue: reply.evalue.unwrap_or_default(),
                        traceback: reply.traceback.unwrap_or_default(),
                    });
                }
            }
            KernelMessage::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    return Ok(Collect::Done);
                }
            }
            KernelMessage::Other => {
                trace!(msg_type = response.msg_type(), "ignoring message type");
            }
        }
        Ok(Collect::Pending)
    }

    /// Consume the collector and return what was gathered so far.
    pub fn finish(self) -> ExecutionOutput {
        self.output
    }
}

/// Decode one raw JSON text frame into an [`ExecutionResponse`].
pub fn decode_frame(raw: &str) -> BoxResult<ExecutionResponse> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn response(parent_id: &str, msg_type: &str, content: Value) -> ExecutionResponse {
        serde_json::from_value(json!({
            "header": {"msg_id": "m1", "msg_type": msg_type},
            "parent_header": {"msg_id": parent_id, "msg_type": "execute_request"},
            "content": content,
            "channel": "iopub"
        }))
        .unwrap()
    }

    #[test]
    fn foreign_parent_messages_are_ignored() {
        let mut collector = OutputCollector::new("req-1");
        let resp = response("other-req", "stream", json!({"name": "stdout", "text": "x"}));
        assert_eq!(collector.absorb(&resp).unwrap(), Collect::Pending);
        assert!(collector.finish().is_empty());
    }

    #[test]
    fn stream_only_execution_yields_text() {
        let mut collector = OutputCollector::new("req-1");
        let stream = response("req-1", "stream", json!({"name": "stdout", "text": "hello\n"}));
        let idle = response("req-1", "status", json!({"execution_state": "idle"}));

        assert_eq!(collector.absorb(&stream).unwrap(), Collect::Pending);
        assert_eq!(collector.absorb(&idle).unwrap(), Collect::Done);

        let out = collector.finish();
        assert_eq!(out.text(), Some("hello\n"));
        assert!(out.error.is_none());
    }

    #[test]
    fn execute_result_and_stream_preserve_arrival_order() {
        let mut collector = OutputCollector::new("req-1");
        let stream = response("req-1", "stream", json!({"name": "stdout", "text": "side\n"}));
        let result = response(
            "req-1",
            "execute_result",
            json!({"data": {"text/plain": "42"}, "metadata": {}, "execution_count": 1}),
        );
        let idle = response("req-1", "status", json!({"execution_state": "idle"}));

        collector.absorb(&stream).unwrap();
        collector.absorb(&result).unwrap();
        assert_eq!(collector.absorb(&idle).unwrap(), Collect::Done);

        let out = collector.finish();
        assert_eq!(out.data.len(), 2);
        assert_eq!(out.data[0].text_plain.as_deref(), Some("side\n"));
        assert_eq!(out.data[1].text_plain.as_deref(), Some("42"));
    }

    #[test]
    fn display_data_collects_png() {
        let mut collector = OutputCollector::new("req-1");
        let display = response(
            "req-1",
            "display_data",
            json!({"data": {"image/png": "aGVsbG8="}, "metadata": {}}),
        );
        collector.absorb(&display).unwrap();
        let out = collector.finish();
        assert_eq!(out.png(), Some("aGVsbG8="));
    }

    #[test]
    fn error_message_is_recorded() {
        let mut collector = OutputCollector::new("req-1");
        let error = response(
            "req-1",
            "error",
            json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["line 1", "line 2"]
            }),
        );
        let idle = response("req-1", "status", json!({"execution_state": "idle"}));

        collector.absorb(&error).unwrap();
        assert_eq!(collector.absorb(&idle).unwrap(), Collect::Done);

        let out = collector.finish();
        let err = out.error.unwrap();
        assert_eq!(err.ename, "ZeroDivisionError");
        assert_eq!(err.traceback.len(), 2);
    }

    #[test]
    fn reply_error_is_recorded_when_no_error_message_arrived() {
        let mut collector = OutputCollector::new("req-1");
        let reply = response(
            "req-1",
            "execute_reply",
            json!({"status": "error", "ename": "NameError", "evalue": "name 'x' is not defined"}),
        );
        collector.absorb(&reply).unwrap();
        let out = collector.finish();
        assert_eq!(out.error.unwrap().ename, "NameError");
    }

    #[test]
    fn busy_status_and_execute_input_do_not_complete() {
        let mut collector = OutputCollector::new("req-1");
        let busy = response("req-1", "status", json!({"execution_state": "busy"}));
        let input = response(
            "req-1",
            "execute_input",
            json!({"code": "1 + 1", "execution_count": 1}),
        );
        assert_eq!(collector.absorb(&busy).unwrap(), Collect::Pending);
        assert_eq!(collector.absorb(&input).unwrap(), Collect::Pending);
        assert!(collector.finish().is_empty());
    }
}
