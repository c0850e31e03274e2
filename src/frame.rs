//! Frame types crossing the data channel and the kernel wire.
//!
//! Frames are passed through verbatim, so both directions are modeled as
//! [`serde_json::Value`] wrapped in accessor types rather than fully typed
//! structs. Only the routing-relevant fields (`action`, ids, Jupyter header
//! hints) are ever inspected.

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Jupyter sub-channels multiplexed over a kernel's single wire connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Main request channel: execution, completion, introspection.
    Shell,
    /// Out-of-band requests: interrupt, restart, shutdown.
    Control,
    /// Replies to kernel-initiated input requests.
    Stdin,
    /// Broadcast side effects: streams, display data, status.
    Iopub,
}

impl Channel {
    /// Map a message type to the sub-channel it must be sent on.
    ///
    /// Unknown request types default to shell, matching what JupyterLab
    /// itself does.
    pub fn for_msg_type(msg_type: &str) -> Channel {
        match msg_type {
            "execute_request" | "kernel_info_request" | "complete_request" | "inspect_request"
            | "history_request" | "is_complete_request" | "comm_info_request" | "comm_msg"
            | "comm_close" => Channel::Shell,
            "interrupt_request" | "restart_request" | "shutdown_request" => Channel::Control,
            "input_reply" => Channel::Stdin,
            _ => Channel::Shell,
        }
    }

    /// The channel name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Stdin => "stdin",
            Channel::Iopub => "iopub",
        }
    }
}

/// A frame received from a peer over its data channel.
///
/// Every frame is a JSON object with at least an `action` field; the rest of
/// the payload is action-specific and carried opaquely.
#[derive(Clone, Debug)]
pub struct PeerFrame(Value);

impl PeerFrame {
    /// Parse a frame from raw channel bytes. Non-object JSON is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, crate::Error> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| crate::Error::MalformedFrame(err.to_string()))?;
        if !value.is_object() {
            return Err(crate::Error::MalformedFrame("frame is not an object".into()));
        }
        Ok(Self(value))
    }

    /// Wrap an already-parsed value.
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// The `action` tag, if present.
    pub fn action(&self) -> Option<&str> {
        self.0.get("action").and_then(Value::as_str)
    }

    /// The peer-chosen logical session id.
    pub fn instance_id(&self) -> Option<&str> {
        self.0.get("instanceId").and_then(Value::as_str)
    }

    /// The kernel the frame claims to target.
    pub fn kernel_id(&self) -> Option<&str> {
        self.0.get("kernelId").and_then(Value::as_str)
    }

    /// The client correlation id used for HTTP proxy replies.
    pub fn msg_id_tag(&self) -> Option<&str> {
        self.0.get("msgId").and_then(Value::as_str)
    }

    /// The document targeted by a collaborative-sync frame.
    pub fn document_id(&self) -> Option<&str> {
        self.0.get("documentId").and_then(Value::as_str)
    }

    /// Explicit sub-channel requested by the client, if any.
    pub fn channel(&self) -> Option<&str> {
        self.0.get("channel").and_then(Value::as_str)
    }

    /// The wrapped Jupyter message in the `data` field.
    pub fn data(&self) -> Option<KernelFrame<'_>> {
        self.0.get("data").map(KernelFrame)
    }

    /// Stamp the authenticated sender onto the frame before dispatch.
    ///
    /// A `client_id` arriving from the wire is never trusted; it is always
    /// overwritten here.
    pub fn set_client_id(&mut self, peer_id: &str) {
        if let Some(obj) = self.0.as_object_mut() {
            obj.insert("client_id".into(), Value::String(peer_id.into()));
        }
    }

    /// Borrow the underlying JSON value.
    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Borrowed view of a Jupyter-format message (the five-part message with
/// `header`, `parent_header`, `metadata`, `content`, `buffers`).
#[derive(Copy, Clone, Debug)]
pub struct KernelFrame<'a>(pub &'a Value);

impl<'a> KernelFrame<'a> {
    fn header_field(&self, key: &str) -> Option<&'a str> {
        self.0.get("header")?.get(key)?.as_str()
    }

    /// `header.msg_id`.
    pub fn msg_id(&self) -> Option<&'a str> {
        self.header_field("msg_id")
    }

    /// `header.msg_type`.
    pub fn msg_type(&self) -> Option<&'a str> {
        self.header_field("msg_type")
    }

    /// `header.session`.
    pub fn session(&self) -> Option<&'a str> {
        self.header_field("session")
    }

    /// `parent_header.msg_id`, the reply-correlation hint.
    pub fn parent_msg_id(&self) -> Option<&'a str> {
        self.0.get("parent_header")?.get("msg_id")?.as_str()
    }

    /// `parent_header.session`. Kernel replies carry the requester's session
    /// here, while their own header names the kernel's session.
    pub fn parent_session(&self) -> Option<&'a str> {
        self.0.get("parent_header")?.get("session")?.as_str()
    }

    /// `content.comm_id` for widget comm traffic.
    pub fn comm_id(&self) -> Option<&'a str> {
        self.0.get("content")?.get("comm_id")?.as_str()
    }

    /// `content.target_name` on a `comm_open`.
    pub fn comm_target(&self) -> Option<&'a str> {
        self.0.get("content")?.get("target_name")?.as_str()
    }

    /// The `channel` field Jupyter attaches to wire messages.
    pub fn channel(&self) -> Option<&'a str> {
        self.0.get("channel").and_then(Value::as_str)
    }
}

/// Current time as an ISO 8601 string, the timestamp format used on frames.
pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Build a gateway-originated Jupyter request message.
///
/// Used for internal traffic such as the widget preflight cell; peers build
/// their own headers client-side.
pub fn kernel_request(msg_type: &str, content: Value) -> Value {
    json!({
        "header": {
            "msg_id": Uuid::new_v4().to_string(),
            "session": "nbgate-session",
            "username": "nbgate",
            "date": timestamp(),
            "msg_type": msg_type,
            "version": "5.4",
        },
        "parent_header": {},
        "metadata": {},
        "content": content,
        "buffers": [],
    })
}

/// Frame carrying a kernel message back to the instance that owns it.
pub fn websocket_message(instance_id: &str, kernel_id: &str, data: &Value, channel: &str) -> Value {
    json!({
        "action": "websocket_message",
        "instanceId": instance_id,
        "kernelId": kernel_id,
        "data": data,
        "channel": channel,
        "timestamp": timestamp(),
    })
}

/// Acknowledgement that a kernel link is open for an instance. `comms`
/// lists widget comms the instance already owns, so a reconnecting client
/// can resume them instead of rebuilding widget state.
pub fn websocket_connected(instance_id: &str, kernel_id: &str, comms: &[String]) -> Value {
    json!({
        "action": "websocket_connected",
        "instanceId": instance_id,
        "kernelId": kernel_id,
        "comms": comms,
        "timestamp": timestamp(),
    })
}

/// Notification that a kernel link is closed for an instance.
pub fn websocket_closed(instance_id: &str, kernel_id: &str) -> Value {
    json!({
        "action": "websocket_closed",
        "instanceId": instance_id,
        "kernelId": kernel_id,
        "timestamp": timestamp(),
    })
}

/// Short-code error frame surfaced to a single peer.
pub fn error_frame(code: &str, message: &str) -> Value {
    json!({
        "action": "error",
        "code": code,
        "message": message,
        "timestamp": timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mapping() {
        assert_eq!(Channel::for_msg_type("execute_request"), Channel::Shell);
        assert_eq!(Channel::for_msg_type("comm_msg"), Channel::Shell);
        assert_eq!(Channel::for_msg_type("interrupt_request"), Channel::Control);
        assert_eq!(Channel::for_msg_type("shutdown_request"), Channel::Control);
        assert_eq!(Channel::for_msg_type("input_reply"), Channel::Stdin);
        // Unknown request types fall back to shell.
        assert_eq!(Channel::for_msg_type("debug_request"), Channel::Shell);
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(PeerFrame::parse(b"[1, 2, 3]").is_err());
        assert!(PeerFrame::parse(b"not json").is_err());
        assert!(PeerFrame::parse(br#"{"action": "canvas_data"}"#).is_ok());
    }

    #[test]
    fn accessors_read_jupyter_hints() {
        let frame = PeerFrame::parse(
            br#"{
                "action": "kernel_message",
                "instanceId": "i1",
                "kernelId": "k1",
                "data": {
                    "header": {"msg_id": "m1", "msg_type": "execute_request", "session": "s1"},
                    "parent_header": {},
                    "content": {"code": "1 + 1"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(frame.action(), Some("kernel_message"));
        assert_eq!(frame.instance_id(), Some("i1"));
        assert_eq!(frame.kernel_id(), Some("k1"));
        let data = frame.data().unwrap();
        assert_eq!(data.msg_id(), Some("m1"));
        assert_eq!(data.msg_type(), Some("execute_request"));
        assert_eq!(data.session(), Some("s1"));
        assert_eq!(data.parent_msg_id(), None);
    }

    #[test]
    fn client_id_is_overwritten() {
        let mut frame = PeerFrame::parse(br#"{"action": "canvas_data", "client_id": "spoof"}"#).unwrap();
        frame.set_client_id("peer-7");
        assert_eq!(frame.value()["client_id"], "peer-7");
    }

    #[test]
    fn kernel_request_has_fresh_header() {
        let a = kernel_request("execute_request", json!({"code": "pass"}));
        let b = kernel_request("execute_request", json!({"code": "pass"}));
        assert_ne!(a["header"]["msg_id"], b["header"]["msg_id"]);
        assert_eq!(a["header"]["msg_type"], "execute_request");
        assert_eq!(a["header"]["version"], "5.4");
    }
}
