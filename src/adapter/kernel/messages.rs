//! Kernel channel messages and their reduction to displayable output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MIME types in the order the richest representation is picked.
const MIME_PREFERENCE: [&str; 9] = [
    "text/html",
    "image/svg+xml",
    "image/*",
    "text/markdown",
    "application/pdf",
    "text/latex",
    "application/javascript",
    "application/json",
    "text/plain",
];

const TEXT_PLAIN: &str = "text/plain";

/// A message relayed from the kernel's shell or iopub channel.
///
/// Only the fields the adapter routes on are typed; the rest stay as JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JupyterMessage {
    pub header: Value,
    pub parent_header: Value,
    pub content: Value,
    pub idents: Value,
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

impl JupyterMessage {
    /// `header.msg_type`.
    pub fn msg_type(&self) -> Option<&str> {
        str_field(&self.header, "msg_type")
    }

    /// `parent_header.msg_id`, if non-empty.
    pub fn parent_msg_id(&self) -> Option<&str> {
        str_field(&self.parent_header, "msg_id").filter(|id| !id.is_empty())
    }

    /// `content.execution_state` of a status message.
    pub fn execution_state(&self) -> Option<&str> {
        str_field(&self.content, "execution_state")
    }

    /// Whether the message carries content and both headers, and is not
    /// the kernel's `starting` status.
    pub fn is_valid(&self) -> bool {
        if self.content.is_null() || self.execution_state() == Some("starting") {
            return false;
        }
        [&self.parent_header, &self.header].into_iter().all(|header| {
            str_field(header, "msg_id").is_some() && str_field(header, "msg_type").is_some()
        })
    }
}

/// One item of an execution's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedIoMessage {
    /// MIME type to payload.
    pub data: Map<String, Value>,
    /// `"text"` for plain text, otherwise the MIME type of `data`.
    #[serde(rename = "type")]
    pub mime_type: String,
    /// `stdout`, `stderr`, `pyout`, `error` or `status`.
    pub stream: String,
    /// Short error summary for `error` items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ParsedIoMessage {
    fn text(stream: &str, text: Value) -> Self {
        let mut data = Map::new();
        data.insert(TEXT_PLAIN.to_string(), text);
        Self {
            data,
            mime_type: "text".to_string(),
            stream: stream.to_string(),
            message: None,
        }
    }

    /// Terminal status item, `"ok"` or `"error"`.
    pub fn status(ok: bool) -> Self {
        let status = if ok { "ok" } else { "error" };
        Self::text("status", Value::from(status))
    }

    /// Whether this is a terminal status item.
    pub fn is_status(&self) -> bool {
        self.stream == "status"
    }

    /// The `text/plain` payload, if it is a string.
    pub fn plain_text(&self) -> Option<&str> {
        self.data.get(TEXT_PLAIN).and_then(Value::as_str)
    }
}

fn trimmed(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::from(s.trim()),
        other => other.clone(),
    }
}

fn pick_mime(data: &Map<String, Value>) -> Option<&str> {
    MIME_PREFERENCE.iter().find_map(|&wanted| match wanted {
        "image/*" => data
            .keys()
            .map(String::as_str)
            .find(|key| key.starts_with("image/")),
        exact => data.contains_key(exact).then_some(exact),
    })
}

fn parse_rich(msg: &JupyterMessage) -> Option<ParsedIoMessage> {
    match msg.msg_type()? {
        "display_data" | "execute_result" | "pyout" => {}
        _ => return None,
    }
    let data = msg.content.get("data")?.as_object()?;
    let mime = pick_mime(data)?;
    let value = data.get(mime)?;

    if mime == TEXT_PLAIN {
        return Some(ParsedIoMessage::text("pyout", trimmed(value)));
    }
    let mut picked = Map::new();
    picked.insert(mime.to_string(), value.clone());
    Some(ParsedIoMessage {
        data: picked,
        mime_type: mime.to_string(),
        stream: "pyout".to_string(),
        message: None,
    })
}

fn parse_error(msg: &JupyterMessage) -> Option<ParsedIoMessage> {
    match msg.msg_type()? {
        "error" | "pyerr" => {}
        _ => return None,
    }
    let ename = str_field(&msg.content, "ename").unwrap_or_default();
    let evalue = str_field(&msg.content, "evalue").unwrap_or_default();
    let summary = format!("{ename}: {evalue}");

    let text = match msg.content.get("traceback").and_then(Value::as_array) {
        Some(lines) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => summary.clone(),
    };

    let mut parsed = ParsedIoMessage::text("error", Value::from(text));
    parsed.message = Some(summary);
    Some(parsed)
}

fn parse_stream(msg: &JupyterMessage) -> Option<ParsedIoMessage> {
    let name = str_field(&msg.content, "name");
    let stream = if msg.msg_type() == Some("stream") {
        name.unwrap_or_default()
    } else {
        let idents = msg.idents.as_str();
        if matches!(idents, Some("stdout" | "stream.stdout")) || name == Some("stdout") {
            "stdout"
        } else if matches!(idents, Some("stderr" | "stream.stderr")) || name == Some("stderr") {
            "stderr"
        } else {
            return None;
        }
    };

    let text = match msg.content.get("text") {
        Some(text) if !text.is_null() => text,
        _ => msg.content.get("data").unwrap_or(&Value::Null),
    };
    Some(ParsedIoMessage::text(stream, trimmed(text)))
}

/// Reduce an iopub message to an output item.
///
/// Returns `None` for messages that produce no output (status, input
/// echoes, comm traffic, ...).
pub fn parse_io_message(msg: &JupyterMessage) -> Option<ParsedIoMessage> {
    parse_rich(msg)
        .or_else(|| parse_error(msg))
        .or_else(|| parse_stream(msg))
}

/// Terminal status item for a shell reply.
///
/// `complete_reply` and `inspect_reply` never terminate an execution.
pub fn shell_status(msg: &JupyterMessage) -> Option<ParsedIoMessage> {
    if matches!(msg.msg_type(), Some("complete_reply" | "inspect_reply")) {
        return None;
    }
    match str_field(&msg.content, "status")? {
        "ok" => Some(ParsedIoMessage::status(true)),
        "abort" | "aborted" | "error" => Some(ParsedIoMessage::status(false)),
        _ => None,
    }
}
