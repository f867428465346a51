//! Wire types for the host ⇄ driver pipe.
//!
//! Every message is one UTF-8 JSON object followed by a single `\n`. There is
//! no length prefix. `serde_json` escapes control characters inside strings,
//! so an encoded message never contains a raw newline before its terminator.
//!
//! ```text
//! host → driver   {"id":3,"cmd":"drawIcp","arg":{"lines":[...],"font":"DCS"}}
//! driver → host   {"id":3,"ok":true,"result":null}
//! driver → host   {"type":"ready","pipe":"icp-bridge","pid":4242}
//! ```
//!
//! The `ready` notification is sent once per accepted connection and is not
//! correlated with any request. Readers must be prepared to skip it (and any
//! other line that is not the response they wait for) at any point in the
//! stream, including as the very first line after connecting.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Reply text for a line that is not valid JSON.
pub const INVALID_JSON: &str = "Invalid JSON";

/// Payload of `ping`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {}

/// Payload of `drawIcp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawIcpArgs {
    /// Exactly five rows, possibly containing inversion markers.
    pub lines: Vec<String>,
    /// Font name; the driver falls back to its default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
}

/// Payload of `clearIcp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearIcpArgs {}

/// Payload of `close`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseArgs {}

/// A driver command, selected on the wire by the `cmd` discriminator with its
/// payload under `arg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "arg", rename_all = "camelCase")]
pub enum Command {
    Ping(PingArgs),
    DrawIcp(DrawIcpArgs),
    ClearIcp(ClearIcpArgs),
    Close(CloseArgs),
}

impl Command {
    pub fn ping() -> Self {
        Self::Ping(PingArgs {})
    }

    pub fn draw_icp(lines: Vec<String>, font: Option<String>) -> Self {
        Self::DrawIcp(DrawIcpArgs { lines, font })
    }

    pub fn clear_icp() -> Self {
        Self::ClearIcp(ClearIcpArgs {})
    }

    pub fn close() -> Self {
        Self::Close(CloseArgs {})
    }

    /// The wire name of this command.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::DrawIcp(_) => "drawIcp",
            Self::ClearIcp(_) => "clearIcp",
            Self::Close(_) => "close",
        }
    }

    /// Commands the shutdown sequence still needs once ordinary traffic is refused.
    #[must_use]
    pub fn permitted_while_stopping(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::ClearIcp(_) | Self::Close(_))
    }

    /// Build a command from its wire discriminator and raw payload.
    ///
    /// A missing or `null` payload is treated as `{}`.
    pub fn from_wire(cmd: &str, arg: Value) -> Result<Self, String> {
        let arg = if arg.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            arg
        };
        let parsed = match cmd {
            "ping" => serde_json::from_value(arg).map(Self::Ping),
            "drawIcp" => serde_json::from_value(arg).map(Self::DrawIcp),
            "clearIcp" => serde_json::from_value(arg).map(Self::ClearIcp),
            "close" => serde_json::from_value(arg).map(Self::Close),
            other => return Err(format!("Unknown cmd: {other}")),
        };
        parsed.map_err(|e| format!("Invalid arg for {cmd}: {e}"))
    }
}

/// A correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Loosely-typed request envelope used by the driver so that unknown
/// commands can still be answered with the sender's id.
#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: Option<u64>,
    cmd: Option<String>,
    #[serde(default)]
    arg: Value,
}

/// Parse one request line.
///
/// On failure the error is the response that should be written back.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    let raw: Value =
        serde_json::from_str(line).map_err(|_| Response::failure(None, INVALID_JSON))?;

    let wire: WireRequest = serde_json::from_value(raw).map_err(|e| {
        Response::failure(None, format!("Invalid request: {e}"))
    })?;

    let cmd = wire
        .cmd
        .ok_or_else(|| Response::failure(wire.id, "Invalid request: missing cmd"))?;
    let id = wire
        .id
        .ok_or_else(|| Response::failure(None, "Invalid request: missing id"))?;

    let command = Command::from_wire(&cmd, wire.arg).map_err(|e| Response::failure(Some(id), e))?;
    Ok(Request { id, command })
}

/// A reply to a request.
///
/// `id` is `null` only for replies to lines that could not be parsed far
/// enough to discover the sender's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Extract the result, converting `ok:false` into a [`BridgeError::Command`].
    pub fn into_result(self, cmd: &'static str) -> Result<Value, BridgeError> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::Command {
                cmd,
                message: self.error.unwrap_or_else(|| "unspecified error".to_string()),
            })
        }
    }
}

/// An unsolicited message from the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Sent once on every accepted connection.
    Ready { pipe: String, pid: u32 },
}

/// Anything the host can read from the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverMessage {
    Response(Response),
    Notification(Notification),
    /// A notification type this build does not know about.
    UnknownNotification(String),
}

impl DriverMessage {
    /// Parse a raw JSON line.
    ///
    /// Objects carrying a `type` field are notifications, everything else is
    /// read as a response.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_str(line)?;

        match raw.get("type").and_then(Value::as_str) {
            Some(kind) => {
                let kind = kind.to_string();
                match serde_json::from_value::<Notification>(raw) {
                    Ok(notif) => Ok(Self::Notification(notif)),
                    Err(_) => Ok(Self::UnknownNotification(kind)),
                }
            }
            None => Ok(Self::Response(serde_json::from_value(raw)?)),
        }
    }
}

/// Serialize a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = Request {
            id: 1,
            command: Command::ping(),
        };
        let value: Value = serde_json::from_str(encode_line(&req).unwrap().trim_end()).unwrap();
        assert_eq!(value, json!({"id": 1, "cmd": "ping", "arg": {}}));

        let req = Request {
            id: 2,
            command: Command::draw_icp(vec!["A".into(); 5], Some("DCS".into())),
        };
        let value: Value = serde_json::from_str(encode_line(&req).unwrap().trim_end()).unwrap();
        assert_eq!(value["cmd"], "drawIcp");
        assert_eq!(value["arg"]["font"], "DCS");
        assert_eq!(value["arg"]["lines"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_draw_without_font_omits_field() {
        let req = Request {
            id: 9,
            command: Command::draw_icp(vec![String::new(); 5], None),
        };
        let line = encode_line(&req).unwrap();
        assert!(!line.contains("font"));
    }

    #[test]
    fn test_encoded_line_has_single_trailing_newline() {
        let req = Request {
            id: 4,
            command: Command::draw_icp(vec!["multi\nline".into(); 5], None),
        };
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_parse_request() {
        let req = parse_request(r#"{"id":5,"cmd":"drawIcp","arg":{"lines":["","","","",""]}}"#)
            .unwrap();
        assert_eq!(req.id, 5);
        match req.command {
            Command::DrawIcp(args) => {
                assert_eq!(args.lines.len(), 5);
                assert!(args.font.is_none());
            }
            other => panic!("expected drawIcp, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_request_missing_arg() {
        let req = parse_request(r#"{"id":1,"cmd":"ping"}"#).unwrap();
        assert_eq!(req.command, Command::ping());
    }

    #[test]
    fn test_parse_request_invalid_json() {
        let resp = parse_request("not json").unwrap_err();
        assert_eq!(resp.id, None);
        assert!(!resp.ok);
        assert_eq!(resp.error.as_deref(), Some(INVALID_JSON));

        let line = encode_line(&resp).unwrap();
        assert!(line.starts_with(r#"{"id":null,"ok":false"#));
    }

    #[test]
    fn test_parse_request_unknown_cmd() {
        let resp = parse_request(r#"{"id":12,"cmd":"reboot","arg":{}}"#).unwrap_err();
        assert_eq!(resp.id, Some(12));
        assert_eq!(resp.error.as_deref(), Some("Unknown cmd: reboot"));
    }

    #[test]
    fn test_parse_request_bad_arg() {
        let resp = parse_request(r#"{"id":3,"cmd":"drawIcp","arg":{"lines":7}}"#).unwrap_err();
        assert_eq!(resp.id, Some(3));
        assert!(resp.error.unwrap().starts_with("Invalid arg for drawIcp"));
    }

    #[test]
    fn test_driver_message_response() {
        let msg = DriverMessage::from_line(r#"{"id":1,"ok":true,"result":"pong"}"#).unwrap();
        match msg {
            DriverMessage::Response(resp) => {
                assert_eq!(resp.id, Some(1));
                assert_eq!(resp.into_result("ping").unwrap(), json!("pong"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_driver_message_ready() {
        let msg =
            DriverMessage::from_line(r#"{"type":"ready","pipe":"icp-bridge","pid":42}"#).unwrap();
        assert_eq!(
            msg,
            DriverMessage::Notification(Notification::Ready {
                pipe: "icp-bridge".into(),
                pid: 42,
            })
        );
    }

    #[test]
    fn test_driver_message_unknown_notification() {
        let msg = DriverMessage::from_line(r#"{"type":"telemetry","rate":5}"#).unwrap();
        assert_eq!(msg, DriverMessage::UnknownNotification("telemetry".into()));
    }

    #[test]
    fn test_failure_into_result() {
        let err = Response::failure(Some(2), "device offline")
            .into_result("drawIcp")
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Command { cmd: "drawIcp", ref message } if message == "device offline"
        ));
    }

    #[test]
    fn test_permitted_while_stopping() {
        assert!(Command::ping().permitted_while_stopping());
        assert!(Command::clear_icp().permitted_while_stopping());
        assert!(Command::close().permitted_while_stopping());
        assert!(!Command::draw_icp(vec![], None).permitted_while_stopping());
    }
}
