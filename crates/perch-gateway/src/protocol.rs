//! Gateway wire protocol: payload frames, opcodes, and event codes

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Connection-level message types, numbered as on the Discord gateway.
/// Numbers this client does not know round-trip as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    Resume,
    Reconnect,
    InvalidSession,
    Hello,
    HeartbeatAck,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            other => Opcode::Unknown(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        match op {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::Unknown(raw) => raw,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Names of the dispatch events the core itself consumes or routes.
pub mod dispatch {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const INTERACTION_CREATE: &str = "INTERACTION_CREATE";
    pub const GUILD_CREATE: &str = "GUILD_CREATE";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
}

/// One message on the duplex connection: opcode, optional dispatch event
/// name, optional sequence number, optional body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub op: Opcode,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub d: Option<Value>,
}

/// The registry's addressing key: a connection-level control code or an
/// application-level dispatch event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventCode {
    Control(Opcode),
    Dispatch(String),
}

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCode::Control(op) => write!(f, "op:{op}"),
            EventCode::Dispatch(name) => write!(f, "{name}"),
        }
    }
}

impl EventCode {
    pub fn dispatch(name: &str) -> Self {
        EventCode::Dispatch(name.to_string())
    }
}

impl Payload {
    /// The addressing code for this frame. A dispatch name wins when
    /// present; otherwise the opcode addresses the frame.
    pub fn code(&self) -> EventCode {
        match &self.t {
            Some(name) => EventCode::Dispatch(name.clone()),
            None => EventCode::Control(self.op),
        }
    }

    pub fn body(&self) -> Value {
        self.d.clone().unwrap_or(Value::Null)
    }

    /// A heartbeat carrying the last received sequence number.
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self {
            op: Opcode::Heartbeat,
            t: None,
            s: seq,
            d: None,
        }
    }

    /// A fresh identify with the subscription mask and the connection
    /// properties the gateway expects.
    pub fn identify(token: &str, intents: u64) -> Self {
        Self {
            op: Opcode::Identify,
            t: None,
            s: None,
            d: Some(json!({
                "token": token,
                "intents": intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "perch",
                    "device": "perch",
                },
            })),
        }
    }

    /// A resume carrying the held session id and sequence number verbatim.
    pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> Self {
        Self {
            op: Opcode::Resume,
            t: None,
            s: seq,
            d: Some(json!({
                "token": token,
                "session_id": session_id,
                "seq": seq,
            })),
        }
    }

    pub fn dispatch_event(name: &str, seq: u64, body: Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            t: Some(name.to_string()),
            s: Some(seq),
            d: Some(body),
        }
    }

    pub fn control(op: Opcode, body: Option<Value>) -> Self {
        Self {
            op,
            t: None,
            s: None,
            d: body,
        }
    }
}

/// Body of the handshake-init control message.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The bot user, as carried in the session-ready event.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRef {
    pub id: String,
}

/// Body of the session-ready dispatch event, reduced to the fields the core
/// consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub user: SessionUser,
    #[serde(default)]
    pub guilds: Vec<GuildRef>,
}

impl Ready {
    pub fn guild_ids(&self) -> Vec<String> {
        self.guilds.iter().map(|g| g.id.clone()).collect()
    }
}

/// An inbound request-like event, reduced to what routing needs: the
/// response token, the named command, and its option values.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub data: Option<InteractionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for raw in [0u8, 1, 2, 6, 7, 9, 10, 11] {
            assert_eq!(u8::from(Opcode::from(raw)), raw);
        }
        assert_eq!(Opcode::from(42), Opcode::Unknown(42));
        assert_eq!(u8::from(Opcode::Unknown(42)), 42);
    }

    #[test]
    fn payload_deserializes_wire_shape() {
        let raw = r#"{"op":0,"t":"READY","s":3,"d":{"session_id":"abc","user":{"id":"u1","username":"perch"},"guilds":[{"id":"g1"},{"id":"g2"}]}}"#;
        let payload: Payload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, Opcode::Dispatch);
        assert_eq!(payload.s, Some(3));
        assert_eq!(payload.code(), EventCode::dispatch("READY"));

        let ready: Ready = serde_json::from_value(payload.body()).unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.user.username, "perch");
        assert_eq!(ready.guild_ids(), vec!["g1", "g2"]);
    }

    #[test]
    fn control_frames_address_by_opcode() {
        let raw = r#"{"op":11}"#;
        let payload: Payload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.code(), EventCode::Control(Opcode::HeartbeatAck));
        assert_eq!(payload.body(), Value::Null);
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        let hb = Payload::heartbeat(Some(42));
        let raw = serde_json::to_value(&hb).unwrap();
        assert_eq!(raw["op"], 1);
        assert_eq!(raw["s"], 42);
    }

    #[test]
    fn identify_carries_token_and_mask() {
        let id = Payload::identify("tok", 513);
        let raw = serde_json::to_value(&id).unwrap();
        assert_eq!(raw["op"], 2);
        assert_eq!(raw["d"]["token"], "tok");
        assert_eq!(raw["d"]["intents"], 513);
        assert_eq!(raw["d"]["properties"]["browser"], "perch");
    }

    #[test]
    fn resume_carries_session_verbatim() {
        let rs = Payload::resume("tok", "sess9", Some(17));
        let raw = serde_json::to_value(&rs).unwrap();
        assert_eq!(raw["op"], 6);
        assert_eq!(raw["d"]["session_id"], "sess9");
        assert_eq!(raw["d"]["seq"], 17);
    }

    #[test]
    fn hello_body_parses() {
        let hello: Hello =
            serde_json::from_value(serde_json::json!({ "heartbeat_interval": 41250 })).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn interaction_body_parses_without_data() {
        let ixn: Interaction =
            serde_json::from_value(serde_json::json!({ "id": "i1", "token": "t1" })).unwrap();
        assert!(ixn.data.is_none());
        assert!(ixn.guild_id.is_none());
    }
}
