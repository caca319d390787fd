//! Wire messages exchanged between controller and agents.
//!
//! Every frame is one compact JSON object. The envelope fields `command`
//! (integer tag) and `node_name` (sender) come first, followed by the fields
//! of the payload selected by the tag.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::scheduler::{GpuInfo, Job};

/// Node type an agent announces in its handshake.
pub const NODE_TYPE_AGENT: &str = "agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    HandshakeInitial = 1,
    HandshakeResponse = 2,
    NewJobOffer = 3,
    JobAccepted = 4,
    JobDone = 5,
    JobUpdate = 6,
    JobCancelRequest = 7,
    JobCancelResponse = 8,
}

impl Command {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            1 => Command::HandshakeInitial,
            2 => Command::HandshakeResponse,
            3 => Command::NewJobOffer,
            4 => Command::JobAccepted,
            5 => Command::JobDone,
            6 => Command::JobUpdate,
            7 => Command::JobCancelRequest,
            8 => Command::JobCancelResponse,
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::HandshakeInitial => "HandshakeInitial",
            Command::HandshakeResponse => "HandshakeResponse",
            Command::NewJobOffer => "NewJobOffer",
            Command::JobAccepted => "JobAccepted",
            Command::JobDone => "JobDone",
            Command::JobUpdate => "JobUpdate",
            Command::JobCancelRequest => "JobCancelRequest",
            Command::JobCancelResponse => "JobCancelResponse",
        };
        f.write_str(name)
    }
}

/// Load and inventory an agent attaches to most of its messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub capacity: u32,
    pub jobs_running: u32,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInitial {
    pub node_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    #[serde(default)]
    pub refuse_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobOffer {
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAccepted {
    pub accepted: bool,
    #[serde(default)]
    pub refuse_reason: String,
    pub job: Job,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDone {
    pub success: bool,
    pub job: Job,
    pub agent_info: AgentInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub progress: f32,
    #[serde(default)]
    pub message: String,
    pub job: Job,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCancelRequest {
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCancelResponse {
    pub job: Job,
    pub cancelled: bool,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    HandshakeInitial(HandshakeInitial),
    HandshakeResponse(HandshakeResponse),
    NewJobOffer(NewJobOffer),
    JobAccepted(JobAccepted),
    JobDone(JobDone),
    JobUpdate(JobUpdate),
    JobCancelRequest(JobCancelRequest),
    JobCancelResponse(JobCancelResponse),
}

impl Payload {
    pub fn command(&self) -> Command {
        match self {
            Payload::HandshakeInitial(_) => Command::HandshakeInitial,
            Payload::HandshakeResponse(_) => Command::HandshakeResponse,
            Payload::NewJobOffer(_) => Command::NewJobOffer,
            Payload::JobAccepted(_) => Command::JobAccepted,
            Payload::JobDone(_) => Command::JobDone,
            Payload::JobUpdate(_) => Command::JobUpdate,
            Payload::JobCancelRequest(_) => Command::JobCancelRequest,
            Payload::JobCancelResponse(_) => Command::JobCancelResponse,
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Payload {
                fn from(body: $variant) -> Self {
                    Payload::$variant(body)
                }
            }
        )*
    };
}

impl_from_payload!(
    HandshakeInitial,
    HandshakeResponse,
    NewJobOffer,
    JobAccepted,
    JobDone,
    JobUpdate,
    JobCancelRequest,
    JobCancelResponse,
);

/// One decoded frame: the sender's node name and the typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub node_name: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(node_name: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            node_name: node_name.into(),
            payload: payload.into(),
        }
    }

    pub fn command(&self) -> Command {
        self.payload.command()
    }
}

#[derive(Serialize)]
struct Frame<'a> {
    command: u8,
    node_name: &'a str,
    #[serde(flatten)]
    body: &'a Payload,
}

#[derive(Deserialize)]
struct Envelope {
    command: u64,
    node_name: String,
}

/// Serialize a message into a frame body, without the trailing newline.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    let frame = Frame {
        command: message.command().tag(),
        node_name: &message.node_name,
        body: &message.payload,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Parse one frame body. The envelope is read first to select the payload
/// schema; unknown tags are reported as such rather than as malformed input.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let value: Value = serde_json::from_str(line)?;
    let envelope = Envelope::deserialize(&value)?;
    let command =
        Command::from_tag(envelope.command).ok_or(ProtocolError::UnknownCommand(envelope.command))?;

    let payload = match command {
        Command::HandshakeInitial => HandshakeInitial::deserialize(&value)?.into(),
        Command::HandshakeResponse => HandshakeResponse::deserialize(&value)?.into(),
        Command::NewJobOffer => NewJobOffer::deserialize(&value)?.into(),
        Command::JobAccepted => JobAccepted::deserialize(&value)?.into(),
        Command::JobDone => JobDone::deserialize(&value)?.into(),
        Command::JobUpdate => JobUpdate::deserialize(&value)?.into(),
        Command::JobCancelRequest => JobCancelRequest::deserialize(&value)?.into(),
        Command::JobCancelResponse => JobCancelResponse::deserialize(&value)?.into(),
    };

    Ok(Message {
        node_name: envelope.node_name,
        payload,
    })
}
