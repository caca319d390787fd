//! Controller/agent wire protocol: newline-delimited JSON frames over a
//! stream transport.

pub mod conn;
pub mod message;

pub use conn::{spawn_writer, Connection, MessageReader, MessageWriter, Outbox, OUTBOX_CAPACITY};
pub use message::{
    decode, encode, AgentInfo, Command, HandshakeInitial, HandshakeResponse, JobAccepted,
    JobCancelRequest, JobCancelResponse, JobDone, JobUpdate, Message, NewJobOffer, Payload,
    NODE_TYPE_AGENT,
};
