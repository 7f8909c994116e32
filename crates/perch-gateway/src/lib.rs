//! Gateway protocol engine
//!
//! Maintains one long-lived duplex connection to the event gateway,
//! identifies or resumes, heartbeats, and routes inbound frames through the
//! layered handler registry. Hosts assemble a bot with
//! [`GatewayClientBuilder`] and run it with [`GatewayClient::start`].

pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{
    DEFAULT_ENDPOINT, EventContext, EventLayer, GatewayClient, GatewayClientBuilder, LAYER_CORE,
};
pub use protocol::{EventCode, Interaction, Opcode, Payload, Ready, dispatch};
pub use session::{GatewayConfig, SessionHandle, SessionState};
pub use transport::{Connector, FrameReceiver, FrameSender, TransportError, WsConnector};
