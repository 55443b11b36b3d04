//! Connection provider
//!
//! Two-phase admission of WebSocket sessions (identity token exchanged for a
//! short-lived connection token, then an upgrade gated by that token), the
//! authoritative connection registry, heartbeat liveness, inbound message
//! dispatch, and lifecycle event fan-out.

pub mod dispatch;
pub mod events;
pub mod heartbeat;
pub mod record;
pub mod registry;
pub mod routes;
pub mod sender;
pub mod service;

pub use dispatch::{Envelope, EnvelopeError, HandlerError, MessageHandler, ProviderEnv};
pub use events::{EventBus, EventChannel, Subscriber, SubscriberError};
pub use record::{ConnectedAt, ConnectionRecord};
pub use registry::{Registry, CONNECTIONS_COLLECTION};
pub use routes::{
    capability_middleware, provider_router, Authenticated, CapabilityConfig, CAP_API,
    CAP_CONNECTION, CAP_CONNECTION_SEND,
};
pub use sender::{serialize_outbound, OutboundHandle, SendOutcome, SendStatus};
pub use service::{ConnectionService, ConnectionServiceBuilder, IssueOutcome, PROVIDER_NAME};
