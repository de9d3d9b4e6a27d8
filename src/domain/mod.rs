//! Domain types for the conversational client.
//!
//! This module contains the core data structures:
//! - Agent: the two agent identities and per-agent containers
//! - Message: transcript entries, attachments and patches
//! - Facts: typed facts narrowed out of inbound envelopes
//! - Ambient: connectivity/audio/music indicators
//! - Events: diagnostic records

pub mod agent;
pub mod ambient;
pub mod events;
pub mod facts;
pub mod message;

// Re-export commonly used types
pub use agent::{AgentId, AgentStatus, PerAgent};
pub use ambient::AmbientState;
pub use events::{DiagnosticEvent, EventKind, EventLevel};
pub use facts::{Fact, ReplyFragment, SignalOrigin};
pub use message::{Attachment, Message, MessagePatch, Meta, Role};
