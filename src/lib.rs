//! sisilink - Streaming conversation client for a two-agent voice backend
//!
//! Connects to a backend that pushes loosely-typed JSON envelopes over a
//! WebSocket and folds them into two per-agent transcripts plus a small
//! set of ambient indicators (connectivity, audio, music).
//!
//! # Architecture
//!
//! One task owns all state:
//! - Inbound frames are classified into typed facts
//! - Reply fragments are reconciled into the transcripts (streaming merge,
//!   echo suppression, abort handling)
//! - Transport and audio timers are polled from the same loop
//!
//! # Modules
//!
//! - `adapters`: External system integrations (WebSocket, HTTP history)
//! - `core`: Classifier, Reconciler, Transcript, Transport, Session
//! - `domain`: Data structures (AgentId, Message, Fact, AmbientState)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Follow a live session
//! sisilink listen
//!
//! # Pull server-side history into the local transcript
//! sisilink history sync
//!
//! # Show the last messages for one agent
//! sisilink transcript --agent liuye --limit 20
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Reconciler, Session, SessionHandle, TranscriptStore};
pub use domain::{AgentId, AgentStatus, AmbientState, Attachment, Fact, Message, PerAgent, Role};
