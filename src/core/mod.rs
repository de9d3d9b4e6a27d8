//! Core reconciliation logic.
//!
//! This module contains:
//! - Classifier: envelope decoding and fact extraction
//! - Reconciler: merging fragments into per-agent transcripts
//! - Transcript: bounded, persisted message lists
//! - Transport: connection state machine with reconnect
//! - Stabilizer: debounced audio playing flag
//! - Session: the single-task runtime tying it together

pub mod backend_history;
pub mod classifier;
pub mod diagnostics;
pub mod reconciler;
pub mod session;
pub mod stabilizer;
pub mod storage;
pub mod text;
pub mod timer;
pub mod transcript;
pub mod transport;

// Re-export commonly used types
pub use backend_history::extract_backend_history;
pub use classifier::{classify, decode_envelope, Classification, EnvelopeError};
pub use diagnostics::{emit, DiagnosticsSink, EventLog, Fanout, JsonlSink, TracingSink};
pub use reconciler::{AgentState, LocalSubmission, ReconcileOutcome, Reconciler};
pub use session::{
    Session, SessionClosed, SessionCommand, SessionConfig, SessionHandle, SessionSnapshot,
    SessionUpdate,
};
pub use stabilizer::{AudioStabilizer, StabilizerConfig};
pub use storage::{BackgroundWriter, FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use transcript::TranscriptStore;
pub use transport::{
    ConnectionState, ConnectionStatus, TransportCommand, TransportError, TransportManager,
};
