//! Debate orchestration
//!
//! Multi-persona debates run as `RUN_DEBATE` jobs. The orchestrator walks a
//! session through a fixed speaking order and records every turn.
//!
//! # Debate Flow
//!
//! ```text
//! Queued → Running ─┬─ round 1: persona₁ … personaₙ [→ moderator summary]
//!                   ├─ round 2: persona₁ … personaₙ [→ moderator summary]
//!                   ├─ …
//!                   ├─ [moderator final synthesis]
//!                   └─→ Completed
//!
//! any step fails → Failed ──(job retry)──→ Running (resumes at first missing turn)
//! ```
//!
//! Collaborators are traits so the worker binary can plug in real providers:
//! [`SessionStore`], [`TurnCompletion`], [`KnowledgeCatalog`].

pub mod handler;
pub mod knowledge;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod state;
pub mod store;

pub use handler::{run_debate_key, DebateJobHandler, RUN_DEBATE};
pub use knowledge::{resolve_packs, KnowledgeCatalog, KnowledgePack, MemoryKnowledgeCatalog};
pub use orchestrator::{DebateError, DebateOrchestrator, DebateOutcome};
pub use provider::{CompletionError, ProviderRouter, TurnCompletion, TurnRequest, TurnResponse};
pub use state::{
    DebateProgress, DebateSession, DebateSettings, DebateStatus, KnowledgeAssociations, Persona,
    ProviderKind, SourceGroundingMode, StatusTransition, TransitionError, Turn, TurnKind,
    MODERATOR_ID, MODERATOR_NAME,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError};
