//! Checkpointed flow engine for durable, long-running multi-party
//! transactions.
//!
//! Causeway coordinates business processes ("flows") that must survive
//! process restarts, retry transient failures without violating
//! exactly-once side-effect semantics, and obtain conflict-free commitment
//! of shared resources through a dedicated uniqueness service:
//!
//! - **Pure transition function** — [`Flow::transition`] is deterministic
//!   with no side effects; side effects are expressed as [`Action`]s
//! - **Explicit checkpoints** — the continuation is a serializable
//!   [`Checkpoint`], not a stack capture; resuming a flow means replaying
//!   its checkpoint
//! - **Fault triage** — every failure is diagnosed by the
//!   [`ErrorHospital`] into retry / hold-for-observation / propagate
//! - **Uniqueness commits** — [`NotaryService`] guarantees each resource
//!   reference is committed by at most one transaction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         FlowMachine (per flow)                       │
//! │                                                                      │
//! │   1. transition(state, event) → next state + actions                 │
//! │   2. Persist checkpoint (state + action intents, atomically)         │
//! │   3. Execute actions in order (dedup-skipped, fail-fast)             │
//! │   4. Epilogue: stay active / suspend / complete / fail               │
//! │                                                                      │
//! │   failure ──► ErrorHospital ──► discharge / observe / propagate      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use causeway::{Flow, FlowManager, MemoryStore};
//!
//! let manager = FlowManager::builder(MemoryStore::new())
//!     .register::<CreateGroupFlow>()
//!     .build()?;
//!
//! manager.resume_all_from_store().await?;
//!
//! let handle = manager.start::<CreateGroupFlow>("grp-1", args).await?;
//! let outcome = handle.result_within(Duration::from_secs(30)).await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres` — Enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

// Allow the crate to reference itself as `causeway` for macro-generated code
extern crate self as causeway;

mod checkpoint;
mod config;
mod engine;
mod error;
mod executor;
mod flow;
pub mod hospital;
mod machine;
mod manager;
pub mod notary;
mod retry;
pub mod store;
pub mod transport;

pub use checkpoint::{Checkpoint, Epilogue, FlowStatus, PendingAction, SuspendReason};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ActionError, Error, ErrorKind, Result};
pub use executor::{ActionContext, ActionExecutor, EngineExecutor};
pub use flow::{
    Action, DeduplicationId, Flow, FlowEvent, FlowFailure, FlowId, FlowRef, HasFlowId, Outcome,
    Transition,
};
pub use hospital::{Disposition, ErrorHospital, FlowPhase, HospitalCounts, HospitalRecord};
pub use manager::{EventRouter, FlowHandle, FlowManager, FlowManagerBuilder};
pub use nonempty::NonEmpty;
pub use notary::{
    AcceptAllSignatures, CommitError, CommitOutcome, CommitRequest, NotaryConfig, NotaryService,
    RequestAuthenticator, RequestSignature, ResourceRef, TimeWindow, TxId, UniquenessRecord,
};
pub use retry::RetryPolicy;
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{MemoryStore, Store};
pub use transport::{
    DeliveredMessage, LoopbackTransport, MessageId, PartyId, SessionId, Transport, TransportError,
};

// Re-export derive macros
pub use causeway_macros::HasFlowId;
