//! weir-core: a business-process orchestration engine.
//!
//! Given a static process graph, the engine creates, advances, persists
//! and recovers many concurrent running instances of it. Each instance is
//! a tree of execution tokens that can fork, join, wait on external
//! events, and resume after crashes.
//!
//! The moving parts, leaves first:
//! - [`graph`]: the immutable process graph and its definitions;
//! - [`store`]: the persistence contract with optimistic locking
//!   ([`store_memory`] ships the in-memory reference backend);
//! - [`entity`]: the durable runtime entities (executions, jobs, event
//!   subscriptions);
//! - [`agenda`]: the single-threaded FIFO interpreter of one command;
//! - [`command`] / [`commands`]: the transactional unit of work and the
//!   built-in operations;
//! - [`subscription`]-backed event correlation, the [`scheduler`]'s job
//!   acquisition loop, and the [`cache`] of resolved definitions;
//! - [`engine`]: the facade everything outside talks to.

pub mod agenda;
pub mod cache;
pub mod clock;
pub mod command;
pub mod commands;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
mod execution;
pub mod graph;
mod job;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod subscription;

pub use cache::{DefinitionCache, DefinitionResolver, InMemoryDefinitionRepository};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::Command;
pub use commands::{
    CorrelateMessage, DefinitionSelector, DeleteProcessInstance, ExecuteJob,
    SetInstanceSuspended, StartProcessInstance, ThrowSignal, TriggerExecution,
};
pub use context::CommandContext;
pub use engine::{EngineConfig, InstanceOverview, ProcessEngine};
pub use entity::{
    EventKind, EventSubscription, Execution, Job, JobHandler, JobKind, PayloadHandle,
    SubscriptionScope, TimerCycle, VariableValue, Variables,
};
pub use error::{EngineError, EngineResult, StoreError};
pub use events::{EngineEvent, EngineListener, RecordingListener};
pub use graph::{
    GraphBuilder, GraphError, NodeKind, ProcessDefinition, ProcessGraph, StartTrigger, TimerDue,
};
pub use scheduler::{AcquisitionSummary, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{EntityKind, EntityRecord, FlushBatch, ProcessStore};
pub use store_memory::MemoryStore;
