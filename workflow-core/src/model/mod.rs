//! The domain model: workflow definitions, runs, jobs, and the execution log.

pub mod definition;
pub mod event;
pub mod job;
pub mod log;
pub mod run;

pub use definition::{
    ConditionOperator, ConditionSpec, DefinitionId, DefinitionStats, DelayUnit, Edge,
    ExpectedOutcome, ExpectedResponse, ExpectedResponseKind, LeadId, Node, NodeConfig, NodeId,
    TenantId, TriggerFilter, TriggerType, WorkflowDefinition,
};
pub use event::{DomainEvent, EventHandle, EventKind, LeadView};
pub use job::{DeadLetter, Job, JobId, JobQueueKind, JobStatus};
pub use log::{ExecutionLogEntry, LogStatus};
pub use run::{
    ExecutionPathEntry, PathEntryStatus, Run, RunContext, RunId, RunStatus, WaitingForCall,
    WaitingForReply, WaitingForTask,
};
