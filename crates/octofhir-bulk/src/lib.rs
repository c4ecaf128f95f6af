//! # octofhir-bulk
//!
//! Partitioned, checkpointed FHIR bulk export and import.
//!
//! A job is split by [`PartitionPlanner`] into partitions that run
//! concurrently. Each partition is a [`PartitionWorker`] pulling batches from
//! a [`pipeline::Source`] into a [`pipeline::Sink`]:
//!
//! - export pages through a resource type with [`ExportSource`] and writes
//!   NDJSON parts through [`ExportSink`];
//! - import reads an NDJSON object in byte ranges with [`ImportSource`] and
//!   persists it through [`ImportSink`], writing `OperationOutcome` logs.
//!
//! Checkpoints are taken only after a flush, when the buffered bytes are
//! durable in the object store, so a restarted partition resumes from its
//! last [`CheckpointSnapshot`] without duplicating or skipping output.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use octofhir_bulk::{
//!     BulkConfig, InMemoryCheckpointStore, InMemoryPersistence, JobRunner,
//!     ObjectStoreClient, PartitionPlanner, StaticResourceTypes,
//! };
//!
//! let config = BulkConfig::default();
//! let planner = PartitionPlanner::new(Arc::new(StaticResourceTypes::fhir_r4()), 4);
//! let plan = planner.plan_export(&["Patient".into(), "Observation".into()])?;
//!
//! let runner = JobRunner::new(
//!     config,
//!     Arc::new(InMemoryPersistence::new()),
//!     Arc::new(ObjectStoreClient::in_memory()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//! );
//! let run = runner.run(&plan).await?;
//! println!("{}", run.summary.resource_type_summary());
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod object_storage;
pub mod persistence;
pub mod pipeline;
pub mod planner;
pub mod policy;
pub mod runner;
pub mod summary;
pub mod telemetry;
pub mod upload;

pub use buffer::{AppendError, Chunk, ChunkBuffer};
pub use checkpoint::{
    CheckpointSnapshot, CheckpointState, Counts, ResourceTypeSummary, SessionStatus, Timings,
    UploadSessionState,
};
pub use config::{BulkConfig, LayoutKind, MIB};
pub use error::{BulkError, BulkResult, ErrorCategory};
pub use object_storage::{DynObjectStorage, ObjectStorage, ObjectStoreClient};
pub use persistence::memory::InMemoryPersistence;
pub use persistence::{BulkPersistence, DynPersistence, PersistenceTransaction};
pub use pipeline::export::{ExportSink, ExportSource};
pub use pipeline::import::{ImportSink, ImportSource};
pub use pipeline::{CheckpointHook, PartitionExit, PartitionWorker, StopSignal};
pub use planner::{
    ImportInput, JobPlan, PartitionPlanner, PartitionSpec, ResourceTypeRegistry,
    StaticResourceTypes, parse_import_inputs,
};
pub use policy::CheckpointPolicy;
pub use runner::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, JobRun, JobRunner, JobStatus,
};
pub use summary::{JobSummary, MetricsAnalyzer, MetricsCollector};
pub use telemetry::Direction;
pub use upload::{MultipartUploadSession, ObjectLayout};
