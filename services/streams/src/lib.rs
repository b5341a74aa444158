//! Friendlink Streams Service
//!
//! Expiry and click-count processing for friend links. The service consumes
//! upload and click events from Kafka, keeps per-partition state in RocksDB,
//! and periodically
//!
//! - expires links whose lifetime has elapsed, deactivating the link record in
//!   PostgreSQL and deleting the file from S3
//! - flushes accumulated click counters into PostgreSQL
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topics              Partition Worker (one per partition)
//! ┌──────────────┐          ┌───────────────────────────────────┐
//! │ upload       │─┐        │ UploadProcessor ──▶ expiry-store  │
//! │ events       │ │ Event  │ ClickProcessor  ──▶ click-store   │
//! └──────────────┘ ├──────▶ │ offsets         ──▶ source-offsets│
//! ┌──────────────┐ │ Router │                                   │
//! │ click        │─┘        │ sweep / flush timers              │
//! │ events       │          └───────────────────────────────────┘
//! └──────────────┘                 │ jobs             ▲ reports
//!                                  ▼                  │
//!                           ┌───────────────────────────────────┐
//!                           │ Cleanup Dispatcher (bounded)      │
//!                           └───────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                           ┌──────────────┐   ┌──────────────┐
//!                           │ PostgreSQL   │   │ S3           │
//!                           │ friend_urls  │   │ files        │
//!                           └──────────────┘   └──────────────┘
//! ```
//!
//! A store entry is only removed after the job covering it reports success,
//! so a failed or interrupted cleanup is retried on a later tick.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod processor;
pub mod router;
pub mod store;
pub mod worker;

pub use api::AppState;
pub use cleanup::{
    CleanupDispatcher, CleanupError, CleanupJob, CleanupReport, CleanupService, LinkCleanupService,
    LinkRepository, ObjectStore,
};
pub use config::Config;
pub use processor::{ClickProcessor, InFlight, UploadProcessor};
pub use router::EventRouter;
pub use store::{
    Checkpoint, ClickStore, ExpiryEntry, ExpiryKey, ExpiryStore, StateStore, StoreError,
};
pub use worker::{
    PartitionEvent, PartitionStats, PartitionWorker, WorkerClient, WorkerError, WorkerHandle,
    WorkerSettings,
};
