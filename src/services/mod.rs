//! Background Services Module
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │   Bucket Sync   │────▶│ Compaction Svc   │
//! └─────────────────┘     └──────────────────┘
//!         │                       │
//!         ▼                       ▼
//! ┌──────────────────────────────────────────┐
//! │        MetaStore  /  ObjectStore         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! - **ServiceManager**: starts services in dependency order, stops them on
//!   one shutdown signal
//! - **BucketSyncService**: reloads block descriptors from the bucket
//! - **CompactionService** (in [`crate::compact`]): plans and runs compaction
//!
//! # Example
//!
//! ```rust
//! use panorama_tsdb::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod framework;
pub mod sync;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use sync::BucketSyncService;
