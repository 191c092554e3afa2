pub mod admission;
pub mod catalog;
pub mod checksum;
pub mod diff;
pub mod engine;
pub mod equivalence;
pub mod task;
pub mod transfer;

pub use admission::{admit, AdmissionError, AdmissionPolicy, UnknownCapacity};
pub use catalog::{CatalogError, CatalogOptions, PathCatalog, PathEntry};
pub use checksum::{ChecksumDescriptor, ChecksumError, HashAlgorithm};
pub use diff::{DiffEngine, DiffError, DiffResult, PartialDiff, Unclassified};
pub use engine::{SyncConfig, SyncEngine, SyncRequest};
pub use equivalence::{EquivalenceChecker, EquivalenceError, EquivalencePolicy};
pub use task::{Progress, TaskHandle, TaskResult};
pub use transfer::{
    FailurePolicy, Selection, SyncDirection, TransferError, TransferExecutor, TransferOptions,
    TransferOutcome, TransferPlan, TransferStatus,
};
