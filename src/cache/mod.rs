//! Offline cache: request identity, partitioned storage, network fetching and
//! the orchestrator that applies per-partition strategies.

pub mod fetch;
pub mod identity;
pub mod orchestrator;
pub mod storage;

pub use fetch::{FetchedResource, Fetcher, HttpFetcher};
pub use identity::{
    classify, CachePartition, Method, PartitionId, ResourceIdentity, ResourceRequest, Strategy,
    VersionTag,
};
pub use orchestrator::{
    CacheInfo, CacheOrchestrator, OrchestratorOptions, PartitionInfo, ResourceResponse,
    ResponseSource,
};
pub use storage::{
    CacheEntry, CacheStorage, EntryMeta, GenerationStatus, PartitionStats, PutOutcome,
};
