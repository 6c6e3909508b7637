//! Offline sync queue: feedback, telemetry and metrics produced while the
//! backend is unreachable, delivered once it comes back.

pub mod deliver;
pub mod queue;

pub use deliver::{spawn_flush_loop, wire_payload, SyncDeliverer};
pub use queue::{DropRecord, FlushReport, OfflineSyncQueue, QueueStatus, SyncKind, SyncTask};
