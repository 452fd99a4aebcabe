//! Queue families and their management

mod manager;
mod names;

pub use manager::{
    FamilyDeletion, FamilyStats, HealthSummary, QueueManager, QueueManagerError, QueueStats,
    QueueStatus,
};
pub use names::{failed_queue, family_names, QueueKind};
