pub mod cache;
pub mod history;
pub mod notifier;
pub mod pipeline;
pub mod reconciler;
pub mod retry;
pub mod store;

pub use cache::{CacheConfig, RoomCache};
pub use history::History;
pub use notifier::{BrokerNotifier, Notifier};
pub use pipeline::{Accepted, Ingest, Pipeline, PipelineConfig, PipelineDeps, PipelineError};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use store::MessageStore;

#[cfg(test)]
mod testing;
