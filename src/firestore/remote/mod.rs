pub mod bloom_filter;
pub mod datastore;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{Datastore, MockDatastore};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    DocumentWatchChange, ExistenceFilter, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
