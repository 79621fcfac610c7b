//! Infrastructure layer: storage, the posting engine, draft documents,
//! reports and configuration.

pub mod config;
pub mod drafts;
pub mod posting;
pub mod reports;
pub mod store;


pub use config::{ConfigError, WarehouseConfig};
pub use drafts::DocumentService;
pub use posting::{PostingEngine, PostingError};
pub use store::{
    InMemoryWarehouseStore, PostgresWarehouseStore, StoreError, StoreTransaction, WarehouseStore,
};
