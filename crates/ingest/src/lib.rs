pub mod config_service;
pub mod events;
pub mod logging;
pub mod services;
pub mod storage;
pub mod worker_pool;

pub use config_service::ConfigService;
pub use events::{handler, EventBus, EventHandler, SubscriptionId};
pub use worker_pool::{PoolJob, WorkerPool, DEFAULT_WORKERS};
