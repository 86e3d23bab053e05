pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod health;
pub mod inspect;
pub mod model;
pub mod observability;
pub mod operate;
pub mod parser;
pub mod queue;
pub mod reports;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod tailer;
pub mod watcher;

use std::sync::Arc;

use config::Config;
use correlator::Correlator;
use events::EventBus;
use health::reporter::HealthReporter;
use health::checks::{DatabaseHealthCheck, MtaBinaryHealthCheck, StorageHealthCheck};
use queue::QueueController;
use shutdown::Shutdown;
use store::Storage;
use tailer::TailRegistry;

/// Shared application state passed to the CLI surface and every background
/// worker (watcher loop, retention sweeper, snapshot poller).
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Storage,
    pub correlator: Arc<Correlator>,
    pub queue: Arc<QueueController>,
    pub events: Arc<EventBus>,
    pub tail_registry: TailRegistry,
    pub shutdown: Shutdown,
    pub started_at: std::time::Instant,
    pub health_reporter: Arc<HealthReporter>,
}

impl AppContext {
    pub async fn build(config: Config) -> Result<Self, error::StoreError> {
        let store = Storage::connect(&config.db_path, config.db_max_open_conns).await?;
        let correlator = Arc::new(Correlator::new(store.clone()));
        let queue = Arc::new(QueueController::new(
            config.binary_path.clone(),
            (&config.op_timeouts).into(),
            config.bulk_concurrency_limit,
        ));
        let events = Arc::new(EventBus::new(config.subscriber_buffer_size));
        let tail_registry = TailRegistry::new();
        let shutdown = Shutdown::new();

        let data_dir = config
            .db_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        let health_reporter = Arc::new(
            HealthReporter::new()
                .with_check(DatabaseHealthCheck::new(store.reader_pool()))
                .with_check(StorageHealthCheck::new(&data_dir))
                .with_check(MtaBinaryHealthCheck::new(&config.binary_path)),
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            correlator,
            queue,
            events,
            tail_registry,
            shutdown,
            started_at: std::time::Instant::now(),
            health_reporter,
        })
    }
}
