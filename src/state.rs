use std::sync::Arc;

use crate::attendance::AttendanceRecorder;
use crate::auth::bootstrap_admin;
use crate::config::Config;
use crate::feed::ChangeFeed;
use crate::mail::Mailer;
use crate::scanner::{RqrrDecoder, ScannerHub};
use crate::store::{Backend, MemoryBackend, PgBackend};

/// Everything a handler needs, built once at startup and shared through
/// an `Extension`.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Backend>,
    pub feed: ChangeFeed,
    pub mailer: Mailer,
    pub recorder: Arc<AttendanceRecorder>,
    pub scanners: ScannerHub,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn Backend> = match &config.database_url {
            Some(url) => {
                let backend = PgBackend::connect(url, config.database_max_connections).await?;
                backend.migrate().await?;
                log::info!("Using postgres backend");
                Arc::new(backend)
            }
            None => {
                log::warn!("DATABASE_URL is not set, records will only live in memory");
                Arc::new(MemoryBackend::new())
            }
        };

        if let Some((username, password)) = &config.bootstrap_admin {
            bootstrap_admin(store.as_ref(), username, password)
                .await
                .map_err(|err| anyhow::anyhow!("failed to seed admin account: {:?}", err))?;
        }

        let state = Self::with_store(config, store);
        state.scanners.spawn_reaper();
        Ok(state)
    }

    pub fn with_store(config: Config, store: Arc<dyn Backend>) -> Arc<Self> {
        let feed = ChangeFeed::new();
        let recorder = Arc::new(AttendanceRecorder::new(
            store.clone(),
            feed.clone(),
            config.default_event_name.clone(),
        ));
        Arc::new(Self {
            mailer: Mailer::new(config.mail.clone()),
            scanners: ScannerHub::new(Arc::new(RqrrDecoder), config.scan),
            recorder,
            feed,
            store,
            config,
        })
    }
}
