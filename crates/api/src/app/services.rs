use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;

use fieldstock_events::{EventEnvelope, InMemoryEventBus};
use fieldstock_infra::Procurement;

use crate::config::AppConfig;

pub type ProcurementBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

/// Shared state behind every handler.
pub struct AppServices {
    pub procurement: Procurement,
    /// Committed events, for in-process consumers such as job scheduling.
    pub events: Arc<ProcurementBus>,
}

impl AppServices {
    /// In-memory store; state lives as long as the process.
    pub fn in_memory(config: &AppConfig) -> Self {
        let events = Arc::new(ProcurementBus::new());
        let procurement =
            Procurement::in_memory_with_bus(config.procurement.clone(), events.clone());
        Self { procurement, events }
    }

    pub async fn postgres(config: &AppConfig, database_url: &str) -> anyhow::Result<Self> {
        let events = Arc::new(ProcurementBus::new());
        let procurement =
            Procurement::postgres(database_url, config.procurement.clone(), events.clone())
                .await
                .context("failed to open the Postgres event store")?;
        Ok(Self { procurement, events })
    }
}

/// Pick the store from `USE_PERSISTENT_STORES`.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    if !config.use_persistent_stores {
        tracing::info!("using in-memory event store");
        return Ok(AppServices::in_memory(config));
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    tracing::info!("using Postgres event store");
    AppServices::postgres(config, database_url).await
}
