use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use cdc_sync_service::db::ClickHouseClient;
use cdc_sync_service::http::{self, HttpState};
use cdc_sync_service::services::cdc::{
    CdcConsumer, KafkaChangeSource, KafkaDeadLetterPublisher, MappingRegistry,
};
use cdc_sync_service::{CdcConfig, CdcMetrics};
use idempotent_consumer::ClickHouseLedger;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_sync_service=debug,idempotent_consumer=info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting cdc-sync-service");

    let config = CdcConfig::from_env().context("Failed to load configuration")?;

    let registry = match &config.cdc_mappings_path {
        Some(path) => MappingRegistry::from_json_file(config.cdc_topic_prefix.clone(), path),
        None => MappingRegistry::builtin(config.cdc_topic_prefix.clone()),
    }
    .context("Failed to build table mappings")?;
    tracing::info!(
        prefix = registry.prefix(),
        tables = ?registry
            .tables()
            .map(|t| format!("{} -> {}", t.source_table, t.sink_table))
            .collect::<Vec<_>>(),
        "Table mappings loaded"
    );
    let registry = Arc::new(registry);

    let selected = config.selected_tables();
    let expected_topics = registry
        .expected_topics(selected.as_deref())
        .context("Invalid CDC_TABLES")?;
    tracing::info!(topics = ?expected_topics, "Expected CDC topics");

    let clickhouse = ClickHouseClient::from_config(&config);
    if let Err(e) = clickhouse.health_check().await {
        tracing::warn!("ClickHouse not reachable yet, ledger bootstrap will retry: {}", e);
    }

    let ledger = ClickHouseLedger::new(clickhouse.inner().clone())
        .with_retention_days(config.cdc_ledger_retention_days);

    let source = KafkaChangeSource::new(&config).context("Failed to create Kafka consumer")?;
    let metrics = CdcMetrics::new().context("Failed to register metrics")?;

    let mut consumer = CdcConsumer::new(
        source,
        clickhouse.clone(),
        ledger,
        Arc::clone(&registry),
        expected_topics,
        config.ingestion(),
        metrics.clone(),
    );

    if let Some(topic) = config.dead_letter_topic() {
        let publisher = KafkaDeadLetterPublisher::new(&config, topic)
            .context("Failed to create dead-letter producer")?;
        tracing::info!(topic = publisher.topic(), "Dead-lettering enabled");
        consumer = consumer.with_dead_letter(Arc::new(publisher));
    } else {
        tracing::warn!("Dead-lettering disabled; failing messages block their partition");
    }

    // The sink must be writable before anything is consumed
    let mut delay = std::time::Duration::from_secs(1);
    loop {
        match consumer.initialize().await {
            Ok(()) => break,
            Err(e) => {
                tracing::error!(
                    retry_in_secs = delay.as_secs(),
                    "Failed to initialize ledger: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(60));
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let http_state = HttpState {
        error_state: consumer.error_state(),
        metrics,
    };

    tracing::info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .configure(http::configure)
    })
    .disable_signals()
    .bind(("0.0.0.0", config.http_port))
    .context("Failed to bind HTTP server")?
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let result = consumer.run(shutdown_rx).await;

    server_handle.stop(true).await;
    if let Err(e) = server_task.await {
        tracing::error!("HTTP server task failed: {}", e);
    }

    result.context("CDC sync loop failed")?;
    tracing::info!("cdc-sync-service stopped");
    Ok(())
}
