use std::sync::Arc;

use anyhow::Context;
use sentry_hub::audit::AuditLogger;
use sentry_hub::config::HubConfig;
use sentry_hub::escalation::HttpConfirmationClient;
use sentry_hub::handlers::{router, AppState};
use sentry_hub::radio::udp_bridge::UdpBridgeRadio;
use sentry_hub::{PipelineConfig, SentryPipeline};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentry_hub=info,tower_http=warn".into()),
        )
        .init();

    let config = HubConfig::default();
    info!("🛡️ Sentry hub starting (gateway {})", config.bridge.gateway_addr);

    let radio = UdpBridgeRadio::bind(&config.bridge)
        .await
        .with_context(|| format!("binding bridge port {}", config.bridge.listen_port))?;
    let service = HttpConfirmationClient::new(&config.escalation)?;
    info!("📡 Confirmation service at {}", service.endpoint());

    let audit = match &config.audit_path {
        Some(path) => AuditLogger::resume(path.clone()).await.with_max_bytes(config.audit_max_bytes),
        None => AuditLogger::new(None),
    };

    let pipeline = Arc::new(
        SentryPipeline::start(Arc::new(radio), Arc::new(service), PipelineConfig::from(&config), audit).await,
    );

    if config.auto_connect {
        if let Some(device_id) = pipeline.settings().await.last_device_id {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                info!("🔗 Auto-connecting to last device {device_id}");
                match pipeline.connect(&device_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Auto-connect to {device_id} failed"),
                    Err(e) => warn!("Auto-connect to {device_id} refused: {e}"),
                }
            });
        }
    }

    let app = router(AppState { pipeline, scan_duration: config.scan_duration });

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!("🚀 Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
