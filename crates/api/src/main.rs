use fieldstock_api::config::AppConfig;

#[tokio::main]
async fn main() {
    fieldstock_observability::init();

    let config = AppConfig::from_env();

    let app = fieldstock_api::app::build_app(&config)
        .await
        .expect("failed to initialise services");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr));

    tracing::info!(
        addr = %listener.local_addr().expect("listener has a local address"),
        persistent = config.use_persistent_stores,
        "listening"
    );

    axum::serve(listener, app).await.expect("server error");
}
