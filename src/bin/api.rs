use session_memory::{api::start_server, backend, config::StoreConfig, ConversationMemory};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let config = StoreConfig::from_env()?;

    // Initialize tracing (RUST_LOG wins over LOG_LEVEL)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Session Memory - API Server");
    info!("Port: {}", api_port);

    let kv = backend::connect(&config).await?;
    let memory = ConversationMemory::from_config(kv, &config);
    memory.health_check().await?;

    info!(
        session_ttl_secs = config.session_ttl_secs,
        max_messages = config.max_messages,
        "Session memory initialized"
    );

    start_server(memory, api_port).await?;

    Ok(())
}
