use session_memory::{backend, config::StoreConfig, ConversationMemory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Connectivity check: pings both namespaces, then prints `info` for every
/// session key passed on the command line.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = StoreConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        backend = ?config.backend,
        host = %config.redis_host,
        port = config.redis_port,
        "Checking session memory backend"
    );

    let kv = backend::connect(&config).await?;
    let memory = ConversationMemory::from_config(kv, &config);

    if let Err(e) = memory.health_check().await {
        error!("Backend check failed: {}", e);
        return Err(Box::new(e) as Box<dyn std::error::Error>);
    }
    println!("Backend reachable (memory db {}, user db {})", config.memory_db, config.user_db);

    for session_key in std::env::args().skip(1) {
        let info = memory.memory().info(&session_key).await?;
        let owner = memory.users().session_owner(&session_key).await?;

        println!("\n=== SESSION {} ===", session_key);
        if !info.exists {
            println!("  (no stored messages)");
        } else {
            println!("  Messages: {}/{}", info.message_count, info.max_messages);
            if let Some(created_at) = info.created_at {
                println!("  Created: {}", created_at.to_rfc3339());
            }
            if let Some(ttl) = info.ttl_remaining_secs {
                println!("  Expires in: {}s", ttl);
            }
        }
        println!("  Owner: {}", owner.as_deref().unwrap_or("-"));
    }

    Ok(())
}
