use std::sync::Arc;
use std::time::Duration;

use tokenflow_core::store::RunStore;
use tokenflow_core::store_memory::MemoryRunStore;
use tokenflow_server::grpc::proto::tokenflow_server::TokenflowServer;
use tokenflow_server::grpc::TokenflowService;
use tokenflow_server::runs::RunManager;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = "0.0.0.0:50061".parse()?;

    let database_url = parse_database_url();

    let store: Arc<dyn RunStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = tokenflow_core::store_postgres::PostgresRunStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresRunStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryRunStore"
            );
            Arc::new(MemoryRunStore::new())
        }
        None => {
            tracing::info!("Using MemoryRunStore (no database URL configured)");
            Arc::new(MemoryRunStore::new())
        }
    };

    let runs = Arc::new(RunManager::new(store));

    // Alarm driver: fires synchronization timeouts for due runs.
    let alarm_runs = runs.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;
            if let Err(error) = alarm_runs.fire_due_alarms().await {
                tracing::warn!(%error, "alarm sweep failed");
            }
        }
    });

    tracing::info!("tokenflow gRPC server listening on {}", addr);

    let service = TokenflowService { runs };

    Server::builder()
        .add_service(TokenflowServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL`
/// env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
