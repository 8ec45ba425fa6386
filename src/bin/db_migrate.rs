//! Apply pending migrations. `cargo run --bin db_migrate`.

use anyhow::Result;

use betstack_sync::database_ops::db::Db;
use betstack_sync::tracing::init_tracing;
use betstack_sync::util::env::{db_url, env_parse, init_env};

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info")?;

    let db = Db::connect(&db_url()?, env_parse("DB_MAX_CONNECTIONS", 2u32)).await?;
    sqlx::migrate!("./migrations").run(&db.pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
