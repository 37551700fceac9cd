use sqlx::postgres::PgPoolOptions;

#[macro_use]
extern crate tracing;

async fn app() -> anyhow::Result<()> {
  let config = starker_engine::engine_config();
  logger::init(&config.log)?;

  info!("starker engine version: v{}", env!("CARGO_PKG_VERSION"));
  info!(checkout_root = %config.checkout_root, "config loaded");

  let pool = PgPoolOptions::new()
    .max_connections(20)
    .connect(&config.database_url)
    .await?;
  pool.acquire().await?;
  info!("connected to state store");

  // HTTP routing, auth, the SSE wire encoder, the SSH connection pool, and
  // the manifest YAML parser are external collaborators that construct and
  // drive a `starker_engine::Engine` from here; none of them live in this
  // crate.

  let mut term_signal =
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  tokio::select! {
    _ = tokio::signal::ctrl_c() => {}
    _ = term_signal.recv() => {}
  }
  info!("shutting down");

  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  app().await
}
