use std::sync::Arc;

use teleprompter_relay::{routes, Relay, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env()?;
    let relay = Arc::new(Relay::new());

    log::info!(
        "teleprompter-relay listening on {} ({:?} mode)",
        config.listen,
        config.mode
    );
    if let Some(dir) = config.static_root() {
        log::info!("serving static pages from {}", dir.display());
    }

    warp::serve(routes(relay, &config)).run(config.listen).await;
    Ok(())
}
