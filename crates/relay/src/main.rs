use std::sync::Arc;

use relay_core::config::Config;

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = Arc::new(Config::load()?);

    relay_telegram::router::run_polling(cfg)
        .await
        .map_err(|e| relay_core::Error::External(format!("relay bot failed: {e:#}")))?;

    Ok(())
}
