//! `sentry detect`

use crate::config::Config;
use anyhow::Result;
use sentry_identity::TokenSource;

pub async fn execute(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let mode = config.detector().detect();

    println!("mode:      {mode}");
    match config.token_source().token(mode).await {
        Ok(token) => println!("validator: {:?}", token.validator()),
        Err(e) => println!("validator: unavailable ({e})"),
    }
    Ok(())
}
