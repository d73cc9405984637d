//! `sentry request`

use crate::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use sentry_identity::Requester;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Namespace of the workload the certificate is for
    #[arg(short, long, env = "NAMESPACE")]
    pub namespace: String,

    /// Also print the private key PEM after the chain
    #[arg(long)]
    pub print_key: bool,
}

pub async fn execute(args: RequestArgs, config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let opts = config.requester_options().await?;
    let detector = config.detector();

    let requester = Requester::new(opts, detector.as_ref(), config.token_source())
        .await
        .context("failed to connect to sentry")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling certificate request");
            on_signal.cancel();
        }
    });

    let issued = requester
        .request_certificate(&cancel, &args.namespace)
        .await
        .with_context(|| format!("certificate request for namespace '{}' failed", args.namespace))?;
    requester.close();

    match (issued.identity(), issued.expiry()) {
        (Ok(identity), Ok(expiry)) => info!(identity = %identity, expires = %expiry, "certificate issued"),
        _ => info!("certificate issued"),
    }

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(issued.chain_pem())?;
    if args.print_key {
        stdout.write_all(issued.private_key_pem())?;
    }
    stdout.flush()?;
    Ok(())
}
