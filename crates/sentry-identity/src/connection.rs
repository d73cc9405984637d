//! The long-lived gRPC channel to sentry.
//!
//! A [`CaChannel`] is established once, when the requester is built, and
//! reused by every certificate request. Establishing it waits for the CA to
//! become reachable, up to a deadline, so that a requester which exists is a
//! requester that has connected.

use crate::identity::SpiffeId;
use crate::tls::{server_name_for, ChannelSecurity};
use crate::{Error, Result};
use hyper_util::rt::TokioIo;
use sentry_proto::CertificateAuthorityClient;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info};

/// Default time to wait for the CA to become reachable.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const INITIAL_DIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(5);

/// An established channel to the sentry CA.
#[derive(Debug, Clone)]
pub struct CaChannel {
    channel: Channel,
    address: String,
    ca_id: SpiffeId,
}

impl CaChannel {
    /// Connects to sentry at `address` (`host:port`).
    ///
    /// Dials repeatedly with capped exponential backoff until a connection is
    /// up or `deadline` elapses. With [`ChannelSecurity::Mtls`] the server must
    /// present `ca_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if no connection is up by the deadline.
    pub async fn connect(
        address: &str,
        ca_id: &SpiffeId,
        security: &ChannelSecurity,
        deadline: Duration,
    ) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::Connection("CA address is empty".to_string()));
        }

        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| Error::Connection(format!("invalid CA address '{address}': {e}")))?
            .connect_timeout(MAX_DIAL_BACKOFF)
            .tcp_nodelay(true);

        let tls = match security {
            ChannelSecurity::Insecure => None,
            ChannelSecurity::Mtls(creds) => {
                let config = creds.client_config(ca_id)?;
                Some((
                    TlsConnector::from(Arc::new(config)),
                    server_name_for(ca_id)?,
                ))
            }
        };

        info!(
            ca_address = %address,
            mtls = tls.is_some(),
            timeout_secs = deadline.as_secs(),
            "connecting to sentry"
        );

        let mut last_error = String::from("no dial attempted");
        let dial = async {
            let mut backoff = INITIAL_DIAL_BACKOFF;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = match &tls {
                    None => endpoint.connect().await,
                    Some((connector, server_name)) => {
                        let connector = connector.clone();
                        let server_name = server_name.clone();
                        endpoint
                            .connect_with_connector(tower::service_fn(move |uri: Uri| {
                                dial_tls(uri, connector.clone(), server_name.clone())
                            }))
                            .await
                    }
                };

                match result {
                    Ok(channel) => return channel,
                    Err(e) => {
                        let message = error_chain(&e);
                        debug!(
                            ca_address = %address,
                            attempt,
                            error = %message,
                            retry_in_ms = backoff.as_millis() as u64,
                            "sentry not reachable yet"
                        );
                        last_error = message;
                    }
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_DIAL_BACKOFF);
            }
        };

        let outcome = tokio::time::timeout(deadline, dial).await;
        let channel = outcome.map_err(|_| {
            Error::Connection(format!(
                "timed out after {}s connecting to {address}: {last_error}",
                deadline.as_secs_f64()
            ))
        })?;

        info!(ca_address = %address, "connected to sentry");
        Ok(Self {
            channel,
            address: address.to_string(),
            ca_id: ca_id.clone(),
        })
    }

    /// Returns a client bound to this channel.
    pub fn client(&self) -> CertificateAuthorityClient<Channel> {
        CertificateAuthorityClient::new(self.channel.clone())
    }

    /// Returns the address this channel was dialed with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the identity the CA is expected to present.
    pub fn ca_id(&self) -> &SpiffeId {
        &self.ca_id
    }
}

async fn dial_tls(
    uri: Uri,
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
) -> io::Result<TokioIo<tokio_rustls::client::TlsStream<TcpStream>>> {
    let authority = uri
        .authority()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CA URI has no authority"))?
        .as_str()
        .to_string();

    let tcp = TcpStream::connect(authority).await?;
    tcp.set_nodelay(true)?;
    let stream = connector.connect(server_name, tcp).await?;
    Ok(TokioIo::new(stream))
}

/// Flattens a transport error and its sources; tonic's top-level message
/// alone is just "transport error".
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
