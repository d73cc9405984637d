//! In-process CA and mock sentry server for tests and local development.
//!
//! **Warning:** nothing here is suitable for production. [`TestCa`] keeps its
//! root key in memory and [`MockSentry`] trusts whatever token it is given.
//!
//! # Example
//!
//! ```ignore
//! use sentry_identity::testing::{Behavior, MockSentry};
//!
//! let sentry = MockSentry::start("cluster.local").await?;
//! sentry.push_behaviors([Behavior::Fail(tonic::Code::Unavailable, "warming up".into())]);
//! // dial sentry.address() ...
//! assert_eq!(sentry.attempts(), 2);
//! ```
//!
//! [`MockSentry::start_mtls`] serves the same service behind mutual TLS,
//! presenting a certificate for the given sentry SPIFFE ID and requiring
//! clients to chain to the mock's root.

use crate::certificate::{encode_pem, parse_cert_chain_pem};
use crate::identity::{Identity, SpiffeId};
use crate::tls::parse_private_key;
use crate::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sentry_proto::{
    CertificateAuthority, CertificateAuthorityServer, SignCertificateRequest,
    SignCertificateResponse, TokenValidator,
};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::Stream;
use tonic::transport::server::Connected;
use tonic::{Request, Response, Status};
use tracing::debug;

const WORKLOAD_TTL: TimeDuration = TimeDuration::hours(1);

/// A self-signed certificate authority for one trust domain.
pub struct TestCa {
    trust_domain: String,
    root_key: KeyPair,
    root_params: CertificateParams,
    root_der: Vec<u8>,
}

impl TestCa {
    /// Creates a CA with a fresh P-256 root valid for ten years.
    pub fn new(trust_domain: impl Into<String>) -> Result<Self> {
        let trust_domain = trust_domain.into();

        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("root key generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("Sentry Test Root - {trust_domain}"));
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + TimeDuration::days(3650);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_san = rcgen::string::Ia5String::try_from(format!("spiffe://{trust_domain}"))
            .map_err(|e| Error::Certificate(format!("invalid CA SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(ca_san)];

        let root_cert = params
            .clone()
            .self_signed(&root_key)
            .map_err(|e| Error::Certificate(format!("root cert generation failed: {e}")))?;

        Ok(Self {
            trust_domain,
            root_key,
            root_params: params,
            root_der: root_cert.der().to_vec(),
        })
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the PEM-encoded root certificate.
    pub fn root_cert_pem(&self) -> String {
        encode_pem("CERTIFICATE", &self.root_der)
    }

    /// Signs the public key in `csr_pem` for `identity`, ignoring whatever
    /// names the request itself carries. Returns the chain PEM (leaf, root).
    pub fn sign_csr(&self, csr_pem: &str, identity: &Identity) -> Result<String> {
        if identity.trust_domain() != self.trust_domain {
            return Err(Error::Certificate(format!(
                "trust domain mismatch: expected {}, got {}",
                self.trust_domain,
                identity.trust_domain()
            )));
        }

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Certificate(format!("failed to parse CSR: {e}")))?;
        csr.params = self.leaf_params(&identity.to_spiffe_id(), identity.app_id())?;

        let issuer = rcgen::Issuer::from_params(&self.root_params, &self.root_key);
        let leaf = csr
            .signed_by(&issuer)
            .map_err(|e| Error::Certificate(format!("certificate signing failed: {e}")))?;

        Ok(self.chain_pem(leaf.der()))
    }

    /// Issues a certificate and a fresh key for `id`. Returns
    /// `(chain_pem, private_key_pem)`; used for mTLS fixtures.
    pub fn issue(&self, id: &SpiffeId) -> Result<(String, String)> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("key generation failed: {e}")))?;

        let params = self.leaf_params(id, "workload")?;
        let issuer = rcgen::Issuer::from_params(&self.root_params, &self.root_key);
        let leaf = params
            .signed_by(&key, &issuer)
            .map_err(|e| Error::Certificate(format!("certificate signing failed: {e}")))?;

        Ok((self.chain_pem(leaf.der()), key.serialize_pem()))
    }

    /// Builds a TLS server config presenting a fresh certificate for
    /// `server_id` and requiring client certificates issued by this CA.
    pub fn server_config(&self, server_id: &SpiffeId) -> Result<ServerConfig> {
        let (chain_pem, key_pem) = self.issue(server_id)?;
        let provider = Arc::new(default_provider());

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(self.root_der.clone()))
            .map_err(|e| Error::Certificate(format!("invalid test root: {e}")))?;
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| Error::Certificate(format!("client verifier: {e}")))?;

        let certs = parse_cert_chain_pem(chain_pem.as_bytes())?
            .into_iter()
            .map(CertificateDer::from)
            .collect();

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Certificate(format!("TLS versions: {e}")))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, parse_private_key(&key_pem)?)
            .map_err(|e| Error::Certificate(format!("server certificate: {e}")))?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(config)
    }

    fn leaf_params(&self, id: &SpiffeId, common_name: &str) -> Result<CertificateParams> {
        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(1);
        params.not_after = now + WORKLOAD_TTL;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let san = rcgen::string::Ia5String::try_from(id.to_string())
            .map_err(|e| Error::Certificate(format!("invalid SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san)];

        Ok(params)
    }

    fn chain_pem(&self, leaf_der: &[u8]) -> String {
        let mut chain = encode_pem("CERTIFICATE", leaf_der);
        chain.push_str(&encode_pem("CERTIFICATE", &self.root_der));
        chain
    }
}

/// What the mock sentry does for one `SignCertificate` call.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Sign the CSR.
    Sign,
    /// Fail with the given status.
    Fail(tonic::Code, String),
    /// Never answer (until the server shuts down).
    Hang,
    /// Answer with a chain issued for a different key.
    SignWrongKey,
}

/// A request as observed by the mock sentry.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// The `id` field.
    pub id: String,
    /// The bootstrap token.
    pub token: String,
    /// The target namespace.
    pub namespace: String,
    /// The token validator discriminator.
    pub token_validator: TokenValidator,
    /// The CSR exactly as received.
    pub csr_pem: Vec<u8>,
}

struct MockState {
    ca: TestCa,
    script: Mutex<VecDeque<Behavior>>,
    attempts: AtomicU32,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockState {
    fn new(trust_domain: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            ca: TestCa::new(trust_domain)?,
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }))
    }
}

struct MockService {
    state: Arc<MockState>,
}

#[tonic::async_trait]
impl CertificateAuthority for MockService {
    async fn sign_certificate(
        &self,
        request: Request<SignCertificateRequest>,
    ) -> std::result::Result<Response<SignCertificateResponse>, Status> {
        let req = request.into_inner();
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let behavior = self
            .state
            .script
            .lock()
            .map_err(|_| Status::internal("script lock poisoned"))?
            .pop_front()
            .unwrap_or(Behavior::Sign);
        debug!(attempt, ?behavior, namespace = %req.namespace, "mock sentry call");

        if let Ok(mut requests) = self.state.requests.lock() {
            requests.push(RecordedRequest {
                id: req.id.clone(),
                token: req.token.clone(),
                namespace: req.namespace.clone(),
                token_validator: req.token_validator(),
                csr_pem: req.certificate_signing_request.clone(),
            });
        }

        match behavior {
            Behavior::Sign => self.sign(&req).map(Response::new),
            Behavior::Fail(code, message) => Err(Status::new(code, message)),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Err(Status::deadline_exceeded("unreachable"))
            }
            Behavior::SignWrongKey => {
                let other = crate::csr::CertSign::generate()
                    .map_err(|e| Status::internal(e.to_string()))?;
                let identity = self.identity_for(&req)?;
                let chain = self
                    .state
                    .ca
                    .sign_csr(&other.csr_pem(), &identity)
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(Response::new(SignCertificateResponse {
                    workload_certificate: chain.into_bytes(),
                    trust_chain_certificates: vec![],
                }))
            }
        }
    }
}

impl MockService {
    fn identity_for(&self, req: &SignCertificateRequest) -> std::result::Result<Identity, Status> {
        let app_id = if req.token.is_empty() {
            "anonymous"
        } else {
            req.token.as_str()
        };
        Identity::try_new(self.state.ca.trust_domain(), &req.namespace, app_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }

    fn sign(
        &self,
        req: &SignCertificateRequest,
    ) -> std::result::Result<SignCertificateResponse, Status> {
        let identity = self.identity_for(req)?;
        let csr_pem = std::str::from_utf8(&req.certificate_signing_request)
            .map_err(|e| Status::invalid_argument(format!("CSR is not PEM: {e}")))?;

        let chain = self
            .state
            .ca
            .sign_csr(csr_pem, &identity)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(SignCertificateResponse {
            workload_certificate: chain.into_bytes(),
            trust_chain_certificates: vec![],
        })
    }
}

/// A sentry server on an ephemeral localhost port.
///
/// Calls follow the queued [`Behavior`]s in order and sign once the queue is
/// empty. The server stops when the handle is dropped.
pub struct MockSentry {
    address: SocketAddr,
    state: Arc<MockState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    accept_task: Option<JoinHandle<()>>,
}

impl MockSentry {
    /// Starts a plaintext mock sentry for `trust_domain`.
    pub async fn start(trust_domain: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = MockState::new(trust_domain)?;

        Ok(Self::serve(
            address,
            state,
            TcpListenerStream::new(listener),
            None,
        ))
    }

    /// Starts a mock sentry behind mutual TLS, presenting `sentry_id`.
    ///
    /// Clients need a certificate from [`MockSentry::issue`] and
    /// [`MockSentry::root_cert_pem`] as their trust bundle.
    pub async fn start_mtls(trust_domain: &str, sentry_id: &SpiffeId) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = MockState::new(trust_domain)?;
        let acceptor = TlsAcceptor::from(Arc::new(state.ca.server_config(sentry_id)?));

        let (tx, rx) = mpsc::channel::<io::Result<TlsConnection>>(16);
        let accept_task = tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!(error = %e, "mock sentry accept failed");
                        return;
                    }
                };
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(stream) => {
                            let _ = tx.send(Ok(TlsConnection(stream))).await;
                        }
                        Err(e) => debug!(%peer, error = %e, "mock sentry TLS handshake failed"),
                    }
                });
            }
        });

        Ok(Self::serve(
            address,
            state,
            ReceiverStream::new(rx),
            Some(accept_task),
        ))
    }

    fn serve<S, IO>(
        address: SocketAddr,
        state: Arc<MockState>,
        incoming: S,
        accept_task: Option<JoinHandle<()>>,
    ) -> Self
    where
        S: Stream<Item = io::Result<IO>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = CertificateAuthorityServer::new(MockService {
            state: state.clone(),
        });

        let task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                debug!(error = %e, "mock sentry stopped");
            }
        });

        Self {
            address,
            state,
            shutdown: Some(shutdown_tx),
            task,
            accept_task,
        }
    }

    /// Returns the `host:port` the server listens on.
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Queues behaviours for the next calls.
    pub fn push_behaviors(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        if let Ok(mut script) = self.state.script.lock() {
            script.extend(behaviors);
        }
    }

    /// Returns how many `SignCertificate` calls have been received.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Returns the CA root certificate PEM.
    pub fn root_cert_pem(&self) -> String {
        self.state.ca.root_cert_pem()
    }

    /// Issues a certificate and key from the mock's CA for `id`.
    pub fn issue(&self, id: &SpiffeId) -> Result<(String, String)> {
        self.state.ca.issue(id)
    }

    /// Stops the server and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.abort();
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
    }
}

impl Drop for MockSentry {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(accept_task) = &self.accept_task {
            accept_task.abort();
        }
        self.task.abort();
    }
}

/// A server-side TLS stream tonic can serve.
struct TlsConnection(tokio_rustls::server::TlsStream<TcpStream>);

impl Connected for TlsConnection {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for MockSentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSentry")
            .field("address", &self.address)
            .field("attempts", &self.attempts())
            .finish()
    }
}
