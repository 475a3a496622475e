//! tokio driver for one camera's connections.
//!
//! [`CameraClient::send`] opens a connection per request, writes the
//! annotated request and spawns a task that reads the socket, frames the
//! bytes and runs them through a [`ConnectionPipeline`]. Resends asked
//! for by the pipeline after a 401 go through a dispatcher task, so a
//! connection task never opens connections itself.
//!
//! Outputs reach the caller as [`ClientEvent`]s on the receiver returned
//! by [`CameraClient::new`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::auth::{AuthAbort, AuthSession, AuthState};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::demux::{DemuxEvent, ResponseDemultiplexer};
use crate::error::{ClientError, Result};
use crate::idle::{IdleDecision, IdlePolicy};
use crate::pipeline::{AuthOutcome, ConnectionPipeline, PipelineOutput, SessionObserver};
use crate::protocol::{HttpRequest, InboundUnit, ResponseFramer};
use crate::registry::{CameraGroupRegistry, CameraSession, ConnectionRegistry, PurposeKey};

const READ_BUFFER_LEN: usize = 16 * 1024;

/// Output of a camera client. `url` is the purpose URL of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StreamStarted {
        url: String,
        content_type: String,
        boundary: String,
    },
    /// Raw bytes of the MJPEG stream, as received.
    Frame { url: String, data: Vec<u8> },
    Snapshot { url: String, image: Vec<u8> },
    Message { url: String, text: String },
    /// The camera answered with a status other than 200 or 401.
    Status { url: String, status: u16 },
    Fault { url: String, reason: String },
    AuthFailed { url: String, reason: AuthAbort },
    Closed { url: String },
}

#[derive(Debug)]
struct Dispatch {
    method: String,
    url: String,
    digest: Option<String>,
    /// Sent again unchanged when the request is resent after a 401.
    body: Option<String>,
}

struct Shared {
    camera_id: String,
    host: String,
    port: u16,
    config: ClientConfig,
    auth: Arc<Mutex<AuthSession>>,
    registry: ConnectionRegistry,
    idle: IdlePolicy,
    observer: Option<Arc<dyn SessionObserver>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    resend: mpsc::UnboundedSender<Dispatch>,
    online: AtomicBool,
    last_snapshot: Mutex<Option<Vec<u8>>>,
}

impl Shared {
    /// Connect, register and write one request, then hand the socket to
    /// its reader task.
    async fn open(self: &Arc<Self>, dispatch: Dispatch) -> Result<Connection> {
        let (host, port, path) = split_target(&dispatch.url, &self.host, self.port)?;
        let addr = format!("{host}:{port}");

        let mut stream = time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr.clone()))??;
        stream.set_nodelay(true)?;

        let key = PurposeKey::new(&self.camera_id, &dispatch.url);
        let connection = Connection::new();
        self.registry.clean_stale();
        self.registry.track(key.clone(), connection.clone());

        let mut request = HttpRequest::new(&dispatch.method, &path).for_host(&host, port);
        if let Some(body) = &dispatch.body {
            request = request.with_body(body.clone());
        }
        self.auth
            .lock()
            .annotate_outgoing_request(&mut request, dispatch.digest.as_deref());

        if let Err(e) = stream.write_all(request.serialize().as_bytes()).await {
            connection.close();
            return Err(ClientError::ConnectionClosed(format!("{key}: {e}")));
        }

        tracing::debug!(
            %key,
            connection = connection.id(),
            method = %dispatch.method,
            authorized = request.get_header("Authorization").is_some(),
            "request sent"
        );

        tokio::spawn(Arc::clone(self).drive(
            key,
            dispatch.method,
            dispatch.body,
            connection.clone(),
            stream,
        ));
        Ok(connection)
    }

    /// Read loop of one connection. Returns when the connection closes.
    async fn drive(
        self: Arc<Self>,
        key: PurposeKey,
        method: String,
        body: Option<String>,
        connection: Connection,
        mut stream: TcpStream,
    ) {
        let stream_purpose = self.config.stream_url.as_deref() == Some(key.url.as_str());
        let demux = ResponseDemultiplexer::new(&self.camera_id, stream_purpose)
            .with_image_buffer(self.config.image_fallback_len, self.config.fixed_image_buffer)
            .with_text_limit(self.config.max_text_len);
        let mut pipeline = ConnectionPipeline::new(
            key.clone(),
            &method,
            connection.clone(),
            self.auth.clone(),
            demux,
            self.registry.clone(),
        );
        if let Some(observer) = &self.observer {
            pipeline = pipeline.with_observer(observer.clone());
        }

        let mut framer = ResponseFramer::new();
        let mut buf = vec![0u8; READ_BUFFER_LEN];

        let reason = loop {
            let read = tokio::select! {
                _ = connection.closed() => break "closed locally",
                read = time::timeout(self.config.idle_timeout, stream.read(&mut buf)) => read,
            };

            let units = match read {
                Err(_) => match self.idle.on_idle_timeout(&connection, &key) {
                    IdleDecision::KeepOpen => continue,
                    IdleDecision::Close => break "idle timeout",
                },
                Ok(Ok(0)) => {
                    self.process(&mut pipeline, &key, body.as_deref(), framer.finish());
                    break "closed by camera";
                }
                Ok(Ok(n)) => match framer.feed(&buf[..n]) {
                    Ok(units) => units,
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "malformed response");
                        self.emit(ClientEvent::Fault {
                            url: key.url.clone(),
                            reason: e.to_string(),
                        });
                        break "malformed response";
                    }
                },
                Ok(Err(e)) => {
                    tracing::debug!(%key, error = %e, "read error");
                    break "read error";
                }
            };

            self.process(&mut pipeline, &key, body.as_deref(), units);
            if !connection.is_open() {
                break "closed locally";
            }
        };

        connection.close();
        tracing::info!(%key, connection = connection.id(), reason, "connection closed");
        self.emit(ClientEvent::Closed { url: key.url });
    }

    fn process(
        &self,
        pipeline: &mut ConnectionPipeline,
        key: &PurposeKey,
        body: Option<&str>,
        units: Vec<InboundUnit>,
    ) {
        for unit in units {
            for output in pipeline.on_unit(unit) {
                self.handle_output(key, body, output);
            }
        }
    }

    fn handle_output(&self, key: &PurposeKey, body: Option<&str>, output: PipelineOutput) {
        let url = key.url.clone();
        let event = match output {
            PipelineOutput::Auth(AuthOutcome::Resend { method, url, digest }) => {
                let dispatch = Dispatch {
                    method,
                    url,
                    digest,
                    body: body.map(str::to_string),
                };
                if self.resend.send(dispatch).is_err() {
                    tracing::debug!(%key, "client disposed, dropping resend");
                }
                return;
            }
            PipelineOutput::Auth(AuthOutcome::Abort(reason)) => ClientEvent::AuthFailed { url, reason },
            PipelineOutput::Demux(event) => match event {
                DemuxEvent::NonOkStatus(status) => ClientEvent::Status { url, status },
                DemuxEvent::StreamStarted {
                    content_type,
                    boundary,
                } => ClientEvent::StreamStarted {
                    url,
                    content_type,
                    boundary,
                },
                DemuxEvent::FrameChunk(data) => ClientEvent::Frame { url, data },
                DemuxEvent::SnapshotReady(image) => {
                    *self.last_snapshot.lock() = Some(image.clone());
                    ClientEvent::Snapshot { url, image }
                }
                DemuxEvent::MessageReady(text) => ClientEvent::Message { url, text },
                DemuxEvent::SizeMismatch { expected, received } => ClientEvent::Fault {
                    url,
                    reason: format!("image larger than expected: {received} > {expected} bytes"),
                },
                DemuxEvent::ProcessingFault(reason) => ClientEvent::Fault { url, reason },
                DemuxEvent::Close => return,
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(camera = %self.camera_id, "event receiver dropped");
        }
    }
}

impl CameraSession for Shared {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn latest_snapshot(&self) -> Option<Vec<u8>> {
        self.last_snapshot.lock().clone()
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = requests.recv().await {
        let url = dispatch.url.clone();
        if let Err(e) = shared.open(dispatch).await {
            tracing::warn!(camera = %shared.camera_id, %url, error = %e, "resend failed");
            shared.emit(ClientEvent::Fault {
                url,
                reason: e.to_string(),
            });
        }
    }
}

/// Split a request URL into host, port and origin-form path.
///
/// Paths (`/cgi-bin/...`) go to the camera's own address; absolute
/// `http://host[:port]/path` URLs go where they point.
fn split_target(url: &str, default_host: &str, default_port: u16) -> Result<(String, u16, String)> {
    if url.starts_with('/') {
        return Ok((default_host.to_string(), default_port, url.to_string()));
    }

    let invalid = || ClientError::InvalidUrl(url.to_string());
    let rest = url.strip_prefix("http://").ok_or_else(invalid)?;
    let (authority, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, 80),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port, path.to_string()))
}

/// Client for one camera.
///
/// Owns the camera's authentication state, shared by all of its
/// connections, and registers the camera with the connection and group
/// registries it is given.
pub struct CameraClient {
    camera_id: String,
    host: String,
    port: u16,
    config: ClientConfig,
    auth: Arc<Mutex<AuthSession>>,
    registry: ConnectionRegistry,
    idle: IdlePolicy,
    groups: Option<CameraGroupRegistry>,
    observer: Option<Arc<dyn SessionObserver>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    shared: Option<Arc<Shared>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl CameraClient {
    pub fn new(
        camera_id: &str,
        host: &str,
        port: u16,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new();
        let auth = AuthSession::new(camera_id, config.credentials.clone(), config.digest_allowed);
        let client = CameraClient {
            camera_id: camera_id.to_string(),
            host: host.to_string(),
            port,
            config,
            auth: Arc::new(Mutex::new(auth)),
            idle: IdlePolicy::new(registry.clone()),
            registry,
            groups: None,
            observer: None,
            events,
            shared: None,
            dispatcher: None,
        };
        (client, rx)
    }

    /// Use a process-wide connection registry instead of a private one.
    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.idle = IdlePolicy::new(registry.clone());
        self.registry = registry;
        self
    }

    pub fn with_groups(mut self, groups: CameraGroupRegistry) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start the resend dispatcher and bring the camera online.
    ///
    /// Must be called from within a tokio runtime. Idempotent.
    pub fn start(&mut self) {
        if self.shared.is_some() {
            return;
        }

        let (resend, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            camera_id: self.camera_id.clone(),
            host: self.host.clone(),
            port: self.port,
            config: self.config.clone(),
            auth: self.auth.clone(),
            registry: self.registry.clone(),
            idle: self.idle.clone(),
            observer: self.observer.clone(),
            events: self.events.clone(),
            resend,
            online: AtomicBool::new(true),
            last_snapshot: Mutex::new(None),
        });

        if let Some(url) = self.config.pinned_url() {
            self.idle.pin(&self.camera_id, url);
        }
        if let Some(groups) = &self.groups {
            groups.register_session(&self.camera_id, shared.clone());
        }

        self.dispatcher = Some(tokio::spawn(dispatch_loop(shared.clone(), requests)));
        self.shared = Some(shared);
        tracing::info!(camera = %self.camera_id, host = %self.host, port = self.port, "camera client started");
    }

    pub fn is_started(&self) -> bool {
        self.shared.is_some()
    }

    /// Send `method url` on a new connection.
    ///
    /// Returns once the request is written; the response arrives as events.
    pub async fn send(&self, method: &str, url: &str) -> Result<Connection> {
        self.dispatch(method, url, None).await
    }

    /// Send `method url` with a request body, as for camera settings
    /// written with `PUT` or `POST`. The body goes out again if the camera
    /// asks for authentication.
    pub async fn send_with_body(&self, method: &str, url: &str, body: &str) -> Result<Connection> {
        self.dispatch(method, url, Some(body.to_string())).await
    }

    async fn dispatch(&self, method: &str, url: &str, body: Option<String>) -> Result<Connection> {
        let shared = self.shared.as_ref().ok_or(ClientError::NotStarted)?;
        shared
            .open(Dispatch {
                method: method.to_string(),
                url: url.to_string(),
                digest: None,
                body,
            })
            .await
    }

    /// Send `GET url` and wait for its text reply.
    ///
    /// The reply is taken from the registry's last-message slot, so a reply
    /// delivered after an authentication resend is still seen. `Ok(None)`
    /// on timeout.
    pub async fn request_reply(&self, url: &str, timeout: Duration) -> Result<Option<String>> {
        self.send("GET", url).await?;
        let key = PurposeKey::new(&self.camera_id, url);
        Ok(self.registry.wait_for_message(&key, timeout).await)
    }

    /// Whether the designated video stream has no live connection.
    pub fn is_stream_stopped(&self) -> bool {
        match &self.config.stream_url {
            Some(url) => self
                .registry
                .is_stream_stopped(&PurposeKey::new(&self.camera_id, url)),
            None => true,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.lock().state()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn idle_policy(&self) -> &IdlePolicy {
        &self.idle
    }

    /// Close every connection, forget credentials state and go offline.
    pub fn dispose(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        let closed = self.registry.close_camera(&self.camera_id);
        self.auth.lock().dispose();
        self.idle.unpin(&self.camera_id);
        if let Some(groups) = &self.groups {
            groups.unregister_session(&self.camera_id);
        }
        if let Some(shared) = self.shared.take() {
            shared.online.store(false, Ordering::SeqCst);
        }
        tracing::info!(camera = %self.camera_id, closed, "camera client disposed");
    }
}

impl Drop for CameraClient {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}
