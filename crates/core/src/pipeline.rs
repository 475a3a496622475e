//! Per-connection processing chain.
//!
//! Inbound units go through authentication first, so 401 challenges are
//! intercepted before anything else sees them, then through the
//! [`ResponseDemultiplexer`]. Side effects on shared state (registry
//! slot, connection close, session status) happen here; the driver only
//! moves bytes and acts on the returned [`PipelineOutput`]s.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::auth::{AuthAbort, AuthAction, AuthSession};
use crate::connection::Connection;
use crate::demux::{DemuxEvent, ResponseDemultiplexer};
use crate::protocol::{InboundUnit, ResponseHead};
use crate::registry::{ConnectionRegistry, PurposeKey};

/// Camera session status, as reported to the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Online,
    Offline,
    Error,
}

/// The camera session that owns a set of connections.
pub trait SessionObserver: Send + Sync {
    /// Tear the session down and show `message` to the user.
    fn dispose_and_set_status(&self, status: SessionStatus, message: &str);
}

/// What the driver must do after a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Send `method url` again on a new connection. `digest` is the
    /// single-use Digest value for that request, if any.
    Resend {
        method: String,
        url: String,
        digest: Option<String>,
    },
    Abort(AuthAbort),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutput {
    Auth(AuthOutcome),
    Demux(DemuxEvent),
}

pub struct ConnectionPipeline {
    key: PurposeKey,
    method: String,
    connection: Connection,
    auth: Arc<Mutex<AuthSession>>,
    demux: ResponseDemultiplexer,
    registry: ConnectionRegistry,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl ConnectionPipeline {
    pub fn new(
        key: PurposeKey,
        method: &str,
        connection: Connection,
        auth: Arc<Mutex<AuthSession>>,
        demux: ResponseDemultiplexer,
        registry: ConnectionRegistry,
    ) -> Self {
        ConnectionPipeline {
            key,
            method: method.to_string(),
            connection,
            auth,
            demux,
            registry,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn key(&self) -> &PurposeKey {
        &self.key
    }

    pub fn demux(&self) -> &ResponseDemultiplexer {
        &self.demux
    }

    /// Process one inbound unit. Outputs are in production order.
    pub fn on_unit(&mut self, unit: InboundUnit) -> Vec<PipelineOutput> {
        if !self.connection.is_open() {
            return Vec::new();
        }

        if let InboundUnit::Headers(head) = &unit
            && head.status == 401
        {
            let outcome = self.on_unauthorized(head);
            self.connection.close();
            return vec![PipelineOutput::Auth(outcome)];
        }

        if let InboundUnit::Headers(head) = &unit {
            self.log_status(head);
        }

        let events = self.demux.on_unit(unit);
        for event in &events {
            match event {
                DemuxEvent::MessageReady(message) => {
                    self.registry.record_last_message(&self.key, message);
                }
                DemuxEvent::Close => self.connection.close(),
                _ => {}
            }
        }
        events.into_iter().map(PipelineOutput::Demux).collect()
    }

    fn on_unauthorized(&mut self, head: &ResponseHead) -> AuthOutcome {
        let Some(challenge) = select_challenge(head) else {
            tracing::warn!(key = %self.key, "401 without WWW-Authenticate");
            return self.abort(AuthAbort::NoChallenge);
        };

        let action = self
            .auth
            .lock()
            .on_challenge(challenge, &self.method, &self.key.url);

        match action {
            AuthAction::ResendWithBasic(_) => AuthOutcome::Resend {
                method: self.method.clone(),
                url: self.key.url.clone(),
                digest: None,
            },
            AuthAction::ResendWithDigest(digest) => AuthOutcome::Resend {
                method: self.method.clone(),
                url: self.key.url.clone(),
                digest: Some(digest),
            },
            AuthAction::Abort(reason) => self.abort(reason),
        }
    }

    fn abort(&self, reason: AuthAbort) -> AuthOutcome {
        if reason.is_fatal() {
            tracing::error!(key = %self.key, %reason, "authentication failed");
            if let Some(observer) = &self.observer {
                observer.dispose_and_set_status(SessionStatus::Error, &reason.to_string());
            }
        }
        AuthOutcome::Abort(reason)
    }

    fn log_status(&self, head: &ResponseHead) {
        match head.status {
            200 => {}
            404 => {
                tracing::warn!(key = %self.key, "camera does not support this URL (404)")
            }
            status => {
                tracing::debug!(key = %self.key, status, reason = %head.reason, "camera replied")
            }
        }
    }
}

/// The challenge to answer when a 401 carries several. Digest wins.
fn select_challenge(head: &ResponseHead) -> Option<&str> {
    let challenges = head.get_all("WWW-Authenticate");
    challenges
        .iter()
        .find(|c| {
            c.trim_start()
                .get(..6)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest"))
        })
        .or(challenges.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;

    const URL: &str = "/alarm.cgi";

    #[derive(Default)]
    struct RecordingObserver {
        calls: Mutex<Vec<(SessionStatus, String)>>,
    }

    impl SessionObserver for RecordingObserver {
        fn dispose_and_set_status(&self, status: SessionStatus, message: &str) {
            self.calls.lock().push((status, message.to_string()));
        }
    }

    struct Fixture {
        pipeline: ConnectionPipeline,
        connection: Connection,
        registry: ConnectionRegistry,
        auth: Arc<Mutex<AuthSession>>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(password: &str) -> Fixture {
        let registry = ConnectionRegistry::new();
        let connection = Connection::new();
        let key = PurposeKey::new("cam1", URL);
        registry.track(key.clone(), connection.clone());
        let auth = Arc::new(Mutex::new(AuthSession::new(
            "cam1",
            Credentials::new("admin", password),
            true,
        )));
        let observer = Arc::new(RecordingObserver::default());
        let pipeline = ConnectionPipeline::new(
            key,
            "GET",
            connection.clone(),
            auth.clone(),
            ResponseDemultiplexer::new("cam1", false),
            registry.clone(),
        )
        .with_observer(observer.clone());
        Fixture {
            pipeline,
            connection,
            registry,
            auth,
            observer,
        }
    }

    fn unauthorized(challenges: &[&str]) -> InboundUnit {
        let head = challenges
            .iter()
            .fold(ResponseHead::new(401), |head, c| {
                head.with_header("WWW-Authenticate", c)
            });
        InboundUnit::Headers(head)
    }

    #[test]
    fn digest_challenge_requests_resend() {
        let mut f = fixture("secret");
        let outputs = f.pipeline.on_unit(unauthorized(&[
            r#"Digest realm="cam", qop="auth", nonce="n1""#,
        ]));

        match outputs.as_slice() {
            [PipelineOutput::Auth(AuthOutcome::Resend { method, url, digest })] => {
                assert_eq!(method, "GET");
                assert_eq!(url, URL);
                assert!(digest.as_deref().is_some_and(|d| d.contains("realm=\"cam\"")));
            }
            other => panic!("unexpected outputs: {other:?}"),
        }
        assert!(!f.connection.is_open());
        assert_eq!(f.auth.lock().request_counter(), 1);
    }

    #[test]
    fn digest_preferred_over_basic() {
        let mut f = fixture("secret");
        let outputs = f.pipeline.on_unit(unauthorized(&[
            r#"Basic realm="cam""#,
            r#"Digest realm="cam", qop="auth", nonce="n1""#,
        ]));
        assert!(matches!(
            outputs.as_slice(),
            [PipelineOutput::Auth(AuthOutcome::Resend { digest: Some(_), .. })]
        ));
        assert!(f.auth.lock().is_digest_active());
    }

    #[test]
    fn missing_challenge_is_fatal() {
        let mut f = fixture("secret");
        let outputs = f.pipeline.on_unit(unauthorized(&[]));
        assert_eq!(
            outputs,
            vec![PipelineOutput::Auth(AuthOutcome::Abort(AuthAbort::NoChallenge))]
        );
        let calls = f.observer.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, SessionStatus::Error);
    }

    #[test]
    fn missing_password_sets_error_status() {
        let mut f = fixture("");
        let outputs = f
            .pipeline
            .on_unit(unauthorized(&[r#"Digest realm="cam", qop="auth", nonce="n1""#]));
        assert_eq!(
            outputs,
            vec![PipelineOutput::Auth(AuthOutcome::Abort(AuthAbort::MissingPassword))]
        );
        assert_eq!(
            f.observer.calls.lock()[0].1,
            "Camera gave a 401 reply: You need to provide a password."
        );
    }

    #[test]
    fn malformed_challenge_is_silent() {
        let mut f = fixture("secret");
        let outputs = f.pipeline.on_unit(unauthorized(&[r#"Digest nonce="n1""#]));
        assert_eq!(
            outputs,
            vec![PipelineOutput::Auth(AuthOutcome::Abort(AuthAbort::MalformedChallenge))]
        );
        assert!(f.observer.calls.lock().is_empty());
    }

    #[test]
    fn message_updates_registry_slot() {
        let mut f = fixture("secret");
        let head = ResponseHead::new(200).with_header("Content-Type", "text/plain");
        f.pipeline.on_unit(InboundUnit::Headers(head));
        let outputs = f.pipeline.on_unit(InboundUnit::Body {
            data: b"var alarm=1;".to_vec(),
            last: true,
        });

        assert_eq!(
            outputs,
            vec![PipelineOutput::Demux(DemuxEvent::MessageReady(
                "var alarm=1;".to_string()
            ))]
        );
        let handle = f.registry.get(&PurposeKey::new("cam1", URL)).unwrap();
        assert_eq!(handle.last_message.as_deref(), Some("var alarm=1;"));
    }

    #[test]
    fn truncated_reply_still_reaches_registry() {
        let mut f = fixture("secret");
        let head = ResponseHead::new(200)
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Length", "100");
        f.pipeline.on_unit(InboundUnit::Headers(head));
        let outputs = f.pipeline.on_unit(InboundUnit::Body {
            data: b"motion=1".to_vec(),
            last: false,
        });
        assert!(outputs.is_empty());

        let outputs = f.pipeline.on_unit(InboundUnit::Other);
        assert_eq!(
            outputs,
            vec![PipelineOutput::Demux(DemuxEvent::MessageReady(
                "motion=1".to_string()
            ))]
        );
        let handle = f.registry.get(&PurposeKey::new("cam1", URL)).unwrap();
        assert_eq!(handle.last_message.as_deref(), Some("motion=1"));
    }

    #[test]
    fn snapshot_closes_connection() {
        let mut f = fixture("secret");
        let head = ResponseHead::new(200)
            .with_header("Content-Type", "image/jpeg")
            .with_header("Content-Length", "2");
        f.pipeline.on_unit(InboundUnit::Headers(head));
        let outputs = f.pipeline.on_unit(InboundUnit::Body {
            data: vec![0xff, 0xd8],
            last: true,
        });
        assert_eq!(outputs.len(), 2);
        assert!(!f.connection.is_open());

        // Nothing more is processed on a closed connection.
        assert!(f.pipeline.on_unit(InboundUnit::Other).is_empty());
    }
}
