//! HTTP Basic/Digest challenge-response authentication.
//!
//! Cameras answer an unauthenticated request with `401 Unauthorized` and a
//! `WWW-Authenticate` challenge. [`AuthSession::on_challenge`] turns that
//! challenge into the `Authorization` value for the resent request, or into
//! an [`AuthAbort`] reason.
//!
//! ## State machine
//!
//! ```text
//! Unauthenticated --Basic challenge--> BasicActive
//! Unauthenticated --Digest (qop)-----> DigestActive
//! BasicActive     --Digest (qop)-----> DigestActive
//! DigestActive    --Basic challenge--> DigestActive   (downgrade rejected)
//! any             --dispose()--------> Unauthenticated
//! ```
//!
//! Once Digest has been negotiated the session never falls back to Basic,
//! which would put the password on the wire.
//!
//! One session exists per camera and is shared by all of that camera's
//! connections: the resend after a 401 travels on a fresh connection and
//! must see the same nonce counter and Basic cache.

pub mod digest;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::protocol::HttpRequest;
use digest::{DigestChallenge, build_digest_response, next_counter};

/// Username and password for one camera.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Why a challenge did not produce a resend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthAbort {
    /// A Basic challenge arrived after Digest was negotiated. Ignored.
    #[error("basic challenge rejected after digest was negotiated")]
    DowngradeRejected,

    /// A Basic challenge arrived while Basic credentials were already in use,
    /// so the camera refused them.
    #[error("Camera is reporting your username and/or password is wrong.")]
    CredentialsRejected,

    /// The challenge carried no `realm`.
    #[error("could not find a valid WWW-Authenticate realm")]
    MalformedChallenge,

    /// Digest was requested but no password is configured.
    #[error("Camera gave a 401 reply: You need to provide a password.")]
    MissingPassword,

    /// Basic was requested but the username or password is empty.
    #[error("Camera is asking for Basic Auth when you have not provided a username and/or password.")]
    MissingCredentials,

    /// Digest was requested but is disabled for this camera.
    #[error("Camera requires Digest authentication, which is disabled for this camera.")]
    DigestNotAllowed,

    /// A 401 arrived without any `WWW-Authenticate` header.
    #[error("Camera gave no WWW-Authenticate: Your login details must be wrong.")]
    NoChallenge,
}

impl AuthAbort {
    /// Whether the camera session should be put into ERROR status.
    ///
    /// `DowngradeRejected` is a silent security control and
    /// `MalformedChallenge` is only logged; everything else needs the user
    /// to fix the camera's configuration.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DowngradeRejected | Self::MalformedChallenge)
    }
}

/// Result of handling one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Resend the request with `Authorization: Basic <value>`.
    ResendWithBasic(String),
    /// Resend the request with `Authorization: Digest <value>`. The value is
    /// single use, bound to the method and URI it was computed for.
    ResendWithDigest(String),
    /// Do not resend.
    Abort(AuthAbort),
}

/// Observable authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    BasicActive,
    DigestActive,
}

/// Per-camera authentication state.
#[derive(Debug)]
pub struct AuthSession {
    camera: String,
    credentials: Credentials,
    digest_allowed: bool,
    /// Cached `base64(user:pass)`.
    basic_auth: Option<String>,
    digest_active: bool,
    /// Last nonce count sent; 0 until the first digest attempt.
    request_counter: u8,
}

impl AuthSession {
    pub fn new(camera: &str, credentials: Credentials, digest_allowed: bool) -> Self {
        AuthSession {
            camera: camera.to_string(),
            credentials,
            digest_allowed,
            basic_auth: None,
            digest_active: false,
            request_counter: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        if self.digest_active {
            AuthState::DigestActive
        } else if self.basic_auth.is_some() {
            AuthState::BasicActive
        } else {
            AuthState::Unauthenticated
        }
    }

    pub fn basic_auth(&self) -> Option<&str> {
        self.basic_auth.as_deref()
    }

    pub fn is_digest_active(&self) -> bool {
        self.digest_active
    }

    pub fn request_counter(&self) -> u8 {
        self.request_counter
    }

    /// Handle a `WWW-Authenticate` value received for `method uri`.
    pub fn on_challenge(&mut self, challenge: &str, method: &str, uri: &str) -> AuthAction {
        if challenge.trim_start().starts_with("Basic realm=\"") {
            return self.on_basic_challenge();
        }
        self.on_digest_challenge(challenge, method, uri)
    }

    fn on_basic_challenge(&mut self) -> AuthAction {
        if self.digest_active {
            tracing::debug!(camera = %self.camera, "ignoring basic challenge, digest already negotiated");
            return AuthAction::Abort(AuthAbort::DowngradeRejected);
        }

        tracing::debug!(camera = %self.camera, "camera requested basic auth, resending");
        match self.set_basic_auth(true) {
            Ok(true) => match &self.basic_auth {
                Some(value) => AuthAction::ResendWithBasic(value.clone()),
                None => AuthAction::Abort(AuthAbort::MissingCredentials),
            },
            Ok(false) => AuthAction::Abort(AuthAbort::MissingCredentials),
            Err(AuthAbort::CredentialsRejected) => {
                self.basic_auth = None;
                AuthAction::Abort(AuthAbort::CredentialsRejected)
            }
            Err(reason) => AuthAction::Abort(reason),
        }
    }

    fn on_digest_challenge(&mut self, challenge: &str, method: &str, uri: &str) -> AuthAction {
        if !self.digest_allowed {
            tracing::warn!(camera = %self.camera, "camera requested digest auth, which is disabled");
            return AuthAction::Abort(AuthAbort::DigestNotAllowed);
        }

        let challenge_attrs = DigestChallenge::parse(challenge);
        if challenge_attrs.realm.is_empty() {
            tracing::warn!(camera = %self.camera, challenge, "no realm in WWW-Authenticate");
            return AuthAction::Abort(AuthAbort::MalformedChallenge);
        }

        if challenge_attrs.qop.is_empty() {
            // Some firmwares omit qop; the hash is still computed with an empty qop.
            tracing::warn!(
                camera = %self.camera,
                realm = %challenge_attrs.realm,
                "digest challenge without qop"
            );
        } else {
            self.digest_active = true;
        }

        if challenge_attrs.stale {
            tracing::debug!(camera = %self.camera, "camera reported stale nonce");
        }

        if self.credentials.password.is_empty() {
            return AuthAction::Abort(AuthAbort::MissingPassword);
        }

        let cnonce = format!("{:x}", rand::random::<u32>());
        self.request_counter = next_counter(self.request_counter);
        let nc = format!("{:08X}", self.request_counter);

        let response = build_digest_response(
            &self.credentials.username,
            &challenge_attrs.realm,
            &self.credentials.password,
            &challenge_attrs.nonce,
            &challenge_attrs.qop,
            &cnonce,
            &nc,
            method,
            uri,
        );

        let mut value = format!(
            "username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", cnonce=\"{}\", nc={}, qop=\"{}\", response=\"{}\"",
            self.credentials.username,
            challenge_attrs.realm,
            challenge_attrs.nonce,
            uri,
            cnonce,
            nc,
            challenge_attrs.qop,
            response
        );
        if !challenge_attrs.opaque.is_empty() {
            value.push_str(&format!(", opaque=\"{}\"", challenge_attrs.opaque));
        }

        tracing::debug!(camera = %self.camera, method, uri, nc = %nc, "computed digest response");
        AuthAction::ResendWithDigest(value)
    }

    /// Enable or clear the cached Basic credentials.
    ///
    /// - `false` clears the cache and returns `Ok(false)`.
    /// - `true` with a cache already present returns
    ///   `Err(CredentialsRejected)` and leaves the cache as it is.
    /// - `true` with credentials stores `base64(user:pass)` and returns
    ///   `Ok(true)`; without credentials returns `Err(MissingCredentials)`.
    pub fn set_basic_auth(&mut self, enable: bool) -> Result<bool, AuthAbort> {
        if !enable {
            tracing::debug!(camera = %self.camera, "clearing stored basic auth");
            self.basic_auth = None;
            return Ok(false);
        }

        if self.basic_auth.is_some() {
            // Requests sent before the cache was set can trigger this falsely.
            tracing::warn!(camera = %self.camera, "camera is reporting the username and/or password is wrong");
            return Err(AuthAbort::CredentialsRejected);
        }

        let Credentials { username, password } = &self.credentials;
        if username.is_empty() || password.is_empty() {
            return Err(AuthAbort::MissingCredentials);
        }

        self.basic_auth = Some(BASE64_STANDARD.encode(format!("{username}:{password}")));
        Ok(true)
    }

    /// Attach the `Authorization` header to an outgoing request.
    ///
    /// `digest` is the value returned by [`on_challenge`](Self::on_challenge)
    /// for this exact request; digest values are never reused.
    pub fn annotate_outgoing_request(&mut self, request: &mut HttpRequest, digest: Option<&str>) {
        if let Some(basic) = &self.basic_auth {
            if self.digest_active {
                tracing::warn!(camera = %self.camera, "both basic and digest were set, dropping basic");
                self.basic_auth = None;
            } else {
                request.set_header("Authorization", &format!("Basic {basic}"));
            }
        }

        if self.digest_active
            && let Some(digest) = digest
        {
            request.set_header("Authorization", &format!("Digest {digest}"));
        }
    }

    /// Forget all negotiated state.
    pub fn dispose(&mut self) {
        self.basic_auth = None;
        self.digest_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AuthSession {
        AuthSession::new("cam1", Credentials::new("user", "pass"), true)
    }

    fn digest_field<'a>(value: &'a str, name: &str) -> &'a str {
        crate::scan::extract_between(value, &format!("{name}=\""))
    }

    #[test]
    fn basic_challenge_resends_with_basic() {
        let mut auth = session();
        let action = auth.on_challenge(r#"Basic realm="cam""#, "GET", "/snap.jpg");
        assert_eq!(action, AuthAction::ResendWithBasic("dXNlcjpwYXNz".to_string()));
        assert_eq!(auth.state(), AuthState::BasicActive);
    }

    #[test]
    fn second_basic_challenge_rejects_credentials() {
        let mut auth = session();
        auth.on_challenge(r#"Basic realm="cam""#, "GET", "/snap.jpg");
        let action = auth.on_challenge(r#"Basic realm="cam""#, "GET", "/snap.jpg");
        assert_eq!(action, AuthAction::Abort(AuthAbort::CredentialsRejected));
        assert_eq!(auth.basic_auth(), None);
    }

    #[test]
    fn basic_without_credentials_aborts() {
        let mut auth = AuthSession::new("cam1", Credentials::new("", ""), true);
        let action = auth.on_challenge(r#"Basic realm="cam""#, "GET", "/");
        assert_eq!(action, AuthAction::Abort(AuthAbort::MissingCredentials));
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn digest_challenge_resends_with_digest() {
        let mut auth = AuthSession::new("cam1", Credentials::new("u", "p"), true);
        let action = auth.on_challenge(
            r#"Digest qop="auth", realm="R", nonce="N""#,
            "GET",
            "/snap.jpg",
        );
        let AuthAction::ResendWithDigest(value) = action else {
            panic!("expected digest resend, got {action:?}");
        };
        assert!(value.starts_with(r#"username="u", realm="R", nonce="N", uri="/snap.jpg""#));
        assert!(value.contains(", nc=00000001, "));
        assert!(value.contains(r#"qop="auth""#));
        assert!(!value.contains("opaque"));

        let response = digest_field(&value, "response");
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));

        let cnonce = digest_field(&value, "cnonce");
        let expected = build_digest_response("u", "R", "p", "N", "auth", cnonce, "00000001", "GET", "/snap.jpg");
        assert_eq!(response, expected);
        assert_eq!(auth.state(), AuthState::DigestActive);
    }

    #[test]
    fn digest_includes_opaque_when_present() {
        let mut auth = session();
        let action = auth.on_challenge(
            r#"Digest realm="R", qop="auth", nonce="N", opaque="O""#,
            "GET",
            "/",
        );
        let AuthAction::ResendWithDigest(value) = action else {
            panic!("expected digest resend");
        };
        assert!(value.ends_with(r#", opaque="O""#));
    }

    #[test]
    fn digest_counter_advances_per_attempt() {
        let mut auth = session();
        let challenge = r#"Digest realm="R", qop="auth", nonce="N""#;
        auth.on_challenge(challenge, "GET", "/");
        auth.on_challenge(challenge, "GET", "/");
        let AuthAction::ResendWithDigest(value) = auth.on_challenge(challenge, "GET", "/") else {
            panic!("expected digest resend");
        };
        assert_eq!(auth.request_counter(), 3);
        assert!(value.contains("nc=00000003"));
    }

    #[test]
    fn digest_without_realm_is_malformed() {
        let mut auth = session();
        let action = auth.on_challenge(r#"Digest qop="auth", nonce="N""#, "GET", "/");
        assert_eq!(action, AuthAction::Abort(AuthAbort::MalformedChallenge));
        assert!(!auth.is_digest_active());
    }

    #[test]
    fn digest_without_qop_still_proceeds() {
        let mut auth = session();
        let action = auth.on_challenge(r#"Digest realm="R", nonce="N""#, "GET", "/");
        let AuthAction::ResendWithDigest(value) = action else {
            panic!("expected digest resend");
        };
        assert!(value.contains(r#"qop="""#));
        assert!(!auth.is_digest_active());
    }

    #[test]
    fn digest_without_password_aborts() {
        let mut auth = AuthSession::new("cam1", Credentials::new("admin", ""), true);
        let action = auth.on_challenge(r#"Digest realm="R", qop="auth", nonce="N""#, "GET", "/");
        assert_eq!(action, AuthAction::Abort(AuthAbort::MissingPassword));
        assert!(AuthAbort::MissingPassword.is_fatal());
    }

    #[test]
    fn digest_disallowed_aborts() {
        let mut auth = AuthSession::new("cam1", Credentials::new("u", "p"), false);
        let action = auth.on_challenge(r#"Digest realm="R", qop="auth", nonce="N""#, "GET", "/");
        assert_eq!(action, AuthAction::Abort(AuthAbort::DigestNotAllowed));
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn basic_after_digest_is_a_downgrade() {
        let mut auth = session();
        auth.on_challenge(r#"Digest realm="R", qop="auth", nonce="N""#, "GET", "/");
        let action = auth.on_challenge(r#"Basic realm="cam""#, "GET", "/");
        assert_eq!(action, AuthAction::Abort(AuthAbort::DowngradeRejected));
        assert!(!AuthAbort::DowngradeRejected.is_fatal());
        assert_eq!(auth.basic_auth(), None);
        assert_eq!(auth.state(), AuthState::DigestActive);
    }

    #[test]
    fn set_basic_auth_cycle() {
        let mut auth = session();
        assert_eq!(auth.set_basic_auth(false), Ok(false));
        assert_eq!(auth.set_basic_auth(true), Ok(true));
        let cached = auth.basic_auth().map(str::to_string);
        assert!(cached.is_some());

        assert_eq!(auth.set_basic_auth(true), Err(AuthAbort::CredentialsRejected));
        assert_eq!(auth.basic_auth().map(str::to_string), cached);

        assert_eq!(auth.set_basic_auth(false), Ok(false));
        assert_eq!(auth.basic_auth(), None);
    }

    #[test]
    fn annotate_with_basic() {
        let mut auth = session();
        auth.set_basic_auth(true).unwrap();
        let mut request = HttpRequest::get("/snap.jpg");
        auth.annotate_outgoing_request(&mut request, None);
        assert_eq!(request.get_header("authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn annotate_with_digest_drops_basic() {
        let mut auth = session();
        auth.set_basic_auth(true).unwrap();
        let AuthAction::ResendWithDigest(digest) =
            auth.on_challenge(r#"Digest realm="R", qop="auth", nonce="N""#, "GET", "/")
        else {
            panic!("expected digest resend");
        };

        let mut request = HttpRequest::get("/");
        auth.annotate_outgoing_request(&mut request, Some(&digest));
        assert_eq!(
            request.get_header("Authorization"),
            Some(format!("Digest {digest}").as_str())
        );
        assert_eq!(auth.basic_auth(), None);

        let mut plain = HttpRequest::get("/");
        auth.annotate_outgoing_request(&mut plain, None);
        assert_eq!(plain.get_header("Authorization"), None);
    }

    #[test]
    fn dispose_resets_state() {
        let mut auth = session();
        auth.on_challenge(r#"Digest realm="R", qop="auth", nonce="N""#, "GET", "/");
        auth.dispose();
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        let action = auth.on_challenge(r#"Basic realm="cam""#, "GET", "/");
        assert!(matches!(action, AuthAction::ResendWithBasic(_)));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let text = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(text.contains("admin"));
        assert!(!text.contains("hunter2"));
    }
}
