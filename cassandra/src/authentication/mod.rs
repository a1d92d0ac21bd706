//! SASL-style authentication performed during the connection handshake.
//!
//! When a node answers STARTUP with AUTHENTICATE, the connection asks the configured
//! [`AuthenticatorProvider`] for an initial token and keeps exchanging
//! AUTH_RESPONSE / AUTH_CHALLENGE messages with the returned [`AuthenticatorSession`]
//! until the node sends AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange, bound to a single connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers a challenge sent by the node. The token is protocol specific
    /// and may be absent.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called with the final token sent along with AUTH_SUCCESS.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s, one per opened connection.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial response together with the session that will
    /// handle the rest of the exchange. `authenticator_name` is the server-side
    /// authenticator class announced in AUTHENTICATE.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during plain text authentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication understood by `PasswordAuthenticator`.
///
/// The initial response is `\0username\0password`.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial_response(&self) -> Vec<u8> {
        let mut response =
            BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_response()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_initial_response() {
        let auth = PlainTextAuthenticator::new("cassandra", "secret");
        let (response, mut session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(response.unwrap(), b"\0cassandra\0secret".to_vec());
        assert!(session.evaluate_challenge(Some(b"x")).await.is_err());
        assert!(session.success(None).await.is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let auth = PlainTextAuthenticator::new("user", "hunter2");
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
