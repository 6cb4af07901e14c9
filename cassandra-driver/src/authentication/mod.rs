//! SASL authentication performed while a connection starts up.
//!
//! When the server answers STARTUP with AUTHENTICATE, the connection asks
//! the configured [`AuthenticatorProvider`] for an initial token and an
//! [`AuthenticatorSession`], then drives the AUTH_RESPONSE / AUTH_CHALLENGE
//! exchange until the server sends AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// Trait used to represent a user-defined custom authentication.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// To handle an authentication challenge initiated by the server.
    /// The information contained in the token parameter is authentication protocol specific.
    /// It may be NULL or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// To handle the success phase of exchange.
    /// The token parameters contain information that may be used to finalize the request.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Trait used to represent a factory of [`AuthenticatorSession`] instances.
/// A new [`AuthenticatorSession`] instance will be created for each connection.
///
/// The custom authenticator can be set using `SessionBuilder::authenticator_provider` method.
///
/// Default: [`PlainTextAuthenticator`] is the default authenticator which requires username and
/// password. It can be set by using `SessionBuilder::user("user", "pass")` method.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// A pair of initial response and boxed [`AuthenticatorSession`]
    /// should be returned if authentication is required by the server.
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
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Default authenticator provider that requires username and password if authentication is required.
///
/// The initial token is `\0username\0password`, as expected by
/// `PasswordAuthenticator` on the server side.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }

    fn initial_token(&self) -> Vec<u8> {
        let mut response = BytesMut::with_capacity(self.username.len() + self.password.len() + 2);

        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        response.to_vec()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthenticatorProvider, PlainTextAuthenticator};

    #[tokio::test]
    async fn plain_text_token_layout() {
        let provider = PlainTextAuthenticator::new("cassandra".to_owned(), "secret".to_owned());
        let (token, mut session) = provider
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        assert_eq!(token.unwrap(), b"\0cassandra\0secret".to_vec());
        assert!(session.evaluate_challenge(Some(b"more?")).await.is_err());
        session.success(None).await.unwrap();
    }

    #[test]
    fn debug_hides_password() {
        let provider = PlainTextAuthenticator::new("user".to_owned(), "hunter2".to_owned());
        let debug = format!("{:?}", provider);
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }
}
