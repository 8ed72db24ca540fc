use assert_matches::assert_matches;
use async_trait::async_trait;
use helenus::authentication::{AuthError, AuthenticatorProvider, AuthenticatorSession};
use helenus::errors::{ConnectionError, NewSessionError};
use std::sync::Arc;

use crate::utils::{builder_for, fast_reconnect, setup_tracing, MockNode, MockNodeConfig};

async fn node_with_credentials() -> MockNode {
    MockNode::start_with(MockNodeConfig {
        credentials: Some(("cassandra".to_owned(), "cassandra".to_owned())),
        ..Default::default()
    })
    .await
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn authenticate_with_password() {
    setup_tracing();
    let node = node_with_credentials().await;

    let session = builder_for(&node)
        .user("cassandra", "cassandra")
        .build()
        .await
        .unwrap();
    session
        .query(
            "CREATE KEYSPACE IF NOT EXISTS ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}",
            (),
        )
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn wrong_password_is_rejected() {
    setup_tracing();
    let node = node_with_credentials().await;

    let err = builder_for(&node)
        .user("cassandra", "not-the-password")
        .reconnect_policy(fast_reconnect(Some(1)))
        .build()
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NewSessionError::NoConnections(ConnectionError::SetupRequestError { .. })
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn missing_authenticator_is_reported() {
    setup_tracing();
    let node = node_with_credentials().await;

    let err = builder_for(&node)
        .reconnect_policy(fast_reconnect(Some(1)))
        .build()
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NewSessionError::NoConnections(ConnectionError::MissingAuthentication(_))
    );
}

struct CustomAuthenticator;

#[async_trait]
impl AuthenticatorSession for CustomAuthenticator {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

struct CustomAuthenticatorProvider;

#[async_trait]
impl AuthenticatorProvider for CustomAuthenticatorProvider {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let cred = "\0cassandra\0cassandra";
        Ok((
            Some(cred.as_bytes().to_vec()),
            Box::new(CustomAuthenticator),
        ))
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn custom_authentication() {
    setup_tracing();
    let node = node_with_credentials().await;

    let session = builder_for(&node)
        .authenticator_provider(Arc::new(CustomAuthenticatorProvider))
        .build()
        .await
        .unwrap();
    session
        .query("CREATE KEYSPACE ks WITH replication = {}", ())
        .await
        .unwrap();
}
