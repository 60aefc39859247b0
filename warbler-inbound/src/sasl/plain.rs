use tracing::error;

use super::{decode_payload, success_element, AuthContext, SaslFailure, SaslOutcome};
use warbler_core::xml::Element;

/// RFC 4616 PLAIN: a single `authzid NUL authcid NUL password` payload
/// checked against the stored password.
pub struct PlainAuthenticator {
    _private: (),
}

impl PlainAuthenticator {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub async fn process_element(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
    ) -> Result<SaslOutcome, SaslFailure> {
        if element.name() != "auth" {
            return Err(SaslFailure::MalformedRequest);
        }
        let payload = decode_payload(element)?;
        let parts: Vec<&[u8]> = payload.split(|byte| *byte == 0).collect();
        if parts.len() != 3 {
            return Err(SaslFailure::MalformedRequest);
        }
        let authzid =
            std::str::from_utf8(parts[0]).map_err(|_| SaslFailure::IncorrectEncoding)?;
        let username =
            std::str::from_utf8(parts[1]).map_err(|_| SaslFailure::IncorrectEncoding)?;
        let password =
            std::str::from_utf8(parts[2]).map_err(|_| SaslFailure::IncorrectEncoding)?;
        if username.is_empty() || password.is_empty() {
            return Err(SaslFailure::MalformedRequest);
        }
        // the authorization identity, when present, must be the
        // authentication identity itself
        if !authzid.is_empty() && !authzid.eq_ignore_ascii_case(username) {
            return Err(SaslFailure::NotAuthorized);
        }

        let user = context.store.fetch_user(username).await.map_err(|err| {
            error!("stored password lookup failed: {err}");
            SaslFailure::TemporaryAuthFailure
        })?;
        match user {
            Some(user) if user.password == password => Ok(SaslOutcome::Success {
                username: username.to_lowercase(),
                element: success_element(None),
            }),
            _ => Err(SaslFailure::NotAuthorized),
        }
    }

    pub fn reset(&mut self) {}
}

impl Default for PlainAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use warbler_backend::store::{FakeStoreBackend, StoreHandle, User};
    use warbler_core::xml::namespaces;

    use super::*;

    fn auth_element(payload: &str) -> Element {
        let mut auth = Element::new_ns("auth", namespaces::XMPP_SASL);
        auth.set_attribute("mechanism", "PLAIN");
        auth.set_text(&BASE64_STANDARD.encode(payload));
        auth
    }

    fn store_with_alice() -> StoreHandle {
        let mut backend = FakeStoreBackend::default();
        backend.users.insert(
            "alice".to_string(),
            User {
                username: "alice".to_string(),
                password: "secret".to_string(),
            },
        );
        StoreHandle::new(backend)
    }

    async fn process(payload: &str) -> Result<SaslOutcome, SaslFailure> {
        let store = store_with_alice();
        let context = AuthContext {
            store: &store,
            domain: "localhost".to_string(),
            channel_binding: None,
        };
        PlainAuthenticator::new()
            .process_element(&auth_element(payload), &context)
            .await
    }

    #[tokio::test]
    async fn accepts_a_valid_credential_payload() {
        let Ok(SaslOutcome::Success { username, element }) = process("\0alice\0secret").await
        else {
            panic!("expected success");
        };
        assert_eq!(username, "alice");
        assert_eq!(element.name(), "success");
    }

    #[tokio::test]
    async fn accepts_a_matching_authzid() {
        assert!(matches!(
            process("alice\0alice\0secret").await,
            Ok(SaslOutcome::Success { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_password_and_unknown_user() {
        assert!(matches!(
            process("\0alice\0wrong").await,
            Err(SaslFailure::NotAuthorized)
        ));
        assert!(matches!(
            process("\0mallory\0secret").await,
            Err(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn rejects_a_foreign_authzid() {
        assert!(matches!(
            process("bob\0alice\0secret").await,
            Err(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_payloads() {
        assert!(matches!(
            process("no separators").await,
            Err(SaslFailure::MalformedRequest)
        ));
    }
}
