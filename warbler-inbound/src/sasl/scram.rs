use base64::prelude::*;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::error;

use warbler_core::xml::Element;

use super::{challenge_element, decode_payload, success_element, AuthContext, SaslFailure,
    SaslOutcome};

const SCRAM_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramDigest {
    Sha1,
    Sha256,
}

impl ScramDigest {
    pub fn mechanism_name(&self, channel_binding: bool) -> &'static str {
        match (self, channel_binding) {
            (ScramDigest::Sha1, false) => "SCRAM-SHA-1",
            (ScramDigest::Sha1, true) => "SCRAM-SHA-1-PLUS",
            (ScramDigest::Sha256, false) => "SCRAM-SHA-256",
            (ScramDigest::Sha256, true) => "SCRAM-SHA-256-PLUS",
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramDigest::Sha1 => Sha1::digest(data).to_vec(),
            ScramDigest::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            ScramDigest::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramDigest::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn salted_password(&self, password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramDigest::Sha1 => {
                let mut salted = [0u8; 20];
                pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, iterations, &mut salted);
                salted.to_vec()
            }
            ScramDigest::Sha256 => {
                let mut salted = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);
                salted.to_vec()
            }
        }
    }
}

struct Pending {
    username: String,
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
}

enum State {
    Initial,
    WaitingFinal(Box<Pending>),
}

/// RFC 5802 SCRAM server side. Keys are derived per exchange from the
/// stored password with a fresh salt; the `-PLUS` variants additionally
/// verify the gs2 channel-binding data against the transport's.
pub struct ScramAuthenticator {
    digest: ScramDigest,
    channel_binding: bool,
    state: State,
}

impl ScramAuthenticator {
    pub fn new(digest: ScramDigest, channel_binding: bool) -> Self {
        Self {
            digest,
            channel_binding,
            state: State::Initial,
        }
    }

    pub fn mechanism(&self) -> &'static str {
        self.digest.mechanism_name(self.channel_binding)
    }

    pub fn uses_channel_binding(&self) -> bool {
        self.channel_binding
    }

    pub async fn process_element(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
    ) -> Result<SaslOutcome, SaslFailure> {
        match std::mem::replace(&mut self.state, State::Initial) {
            State::Initial => {
                if element.name() != "auth" {
                    return Err(SaslFailure::MalformedRequest);
                }
                self.process_client_first(element, context).await
            }
            State::WaitingFinal(pending) => {
                if element.name() != "response" {
                    return Err(SaslFailure::MalformedRequest);
                }
                self.process_client_final(element, context, *pending)
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Initial;
    }

    async fn process_client_first(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
    ) -> Result<SaslOutcome, SaslFailure> {
        let payload = decode_payload(element)?;
        let payload = String::from_utf8(payload).map_err(|_| SaslFailure::IncorrectEncoding)?;

        let (gs2_flag, rest) = payload.split_once(',').ok_or(SaslFailure::MalformedRequest)?;
        let (authzid, client_first_bare) =
            rest.split_once(',').ok_or(SaslFailure::MalformedRequest)?;
        match (self.channel_binding, gs2_flag) {
            (true, "p=tls-unique") => {}
            (false, "n") | (false, "y") => {}
            _ => return Err(SaslFailure::MalformedRequest),
        }
        let gs2_header = format!("{gs2_flag},{authzid},");

        if client_first_bare.starts_with("m=") {
            return Err(SaslFailure::MalformedRequest);
        }
        let mut username = None;
        let mut client_nonce = None;
        for attribute in client_first_bare.split(',') {
            if let Some(value) = attribute.strip_prefix("n=") {
                username = Some(unescape_username(value)?);
            } else if let Some(value) = attribute.strip_prefix("r=") {
                client_nonce = Some(value.to_string());
            }
        }
        let username = username.ok_or(SaslFailure::MalformedRequest)?;
        let client_nonce = client_nonce.ok_or(SaslFailure::MalformedRequest)?;
        if username.is_empty() || client_nonce.is_empty() {
            return Err(SaslFailure::MalformedRequest);
        }

        let user = context.store.fetch_user(&username).await.map_err(|err| {
            error!("stored password lookup failed: {err}");
            SaslFailure::TemporaryAuthFailure
        })?;
        let Some(user) = user else {
            return Err(SaslFailure::NotAuthorized);
        };

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salted_password =
            self.digest
                .salted_password(&user.password, &salt, SCRAM_ITERATIONS);
        let client_key = self.digest.hmac(&salted_password, b"Client Key");
        let stored_key = self.digest.hash(&client_key);
        let server_key = self.digest.hmac(&salted_password, b"Server Key");

        let mut server_nonce = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut server_nonce);
        let combined_nonce = format!("{client_nonce}{}", BASE64_STANDARD.encode(server_nonce));

        let server_first = format!(
            "r={combined_nonce},s={},i={SCRAM_ITERATIONS}",
            BASE64_STANDARD.encode(salt)
        );

        self.state = State::WaitingFinal(Box::new(Pending {
            username: username.to_lowercase(),
            gs2_header,
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            combined_nonce,
            stored_key,
            server_key,
        }));
        Ok(SaslOutcome::Challenge(challenge_element(
            server_first.as_bytes(),
        )))
    }

    fn process_client_final(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
        pending: Pending,
    ) -> Result<SaslOutcome, SaslFailure> {
        let payload = decode_payload(element)?;
        let payload = String::from_utf8(payload).map_err(|_| SaslFailure::IncorrectEncoding)?;

        let (without_proof, proof) = payload
            .rsplit_once(",p=")
            .ok_or(SaslFailure::MalformedRequest)?;
        let proof = BASE64_STANDARD
            .decode(proof)
            .map_err(|_| SaslFailure::IncorrectEncoding)?;

        let mut channel_binding = None;
        let mut nonce = None;
        for attribute in without_proof.split(',') {
            if let Some(value) = attribute.strip_prefix("c=") {
                channel_binding = Some(value.to_string());
            } else if let Some(value) = attribute.strip_prefix("r=") {
                nonce = Some(value.to_string());
            }
        }
        if nonce.as_deref() != Some(pending.combined_nonce.as_str()) {
            return Err(SaslFailure::NotAuthorized);
        }

        let mut expected_binding = pending.gs2_header.clone().into_bytes();
        if self.channel_binding {
            let Some(ref transport_binding) = context.channel_binding else {
                return Err(SaslFailure::NotAuthorized);
            };
            expected_binding.extend_from_slice(transport_binding);
        }
        if channel_binding.as_deref() != Some(BASE64_STANDARD.encode(&expected_binding).as_str()) {
            return Err(SaslFailure::NotAuthorized);
        }

        let auth_message = format!(
            "{},{},{}",
            pending.client_first_bare, pending.server_first, without_proof
        );
        let client_signature = self
            .digest
            .hmac(&pending.stored_key, auth_message.as_bytes());
        if proof.len() != client_signature.len() {
            return Err(SaslFailure::NotAuthorized);
        }
        let recovered_client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(proof_byte, signature_byte)| proof_byte ^ signature_byte)
            .collect();
        if self.digest.hash(&recovered_client_key) != pending.stored_key {
            return Err(SaslFailure::NotAuthorized);
        }

        let server_signature = self
            .digest
            .hmac(&pending.server_key, auth_message.as_bytes());
        let additional_data = format!("v={}", BASE64_STANDARD.encode(server_signature));
        Ok(SaslOutcome::Success {
            username: pending.username,
            element: success_element(Some(additional_data.as_bytes())),
        })
    }
}

fn unescape_username(escaped: &str) -> Result<String, SaslFailure> {
    if escaped.contains(',') {
        return Err(SaslFailure::MalformedRequest);
    }
    Ok(escaped.replace("=2C", ",").replace("=3D", "="))
}

#[cfg(test)]
mod tests {
    use warbler_backend::store::{FakeStoreBackend, StoreHandle, User};
    use warbler_core::xml::namespaces;

    use super::*;

    fn store_with(username: &str, password: &str) -> StoreHandle {
        let mut backend = FakeStoreBackend::default();
        backend.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        StoreHandle::new(backend)
    }

    fn sasl_element(name: &str, payload: &str) -> Element {
        let mut element = Element::new_ns(name, namespaces::XMPP_SASL);
        element.set_text(&BASE64_STANDARD.encode(payload));
        element
    }

    fn parse_server_first(message: &str) -> (String, Vec<u8>, u32) {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64_STANDARD.decode(value).unwrap());
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse().unwrap());
            }
        }
        (nonce.unwrap(), salt.unwrap(), iterations.unwrap())
    }

    /// Drives the client side of the exchange the way an XMPP client would.
    async fn run_exchange(
        digest: ScramDigest,
        plus: bool,
        password: &str,
        transport_binding: Option<Vec<u8>>,
        client_binding: Option<Vec<u8>>,
    ) -> Result<SaslOutcome, SaslFailure> {
        let store = store_with("user", "pencil");
        let context = AuthContext {
            store: &store,
            domain: "localhost".to_string(),
            channel_binding: transport_binding,
        };
        let mut authenticator = ScramAuthenticator::new(digest, plus);

        let gs2_header = if plus { "p=tls-unique,," } else { "n,," };
        let client_nonce = "fyko+d2lbbFgONRv9qkxdawL";
        let client_first_bare = format!("n=user,r={client_nonce}");

        let challenge = authenticator
            .process_element(
                &sasl_element("auth", &format!("{gs2_header}{client_first_bare}")),
                &context,
            )
            .await?;
        let SaslOutcome::Challenge(challenge) = challenge else {
            panic!("expected server-first challenge");
        };
        let server_first =
            String::from_utf8(BASE64_STANDARD.decode(challenge.text()).unwrap()).unwrap();
        let (combined_nonce, salt, iterations) = parse_server_first(&server_first);
        assert!(combined_nonce.starts_with(client_nonce));

        let mut binding_input = gs2_header.as_bytes().to_vec();
        if let Some(ref binding) = client_binding {
            binding_input.extend_from_slice(binding);
        }
        let client_final_without_proof = format!(
            "c={},r={combined_nonce}",
            BASE64_STANDARD.encode(&binding_input)
        );
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let salted = digest.salted_password(password, &salt, iterations);
        let client_key = digest.hmac(&salted, b"Client Key");
        let stored_key = digest.hash(&client_key);
        let client_signature = digest.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key_byte, signature_byte)| key_byte ^ signature_byte)
            .collect();

        let client_final = format!(
            "{client_final_without_proof},p={}",
            BASE64_STANDARD.encode(&proof)
        );
        authenticator
            .process_element(&sasl_element("response", &client_final), &context)
            .await
    }

    #[tokio::test]
    async fn completes_sha1_and_sha256_exchanges() {
        for digest in [ScramDigest::Sha1, ScramDigest::Sha256] {
            let outcome = run_exchange(digest, false, "pencil", None, None)
                .await
                .unwrap();
            let SaslOutcome::Success { username, element } = outcome else {
                panic!("expected success");
            };
            assert_eq!(username, "user");
            // the success payload carries the server signature
            let payload =
                String::from_utf8(BASE64_STANDARD.decode(element.text()).unwrap()).unwrap();
            assert!(payload.starts_with("v="));
        }
    }

    #[tokio::test]
    async fn rejects_a_wrong_password() {
        assert!(matches!(
            run_exchange(ScramDigest::Sha1, false, "wrong", None, None).await,
            Err(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn plus_variant_verifies_channel_binding() {
        let binding = vec![0xAB; 32];
        let outcome = run_exchange(
            ScramDigest::Sha256,
            true,
            "pencil",
            Some(binding.clone()),
            Some(binding),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, SaslOutcome::Success { .. }));

        // binding data mismatch between transport and client
        assert!(matches!(
            run_exchange(
                ScramDigest::Sha256,
                true,
                "pencil",
                Some(vec![0xAB; 32]),
                Some(vec![0xCD; 32]),
            )
            .await,
            Err(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn rejects_a_plus_header_on_a_non_plus_mechanism() {
        let store = store_with("user", "pencil");
        let context = AuthContext {
            store: &store,
            domain: "localhost".to_string(),
            channel_binding: None,
        };
        let mut authenticator = ScramAuthenticator::new(ScramDigest::Sha1, false);
        let result = authenticator
            .process_element(
                &sasl_element("auth", "p=tls-unique,,n=user,r=abc"),
                &context,
            )
            .await;
        assert!(matches!(result, Err(SaslFailure::MalformedRequest)));
    }
}
