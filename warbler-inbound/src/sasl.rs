use warbler_backend::store::StoreHandle;
use warbler_core::xml::{namespaces, Element};

pub use self::digest_md5::DigestMd5Authenticator;
pub use self::plain::PlainAuthenticator;
pub use self::scram::{ScramAuthenticator, ScramDigest};

mod digest_md5;
mod plain;
pub mod scram;

/// SASL failure conditions reported in a `<failure/>` element. The stream
/// returns to the connected state afterwards so the client may retry.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    #[error("aborted")]
    Aborted,
    #[error("incorrect-encoding")]
    IncorrectEncoding,
    #[error("invalid-mechanism")]
    InvalidMechanism,
    #[error("malformed-request")]
    MalformedRequest,
    #[error("not-authorized")]
    NotAuthorized,
    #[error("temporary-auth-failure")]
    TemporaryAuthFailure,
}

impl SaslFailure {
    pub fn condition(&self) -> &'static str {
        match self {
            SaslFailure::Aborted => "aborted",
            SaslFailure::IncorrectEncoding => "incorrect-encoding",
            SaslFailure::InvalidMechanism => "invalid-mechanism",
            SaslFailure::MalformedRequest => "malformed-request",
            SaslFailure::NotAuthorized => "not-authorized",
            SaslFailure::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn element(&self) -> Element {
        let mut failure = Element::new_ns("failure", namespaces::XMPP_SASL);
        failure.add_child(Element::new(self.condition()));
        failure
    }
}

/// What an authenticator produced for the current round.
pub enum SaslOutcome {
    /// Write this element and wait for the client's `<response/>`.
    Challenge(Element),
    /// Authentication finished; write the element and restart the stream.
    Success { username: String, element: Element },
}

/// Per-round inputs an authenticator may consult.
pub struct AuthContext<'a> {
    pub store: &'a StoreHandle,
    pub domain: String,
    pub channel_binding: Option<Vec<u8>>,
}

/// The configured authenticators, dispatched by mechanism name.
pub enum Authenticator {
    Plain(PlainAuthenticator),
    DigestMd5(DigestMd5Authenticator),
    Scram(ScramAuthenticator),
}

impl Authenticator {
    /// Builds the authenticator list from the per-server `sasl` config
    /// entries. Each SCRAM entry contributes the base and `-PLUS` variants.
    pub fn from_config(names: &[String]) -> Vec<Authenticator> {
        let mut authenticators = Vec::new();
        for name in names {
            match name.as_str() {
                "plain" => authenticators.push(Authenticator::Plain(PlainAuthenticator::new())),
                "digest_md5" => {
                    authenticators.push(Authenticator::DigestMd5(DigestMd5Authenticator::new()))
                }
                "scram_sha_1" => {
                    authenticators.push(Authenticator::Scram(ScramAuthenticator::new(
                        ScramDigest::Sha1,
                        false,
                    )));
                    authenticators.push(Authenticator::Scram(ScramAuthenticator::new(
                        ScramDigest::Sha1,
                        true,
                    )));
                }
                "scram_sha_256" => {
                    authenticators.push(Authenticator::Scram(ScramAuthenticator::new(
                        ScramDigest::Sha256,
                        false,
                    )));
                    authenticators.push(Authenticator::Scram(ScramAuthenticator::new(
                        ScramDigest::Sha256,
                        true,
                    )));
                }
                other => tracing::warn!(mechanism = other, "ignoring unknown sasl mechanism"),
            }
        }
        authenticators
    }

    pub fn mechanism(&self) -> &'static str {
        match self {
            Authenticator::Plain(_) => "PLAIN",
            Authenticator::DigestMd5(_) => "DIGEST-MD5",
            Authenticator::Scram(scram) => scram.mechanism(),
        }
    }

    pub fn uses_channel_binding(&self) -> bool {
        match self {
            Authenticator::Plain(_) | Authenticator::DigestMd5(_) => false,
            Authenticator::Scram(scram) => scram.uses_channel_binding(),
        }
    }

    pub async fn process_element(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
    ) -> Result<SaslOutcome, SaslFailure> {
        if element.validate("abort", namespaces::XMPP_SASL) {
            return Err(SaslFailure::Aborted);
        }
        match self {
            Authenticator::Plain(plain) => plain.process_element(element, context).await,
            Authenticator::DigestMd5(digest) => digest.process_element(element, context).await,
            Authenticator::Scram(scram) => scram.process_element(element, context).await,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Authenticator::Plain(plain) => plain.reset(),
            Authenticator::DigestMd5(digest) => digest.reset(),
            Authenticator::Scram(scram) => scram.reset(),
        }
    }
}

pub(crate) fn decode_payload(element: &Element) -> Result<Vec<u8>, SaslFailure> {
    use base64::prelude::*;

    let text = element.text();
    if text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|_| SaslFailure::IncorrectEncoding)
}

pub(crate) fn success_element(additional_data: Option<&[u8]>) -> Element {
    use base64::prelude::*;

    let mut success = Element::new_ns("success", namespaces::XMPP_SASL);
    if let Some(data) = additional_data {
        success.set_text(&BASE64_STANDARD.encode(data));
    }
    success
}

pub(crate) fn challenge_element(payload: &[u8]) -> Element {
    use base64::prelude::*;

    let mut challenge = Element::new_ns("challenge", namespaces::XMPP_SASL);
    challenge.set_text(&BASE64_STANDARD.encode(payload));
    challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_entries_expand_to_mechanisms() {
        let authenticators = Authenticator::from_config(&[
            "plain".to_string(),
            "digest_md5".to_string(),
            "scram_sha_1".to_string(),
            "scram_sha_256".to_string(),
        ]);
        let mechanisms: Vec<_> = authenticators.iter().map(|a| a.mechanism()).collect();
        assert_eq!(
            mechanisms,
            [
                "PLAIN",
                "DIGEST-MD5",
                "SCRAM-SHA-1",
                "SCRAM-SHA-1-PLUS",
                "SCRAM-SHA-256",
                "SCRAM-SHA-256-PLUS",
            ]
        );
    }

    #[test]
    fn failure_renders_the_condition() {
        let failure = SaslFailure::InvalidMechanism.element();
        assert_eq!(
            failure.to_xml(),
            r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><invalid-mechanism/></failure>"#
        );
    }
}
