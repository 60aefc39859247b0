use std::collections::HashMap;

use base64::prelude::*;
use rand::RngCore;
use tracing::error;

use warbler_core::xml::Element;

use super::{challenge_element, decode_payload, success_element, AuthContext, SaslFailure,
    SaslOutcome};

enum State {
    Initial,
    WaitingResponse { nonce: String },
    WaitingFinal { username: String },
}

/// RFC 2831 DIGEST-MD5, server side with `qop=auth` and `md5-sess`.
/// Verification needs the stored plaintext password.
pub struct DigestMd5Authenticator {
    state: State,
}

impl DigestMd5Authenticator {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
        }
    }

    pub async fn process_element(
        &mut self,
        element: &Element,
        context: &AuthContext<'_>,
    ) -> Result<SaslOutcome, SaslFailure> {
        match &self.state {
            State::Initial => {
                if element.name() != "auth" {
                    return Err(SaslFailure::MalformedRequest);
                }
                let nonce = generate_nonce();
                let challenge = format!(
                    "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    context.domain, nonce
                );
                self.state = State::WaitingResponse { nonce: nonce.clone() };
                Ok(SaslOutcome::Challenge(challenge_element(
                    challenge.as_bytes(),
                )))
            }
            State::WaitingResponse { nonce } => {
                if element.name() != "response" {
                    return Err(SaslFailure::MalformedRequest);
                }
                let nonce = nonce.clone();
                let payload = decode_payload(element)?;
                let payload =
                    String::from_utf8(payload).map_err(|_| SaslFailure::IncorrectEncoding)?;
                let pairs = parse_digest_pairs(&payload);

                let username = pairs
                    .get("username")
                    .ok_or(SaslFailure::MalformedRequest)?
                    .clone();
                let cnonce = pairs.get("cnonce").ok_or(SaslFailure::MalformedRequest)?;
                let nc = pairs.get("nc").ok_or(SaslFailure::MalformedRequest)?;
                let digest_uri = pairs
                    .get("digest-uri")
                    .ok_or(SaslFailure::MalformedRequest)?;
                let client_response =
                    pairs.get("response").ok_or(SaslFailure::MalformedRequest)?;
                if pairs.get("nonce") != Some(&nonce) || nc != "00000001" {
                    return Err(SaslFailure::MalformedRequest);
                }
                if pairs.get("qop").map(String::as_str).unwrap_or("auth") != "auth" {
                    return Err(SaslFailure::MalformedRequest);
                }
                let realm = pairs.get("realm").cloned().unwrap_or_default();

                let user = context.store.fetch_user(&username).await.map_err(|err| {
                    error!("stored password lookup failed: {err}");
                    SaslFailure::TemporaryAuthFailure
                })?;
                let Some(user) = user else {
                    return Err(SaslFailure::NotAuthorized);
                };

                let expected = compute_response(
                    &username,
                    &realm,
                    &user.password,
                    &nonce,
                    cnonce,
                    nc,
                    digest_uri,
                    "AUTHENTICATE",
                );
                if *client_response != expected {
                    return Err(SaslFailure::NotAuthorized);
                }

                let rspauth = compute_response(
                    &username, &realm, &user.password, &nonce, cnonce, nc, digest_uri, "",
                );
                self.state = State::WaitingFinal {
                    username: username.to_lowercase(),
                };
                Ok(SaslOutcome::Challenge(challenge_element(
                    format!("rspauth={rspauth}").as_bytes(),
                )))
            }
            State::WaitingFinal { username } => {
                if element.name() != "response" {
                    return Err(SaslFailure::MalformedRequest);
                }
                let username = username.clone();
                self.state = State::Initial;
                Ok(SaslOutcome::Success {
                    username,
                    element: success_element(None),
                })
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Initial;
    }
}

impl Default for DigestMd5Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_nonce() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64_STANDARD.encode(raw)
}

/// Splits `key=value` pairs, honoring quoted values with embedded commas.
fn parse_digest_pairs(payload: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut rest = payload;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    value = stripped[..end].to_string();
                    rest = stripped[end + 1..].trim_start_matches(',');
                }
                None => {
                    value = stripped.to_string();
                    rest = "";
                }
            }
        } else {
            match rest.find(',') {
                Some(end) => {
                    value = rest[..end].to_string();
                    rest = &rest[end + 1..];
                }
                None => {
                    value = rest.to_string();
                    rest = "";
                }
            }
        }
        pairs.insert(key, value);
    }
    pairs
}

fn hex(digest: md5::Digest) -> String {
    format!("{:x}", digest)
}

/// The `md5-sess` response hash. An empty `method` yields the `rspauth`
/// value the server proves itself with.
#[allow(clippy::too_many_arguments)]
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    method: &str,
) -> String {
    let urp = md5::compute(format!("{username}:{realm}:{password}"));
    let mut a1 = urp.to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    let ha1 = hex(md5::compute(&a1));
    let ha2 = hex(md5::compute(format!("{method}:{digest_uri}")));
    hex(md5::compute(format!(
        "{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"
    )))
}
