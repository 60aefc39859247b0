use crate::xml::{namespaces, Element};

/// RFC 6120 defined stanza error conditions returned in mirrored stanzas.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorKind {
    #[error("bad-request")]
    BadRequest,
    #[error("conflict")]
    Conflict,
    #[error("feature-not-implemented")]
    FeatureNotImplemented,
    #[error("forbidden")]
    Forbidden,
    #[error("internal-server-error")]
    InternalServerError,
    #[error("not-acceptable")]
    NotAcceptable,
    #[error("not-allowed")]
    NotAllowed,
    #[error("not-authorized")]
    NotAuthorized,
    #[error("service-unavailable")]
    ServiceUnavailable,
}

impl StanzaErrorKind {
    pub fn condition(&self) -> &'static str {
        match self {
            StanzaErrorKind::BadRequest => "bad-request",
            StanzaErrorKind::Conflict => "conflict",
            StanzaErrorKind::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorKind::Forbidden => "forbidden",
            StanzaErrorKind::InternalServerError => "internal-server-error",
            StanzaErrorKind::NotAcceptable => "not-acceptable",
            StanzaErrorKind::NotAllowed => "not-allowed",
            StanzaErrorKind::NotAuthorized => "not-authorized",
            StanzaErrorKind::ServiceUnavailable => "service-unavailable",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            StanzaErrorKind::BadRequest => "modify",
            StanzaErrorKind::Conflict => "cancel",
            StanzaErrorKind::FeatureNotImplemented => "cancel",
            StanzaErrorKind::Forbidden => "auth",
            StanzaErrorKind::InternalServerError => "wait",
            StanzaErrorKind::NotAcceptable => "modify",
            StanzaErrorKind::NotAllowed => "cancel",
            StanzaErrorKind::NotAuthorized => "auth",
            StanzaErrorKind::ServiceUnavailable => "cancel",
        }
    }
}

/// Builds the error reply for a received stanza: same element, addresses
/// swapped, `type="error"`, condition payload appended.
pub fn error_reply(stanza: &Element, kind: StanzaErrorKind) -> Element {
    let mut reply = stanza.clone();
    let to = stanza.to().map(str::to_string);
    let from = stanza.from().map(str::to_string);
    reply.remove_attribute("to");
    reply.remove_attribute("from");
    if let Some(from) = from {
        reply.set_attribute("to", &from);
    }
    if let Some(to) = to {
        reply.set_attribute("from", &to);
    }
    reply.set_attribute("type", "error");

    reply.with_child("error", None, |error| {
        error.set_attribute("type", kind.error_type());
        error.add_child(Element::new_ns(
            kind.condition(),
            namespaces::XMPP_STANZA_ERRORS,
        ));
    });
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_the_stanza_and_swaps_addresses() {
        let mut iq = Element::new("iq");
        iq.set_attribute("id", "1");
        iq.set_attribute("type", "get");
        iq.set_attribute("from", "alice@localhost/phone");
        iq.set_attribute("to", "bob@localhost");

        let reply = error_reply(&iq, StanzaErrorKind::ServiceUnavailable);
        assert_eq!(reply.stanza_type(), Some("error"));
        assert_eq!(reply.id(), Some("1"));
        assert_eq!(reply.to(), Some("alice@localhost/phone"));
        assert_eq!(reply.from(), Some("bob@localhost"));

        let error = reply.find_child("error").unwrap();
        assert_eq!(error.attribute("type"), Some("cancel"));
        assert!(error
            .find_child_ns("service-unavailable", namespaces::XMPP_STANZA_ERRORS)
            .is_some());
    }

    #[test]
    fn keeps_missing_addresses_absent() {
        let reply = error_reply(&Element::new("iq"), StanzaErrorKind::BadRequest);
        assert_eq!(reply.to(), None);
        assert_eq!(reply.from(), None);
        assert_eq!(
            reply.find_child("error").unwrap().attribute("type"),
            Some("modify")
        );
    }
}
