use crate::xml::{namespaces, Element};

/// Stream-level error conditions. Emitting one terminates the connection.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    #[error("connection-timeout")]
    ConnectionTimeout,
    #[error("host-unknown")]
    HostUnknown,
    #[error("invalid-from")]
    InvalidFrom,
    #[error("invalid-namespace")]
    InvalidNamespace,
    #[error("invalid-xml")]
    InvalidXml,
    #[error("not-authorized")]
    NotAuthorized,
    #[error("unsupported-stanza-type")]
    UnsupportedStanzaType,
    #[error("unsupported-version")]
    UnsupportedVersion,
}

impl StreamErrorKind {
    pub fn condition(&self) -> &'static str {
        match self {
            StreamErrorKind::ConnectionTimeout => "connection-timeout",
            StreamErrorKind::HostUnknown => "host-unknown",
            StreamErrorKind::InvalidFrom => "invalid-from",
            StreamErrorKind::InvalidNamespace => "invalid-namespace",
            StreamErrorKind::InvalidXml => "invalid-xml",
            StreamErrorKind::NotAuthorized => "not-authorized",
            StreamErrorKind::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorKind::UnsupportedVersion => "unsupported-version",
        }
    }

    pub fn element(&self) -> Element {
        let mut error = Element::new("stream:error");
        error.add_child(Element::new_ns(
            self.condition(),
            namespaces::XMPP_STREAM_ERRORS,
        ));
        error
    }
}
