use warbler_core::xmpp::stanza::Iq;

pub mod disco;
pub mod offline;
pub mod ping;
pub mod private;
pub mod register;
pub mod roster;
pub mod vcard;
pub mod version;

/// A pluggable handler for IQ stanzas addressed to the server or a bare
/// JID. The session holds an ordered list and dispatches first-match.
pub trait IqHandler: Send + Sync {
    /// Namespaces announced through service discovery.
    fn associated_namespaces(&self) -> Vec<&'static str>;

    fn matches_iq(&self, iq: &Iq) -> bool;

    /// Handles a matched IQ. Implementations either reply directly or
    /// enqueue onto their operation queue; they never block the session.
    fn process_iq(&self, iq: Iq);
}
