pub const XMPP_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const XMPP_CLIENT: &str = "jabber:client";
pub const XMPP_SERVER: &str = "jabber:server";
pub const XMPP_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const XMPP_STARTTLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const XMPP_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const XMPP_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const XMPP_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const XMPP_STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";

pub const ROSTER: &str = "jabber:iq:roster";
pub const REGISTER: &str = "jabber:iq:register";
pub const NON_SASL_AUTH: &str = "jabber:iq:auth";
pub const PRIVATE_STORAGE: &str = "jabber:iq:private";
pub const VERSION: &str = "jabber:iq:version";
pub const VCARD: &str = "vcard-temp";
pub const PING: &str = "urn:xmpp:ping";
pub const DELAY: &str = "urn:xmpp:delay";
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
