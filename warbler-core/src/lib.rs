pub mod concurrent;
pub mod xml;
pub mod xmpp;
