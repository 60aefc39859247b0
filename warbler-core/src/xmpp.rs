pub mod jid;
pub mod stanza;
pub mod stanza_error;
pub mod stream_error;
