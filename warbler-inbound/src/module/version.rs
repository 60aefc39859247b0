use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::stanza::Iq;
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

const SERVER_NAME: &str = "warbler";

/// XEP-0092 software version, answered for server-targeted gets.
pub struct Version {
    strm: StreamHandle,
}

impl Version {
    pub fn new(strm: StreamHandle) -> Self {
        Self { strm }
    }
}

impl IqHandler for Version {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::VERSION]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.find_child_ns("query", namespaces::VERSION).is_some()
    }

    fn process_iq(&self, iq: Iq) {
        if !iq.to_jid().is_server() || !iq.is_get() {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAllowed));
            return;
        }

        let mut result = iq.result_iq();
        let mut query = Element::new_ns("query", namespaces::VERSION);
        query.with_child("name", None, |name| name.set_text(SERVER_NAME));
        query.with_child("version", None, |version| {
            version.set_text(env!("CARGO_PKG_VERSION"));
        });
        query.with_child("os", None, |os| os.set_text(std::env::consts::OS));
        result.add_child(query);
        self.strm.send(result);
    }
}

#[cfg(test)]
mod tests {
    use warbler_core::xml::parser::parse_standalone;
    use warbler_core::xmpp::jid::Jid;

    use super::*;

    #[tokio::test]
    async fn reports_name_version_and_os() {
        let (strm, mut mailbox) = StreamHandle::channel("c1", "localhost");
        let version = Version::new(strm);

        let iq = Iq::from_element(
            parse_standalone(
                r#"<iq id="v1" type="get" to="localhost"><query xmlns="jabber:iq:version"/></iq>"#,
            )
            .unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "localhost".parse::<Jid>().unwrap(),
        )
        .unwrap();
        assert!(version.matches_iq(&iq));
        version.process_iq(iq);

        let reply = mailbox.elements.try_recv().unwrap();
        let query = reply.find_child("query").unwrap();
        assert_eq!(query.find_child("name").unwrap().text(), "warbler");
        assert!(!query.find_child("version").unwrap().text().is_empty());
        assert!(!query.find_child("os").unwrap().text().is_empty());
    }
}
