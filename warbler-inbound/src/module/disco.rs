use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::stanza::Iq;
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

#[derive(Debug, Clone)]
pub struct DiscoIdentity {
    pub category: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DiscoItem {
    pub jid: String,
    pub name: String,
    pub node: String,
}

/// XEP-0030 service discovery over the server entity. Identities and
/// features are fixed at session setup from the registered IQ handlers.
pub struct DiscoInfo {
    strm: StreamHandle,
    identities: Vec<DiscoIdentity>,
    features: Vec<String>,
    items: Vec<DiscoItem>,
}

impl DiscoInfo {
    pub fn new(
        strm: StreamHandle,
        identities: Vec<DiscoIdentity>,
        mut features: Vec<String>,
        items: Vec<DiscoItem>,
    ) -> Self {
        features.sort();
        Self {
            strm,
            identities,
            features,
            items,
        }
    }

    fn send_disco_info(&self, iq: &Iq) {
        let mut result = iq.result_iq();
        let mut query = Element::new_ns("query", namespaces::DISCO_INFO);

        for identity in &self.identities {
            let mut element = Element::new("identity");
            element.set_attribute("category", &identity.category);
            if !identity.kind.is_empty() {
                element.set_attribute("type", &identity.kind);
            }
            if !identity.name.is_empty() {
                element.set_attribute("name", &identity.name);
            }
            query.add_child(element);
        }
        for feature in &self.features {
            let mut element = Element::new("feature");
            element.set_attribute("var", feature);
            query.add_child(element);
        }

        result.add_child(query);
        self.strm.send(result);
    }

    fn send_disco_items(&self, iq: &Iq) {
        let mut result = iq.result_iq();
        let mut query = Element::new_ns("query", namespaces::DISCO_ITEMS);

        for item in &self.items {
            let mut element = Element::new("item");
            element.set_attribute("jid", &item.jid);
            if !item.name.is_empty() {
                element.set_attribute("name", &item.name);
            }
            if !item.node.is_empty() {
                element.set_attribute("node", &item.node);
            }
            query.add_child(element);
        }

        result.add_child(query);
        self.strm.send(result);
    }
}

impl IqHandler for DiscoInfo {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::DISCO_INFO, namespaces::DISCO_ITEMS]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        let Some(query) = iq.find_child("query") else {
            return false;
        };
        iq.is_get()
            && (query.namespace() == namespaces::DISCO_INFO
                || query.namespace() == namespaces::DISCO_ITEMS)
    }

    fn process_iq(&self, iq: Iq) {
        if !iq.to_jid().is_server() {
            self.strm
                .send(iq.error_iq(StanzaErrorKind::FeatureNotImplemented));
            return;
        }
        let Some(query) = iq.find_child("query") else {
            return;
        };
        match query.namespace() {
            namespaces::DISCO_INFO => self.send_disco_info(&iq),
            namespaces::DISCO_ITEMS => self.send_disco_items(&iq),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use warbler_core::xml::parser::parse_standalone;
    use warbler_core::xmpp::jid::Jid;

    use super::*;

    fn disco_iq(namespace: &str, to: &str) -> Iq {
        let xml = format!(r#"<iq id="d1" type="get" to="{to}"><query xmlns="{namespace}"/></iq>"#);
        Iq::from_element(
            parse_standalone(&xml).unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            to.parse::<Jid>().unwrap(),
        )
        .unwrap()
    }

    fn fixture() -> (DiscoInfo, warbler_services::registry::StreamMailbox) {
        let (strm, mailbox) = StreamHandle::channel("c1", "localhost");
        let disco = DiscoInfo::new(
            strm,
            vec![DiscoIdentity {
                category: "server".to_string(),
                kind: "im".to_string(),
                name: "default".to_string(),
            }],
            vec![
                namespaces::PING.to_string(),
                namespaces::DISCO_INFO.to_string(),
            ],
            Vec::new(),
        );
        (disco, mailbox)
    }

    #[tokio::test]
    async fn lists_identities_and_sorted_features() {
        let (disco, mut mailbox) = fixture();
        let iq = disco_iq(namespaces::DISCO_INFO, "localhost");
        assert!(disco.matches_iq(&iq));
        disco.process_iq(iq);

        let reply = mailbox.elements.try_recv().unwrap();
        let query = reply.find_child("query").unwrap();
        let identity = query.find_child("identity").unwrap();
        assert_eq!(identity.attribute("category"), Some("server"));
        assert_eq!(identity.attribute("type"), Some("im"));

        let features: Vec<_> = query
            .find_children("feature")
            .iter()
            .map(|feature| feature.attribute("var").unwrap().to_string())
            .collect();
        let mut sorted = features.clone();
        sorted.sort();
        assert_eq!(features, sorted);
        assert!(features.contains(&namespaces::PING.to_string()));
    }

    #[tokio::test]
    async fn refuses_non_server_targets() {
        let (disco, mut mailbox) = fixture();
        disco.process_iq(disco_iq(namespaces::DISCO_INFO, "bob@localhost"));

        let reply = mailbox.elements.try_recv().unwrap();
        assert!(reply
            .find_child("error")
            .unwrap()
            .find_child("feature-not-implemented")
            .is_some());
    }
}
