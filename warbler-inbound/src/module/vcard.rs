use tracing::error;

use warbler_backend::store::StoreHandle;
use warbler_core::concurrent::OperationQueue;
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::stanza::Iq;
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

const VCARD_QUEUE_SIZE: usize = 32;

/// XEP-0054 vcard-temp. Users publish their own vCard and may fetch any
/// local user's.
pub struct VCard {
    queue: OperationQueue,
    ctx: VCardCtx,
}

#[derive(Clone)]
struct VCardCtx {
    strm: StreamHandle,
    store: StoreHandle,
}

impl VCard {
    pub fn new(strm: StreamHandle, store: StoreHandle) -> Self {
        Self {
            queue: OperationQueue::new(VCARD_QUEUE_SIZE, None),
            ctx: VCardCtx { strm, store },
        }
    }
}

impl IqHandler for VCard {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::VCARD]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.find_child_ns("vCard", namespaces::VCARD).is_some()
    }

    fn process_iq(&self, iq: Iq) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.process_iq(&iq).await;
        });
    }
}

impl VCardCtx {
    async fn process_iq(&self, iq: &Iq) {
        if iq.is_get() {
            self.fetch(iq).await;
        } else if iq.is_set() {
            self.save(iq).await;
        } else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
        }
    }

    async fn fetch(&self, iq: &Iq) {
        let to = iq.to_jid();
        let username = if to.is_server() {
            self.strm.username()
        } else {
            to.node().to_string()
        };

        let stored = match self.store.fetch_vcard(&username).await {
            Ok(stored) => stored,
            Err(err) => {
                error!("vcard fetch failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                return;
            }
        };

        let mut result = iq.result_iq();
        result.add_child(stored.unwrap_or_else(|| Element::new_ns("vCard", namespaces::VCARD)));
        self.strm.send(result);
    }

    async fn save(&self, iq: &Iq) {
        let to = iq.to_jid();
        let own = to.is_server() || to.node() == self.strm.username();
        if !own {
            self.strm.send(iq.error_iq(StanzaErrorKind::Forbidden));
            return;
        }
        let Some(vcard) = iq.find_child_ns("vCard", namespaces::VCARD) else {
            return;
        };
        if let Err(err) = self
            .store
            .set_vcard(&self.strm.username(), vcard.clone())
            .await
        {
            error!("vcard update failed: {err}");
            self.strm
                .send(iq.error_iq(StanzaErrorKind::InternalServerError));
            return;
        }
        self.strm.send(iq.result_iq());
    }
}

#[cfg(test)]
mod tests {
    use warbler_backend::store::FakeStoreBackend;
    use warbler_core::xml::parser::parse_standalone;
    use warbler_core::xmpp::jid::Jid;
    use warbler_services::registry::StreamMailbox;

    use super::*;

    fn fixture() -> (VCardCtx, StreamMailbox) {
        let (strm, mailbox) = StreamHandle::channel("c1", "localhost");
        strm.set_authenticated("alice");
        let store = StoreHandle::new(FakeStoreBackend::default());
        (VCardCtx { strm, store }, mailbox)
    }

    fn vcard_iq(id: &str, iq_type: &str, to: &str, payload: &str) -> Iq {
        let xml = format!(
            r#"<iq id="{id}" type="{iq_type}"><vCard xmlns="vcard-temp">{payload}</vCard></iq>"#
        );
        Iq::from_element(
            parse_standalone(&xml).unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            to.parse::<Jid>().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publishes_and_fetches_the_own_vcard() {
        let (ctx, mut mailbox) = fixture();

        ctx.process_iq(&vcard_iq("v1", "set", "localhost", "<FN>Alice</FN>"))
            .await;
        assert_eq!(
            mailbox.elements.try_recv().unwrap().stanza_type(),
            Some("result")
        );

        ctx.process_iq(&vcard_iq("v2", "get", "localhost", "")).await;
        let reply = mailbox.elements.try_recv().unwrap();
        let vcard = reply.find_child("vCard").unwrap();
        assert_eq!(vcard.find_child("FN").unwrap().text(), "Alice");
    }

    #[tokio::test]
    async fn returns_an_empty_vcard_when_none_is_stored() {
        let (ctx, mut mailbox) = fixture();
        ctx.process_iq(&vcard_iq("v1", "get", "bob@localhost", "")).await;
        let reply = mailbox.elements.try_recv().unwrap();
        let vcard = reply.find_child("vCard").unwrap();
        assert_eq!(vcard.children_count(), 0);
    }

    #[tokio::test]
    async fn refuses_to_overwrite_a_foreign_vcard() {
        let (ctx, mut mailbox) = fixture();
        ctx.process_iq(&vcard_iq("v1", "set", "bob@localhost", "<FN>Mallory</FN>"))
            .await;
        let reply = mailbox.elements.try_recv().unwrap();
        assert!(reply
            .find_child("error")
            .unwrap()
            .find_child("forbidden")
            .is_some());
    }
}
