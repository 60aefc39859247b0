use tracing::error;

use warbler_backend::store::StoreHandle;
use warbler_core::concurrent::OperationQueue;
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::stanza::Iq;
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

const PRIVATE_QUEUE_SIZE: usize = 32;

/// XEP-0049 private XML storage: per-user fragments keyed by the payload
/// element's namespace. Only the owning user may read or write.
pub struct PrivateStorage {
    queue: OperationQueue,
    ctx: PrivateCtx,
}

#[derive(Clone)]
struct PrivateCtx {
    strm: StreamHandle,
    store: StoreHandle,
}

impl PrivateStorage {
    pub fn new(strm: StreamHandle, store: StoreHandle) -> Self {
        Self {
            queue: OperationQueue::new(PRIVATE_QUEUE_SIZE, None),
            ctx: PrivateCtx { strm, store },
        }
    }
}

impl IqHandler for PrivateStorage {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::PRIVATE_STORAGE]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.find_child_ns("query", namespaces::PRIVATE_STORAGE)
            .is_some()
    }

    fn process_iq(&self, iq: Iq) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.process_iq(&iq).await;
        });
    }
}

impl PrivateCtx {
    async fn process_iq(&self, iq: &Iq) {
        let to = iq.to_jid();
        let own = to.is_server() || (to.node() == self.strm.username());
        if !own {
            self.strm.send(iq.error_iq(StanzaErrorKind::Forbidden));
            return;
        }
        let Some(query) = iq.find_child_ns("query", namespaces::PRIVATE_STORAGE) else {
            return;
        };
        if query.children_count() != 1 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        let payload = &query.children()[0];
        let namespace = payload.namespace().to_string();
        if namespace.is_empty() || namespace.starts_with("jabber:") || namespace == namespaces::VCARD
        {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAcceptable));
            return;
        }

        if iq.is_get() {
            self.fetch(iq, payload, &namespace).await;
        } else if iq.is_set() {
            self.save(iq, query, &namespace).await;
        } else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
        }
    }

    async fn fetch(&self, iq: &Iq, payload: &Element, namespace: &str) {
        let stored = match self
            .store
            .fetch_private_elements(&self.strm.username(), namespace)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!("private storage fetch failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                return;
            }
        };

        let mut result = iq.result_iq();
        let mut query = Element::new_ns("query", namespaces::PRIVATE_STORAGE);
        match stored {
            Some(elements) => query.add_children(elements),
            None => query.add_child(payload.clone()),
        }
        result.add_child(query);
        self.strm.send(result);
    }

    async fn save(&self, iq: &Iq, query: &Element, namespace: &str) {
        if let Err(err) = self
            .store
            .set_private_elements(
                &self.strm.username(),
                namespace,
                query.children().to_vec(),
            )
            .await
        {
            error!("private storage update failed: {err}");
            self.strm
                .send(iq.error_iq(StanzaErrorKind::InternalServerError));
            return;
        }
        self.strm.send(iq.result_iq());
    }
}
