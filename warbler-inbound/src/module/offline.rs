use std::time::Duration;

use tracing::{error, info};

use warbler_backend::settings::OfflineSettings;
use warbler_backend::store::StoreHandle;
use warbler_core::concurrent::OperationQueue;
use warbler_core::xmpp::stanza::{Message, MessageType};
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

const OFFLINE_QUEUE_SIZE: usize = 32;
const OFFLINE_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// XEP-0160 flavored offline storage: messages for absent users are
/// archived with a delay stamp and replayed on the next login.
pub struct Offline {
    queue: OperationQueue,
    ctx: OfflineCtx,
}

#[derive(Clone)]
struct OfflineCtx {
    cfg: OfflineSettings,
    strm: StreamHandle,
    store: StoreHandle,
}

impl Offline {
    pub fn new(cfg: OfflineSettings, strm: StreamHandle, store: StoreHandle) -> Self {
        Self {
            queue: OperationQueue::new(OFFLINE_QUEUE_SIZE, Some(OFFLINE_OP_TIMEOUT)),
            ctx: OfflineCtx { cfg, strm, store },
        }
    }

    pub fn associated_namespaces(&self) -> Vec<&'static str> {
        vec!["msgoffline"]
    }

    /// Archives a chat or normal message for an absent recipient. Other
    /// message types are silently discarded.
    pub fn archive_message(&self, message: Message) {
        match message.message_type() {
            MessageType::Chat | MessageType::Normal => {}
            _ => return,
        }
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.archive_message(&message).await;
        });
    }

    /// Replays and clears the user's mailbox; the session calls this at
    /// most once, on the first available presence with priority >= 0.
    pub fn deliver_offline_messages(&self) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.deliver_offline_messages().await;
        });
    }
}

impl OfflineCtx {
    async fn archive_message(&self, message: &Message) {
        let recipient = message.to_jid();

        let queued = match self.store.count_offline_messages(recipient.node()).await {
            Ok(queued) => queued,
            Err(err) => {
                error!("offline queue count failed: {err}");
                return;
            }
        };
        let exists = match self.store.user_exists(recipient.node()).await {
            Ok(exists) => exists,
            Err(err) => {
                error!("user lookup failed: {err}");
                return;
            }
        };

        if !exists || queued >= self.cfg.queue_size {
            // bounce on behalf of the recipient
            self.strm
                .send(message.error_message(StanzaErrorKind::ServiceUnavailable));
            return;
        }

        let delayed = message.delayed(&self.strm.domain(), "Offline Storage");
        if let Err(err) = self
            .store
            .insert_offline_message(recipient.node(), delayed)
            .await
        {
            error!("offline archive failed: {err}");
            return;
        }
        info!(id = message.id(), "archived offline message");
    }

    async fn deliver_offline_messages(&self) {
        let username = self.strm.username();
        let messages = match self.store.fetch_offline_messages(&username).await {
            Ok(messages) => messages,
            Err(err) => {
                error!("offline fetch failed: {err}");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }
        info!(count = messages.len(), username = %username, "delivering offline messages");

        for message in messages {
            self.strm.send(message);
        }
        if let Err(err) = self.store.delete_offline_messages(&username).await {
            error!("offline queue deletion failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use warbler_backend::store::{FakeStoreBackend, User};
    use warbler_core::xml::parser::parse_standalone;
    use warbler_core::xmpp::jid::Jid;
    use warbler_services::registry::StreamMailbox;

    use super::*;

    fn sender_stream() -> (StreamHandle, StreamMailbox) {
        let (handle, mailbox) = StreamHandle::channel("c1", "localhost");
        handle.set_authenticated("alice");
        handle.bind_resource("phone");
        (handle, mailbox)
    }

    fn store_with_carol() -> StoreHandle {
        let mut backend = FakeStoreBackend::default();
        backend.users.insert(
            "carol".to_string(),
            User {
                username: "carol".to_string(),
                password: "secret".to_string(),
            },
        );
        StoreHandle::new(backend)
    }

    fn chat_message(body: &str) -> Message {
        let element =
            parse_standalone(&format!(r#"<message type="chat"><body>{body}</body></message>"#))
                .unwrap();
        Message::from_element(
            element,
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "carol@localhost".parse::<Jid>().unwrap(),
        )
        .unwrap()
    }

    fn ctx(queue_size: usize) -> (OfflineCtx, StreamMailbox, StoreHandle) {
        let (strm, mailbox) = sender_stream();
        let store = store_with_carol();
        (
            OfflineCtx {
                cfg: OfflineSettings { queue_size },
                strm,
                store: store.clone(),
            },
            mailbox,
            store,
        )
    }

    #[tokio::test]
    async fn archives_with_a_delay_stamp_until_capacity() {
        let (ctx, mut mailbox, store) = ctx(2);

        ctx.archive_message(&chat_message("one")).await;
        ctx.archive_message(&chat_message("two")).await;
        assert_eq!(store.count_offline_messages("carol").await.unwrap(), 2);

        let stored = store.fetch_offline_messages("carol").await.unwrap();
        let delay = &stored[0].children()[0];
        assert_eq!(delay.name(), "delay");
        assert_eq!(delay.attribute("from"), Some("localhost"));
        assert_eq!(delay.text(), "Offline Storage");

        // the third exceeds capacity and bounces to the sender
        ctx.archive_message(&chat_message("three")).await;
        assert_eq!(store.count_offline_messages("carol").await.unwrap(), 2);
        let bounce = mailbox.elements.try_recv().unwrap();
        assert_eq!(bounce.stanza_type(), Some("error"));
        assert_eq!(bounce.to(), Some("alice@localhost/phone"));
        assert!(bounce
            .find_child("error")
            .unwrap()
            .find_child("service-unavailable")
            .is_some());
    }

    #[tokio::test]
    async fn bounces_for_unknown_recipients() {
        let (ctx, mut mailbox, store) = ctx(16);
        let message = Message::from_element(
            parse_standalone(r#"<message type="chat"><body>hi</body></message>"#).unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "nobody@localhost".parse::<Jid>().unwrap(),
        )
        .unwrap();

        ctx.archive_message(&message).await;
        assert_eq!(store.count_offline_messages("nobody").await.unwrap(), 0);
        assert!(mailbox.elements.try_recv().is_ok());
    }

    #[tokio::test]
    async fn delivery_replays_in_order_then_clears() {
        let (sender_ctx, _sender_mailbox, store) = ctx(16);
        sender_ctx.archive_message(&chat_message("first")).await;
        sender_ctx.archive_message(&chat_message("second")).await;

        let (carol, mut carol_mailbox) = StreamHandle::channel("c2", "localhost");
        carol.set_authenticated("carol");
        carol.bind_resource("desk");
        let carol_ctx = OfflineCtx {
            cfg: OfflineSettings { queue_size: 16 },
            strm: carol,
            store: store.clone(),
        };

        carol_ctx.deliver_offline_messages().await;

        let first = carol_mailbox.elements.try_recv().unwrap();
        let second = carol_mailbox.elements.try_recv().unwrap();
        assert_eq!(first.find_child("body").unwrap().text(), "first");
        assert_eq!(second.find_child("body").unwrap().text(), "second");
        assert!(carol_mailbox.elements.try_recv().is_err());
        assert_eq!(store.count_offline_messages("carol").await.unwrap(), 0);
    }
}
