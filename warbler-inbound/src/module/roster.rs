use std::sync::Arc;

use anyhow::{anyhow, Error};
use tracing::{error, info};
use uuid::Uuid;

use warbler_backend::store::{RosterItem, RosterNotification, StoreHandle, Subscription};
use warbler_core::concurrent::OperationQueue;
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::jid::Jid;
use warbler_core::xmpp::stanza::{Iq, IqType, Presence, PresenceType};
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::{SessionRegistry, StreamHandle};

use super::IqHandler;

const ROSTER_QUEUE_SIZE: usize = 32;

/// Roster management and RFC 6121 subscription semantics. Every mutation
/// for the session runs on the module's operation queue, so handlers are
/// written as straight-line code.
pub struct Roster {
    queue: OperationQueue,
    ctx: RosterCtx,
}

#[derive(Clone)]
struct RosterCtx {
    strm: StreamHandle,
    registry: Arc<SessionRegistry>,
    store: StoreHandle,
}

impl Roster {
    pub fn new(strm: StreamHandle, registry: Arc<SessionRegistry>, store: StoreHandle) -> Self {
        Self {
            queue: OperationQueue::new(ROSTER_QUEUE_SIZE, None),
            ctx: RosterCtx {
                strm,
                registry,
                store,
            },
        }
    }

    pub fn process_presence(&self, presence: Presence) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            if let Err(err) = ctx.process_presence(&presence).await {
                error!("roster presence processing failed: {err}");
            }
        });
    }

    /// Replays archived inbound `subscribe` presences on session start.
    pub fn deliver_pending_approval_notifications(&self) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            if let Err(err) = ctx.deliver_pending_approval_notifications().await {
                error!("pending notification delivery failed: {err}");
            }
        });
    }

    /// Sends the available presence of every subscribed-to contact to the
    /// freshly available user.
    pub fn receive_presences(&self) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            if let Err(err) = ctx.receive_presences().await {
                error!("initial presence delivery failed: {err}");
            }
        });
    }

    /// Fans a self presence out to every contact subscribed to the sender.
    pub fn broadcast_presence(
        &self,
        from: Jid,
        presence_type: PresenceType,
        children: Vec<Element>,
    ) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            if let Err(err) = ctx.broadcast_presence(&from, presence_type, &children).await {
                error!("presence broadcast failed: {err}");
            }
        });
    }
}

impl IqHandler for Roster {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.find_child_ns("query", namespaces::ROSTER).is_some()
    }

    fn process_iq(&self, iq: Iq) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.process_iq(&iq).await;
        });
    }
}

impl RosterCtx {
    async fn process_iq(&self, iq: &Iq) {
        let Some(query) = iq.find_child_ns("query", namespaces::ROSTER) else {
            return;
        };
        if iq.is_get() {
            self.send_roster(iq, query).await;
        } else if iq.is_set() {
            self.update_roster(iq, query).await;
        } else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
        }
    }

    async fn send_roster(&self, iq: &Iq, query: &Element) {
        if query.children_count() > 0 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        let username = self.strm.username();
        info!(username = %username, "retrieving user roster");

        let items = match self.store.fetch_roster_items(&username).await {
            Ok(items) => items,
            Err(err) => {
                error!("roster fetch failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                return;
            }
        };

        let mut result = iq.result_iq();
        let mut query = Element::new_ns("query", namespaces::ROSTER);
        for item in &items {
            query.add_child(self.element_from_roster_item(item));
        }
        result.add_child(query);
        self.strm.send(result);

        self.strm.set_roster_requested();
    }

    async fn update_roster(&self, iq: &Iq, query: &Element) {
        let items = query.find_children("item");
        if items.len() != 1 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        let item = match self.roster_item_from_element(items[0]) {
            Ok(item) => item,
            Err(_) => {
                self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
                return;
            }
        };
        let result = match item.subscription {
            Subscription::Remove => self.remove_roster_item(item).await,
            _ => self.update_roster_item(item).await,
        };
        match result {
            Ok(()) => self.strm.send(iq.result_iq()),
            Err(err) => {
                error!("roster update failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
            }
        }
    }

    async fn remove_roster_item(&self, item: RosterItem) -> Result<(), Error> {
        let user_jid = self.strm.jid();
        let contact_jid = self.roster_item_jid(&item);

        info!(contact = %contact_jid, username = %self.strm.username(), "removing roster item");

        // removing a contact that was never on the roster is a no-op, which
        // also keeps repeated removes from mutating the contact side again
        let user_item = self
            .store
            .fetch_roster_item(user_jid.node(), contact_jid.node())
            .await?;
        let Some(mut user_item) = user_item else {
            return Ok(());
        };

        let mut unsubscribe = None;
        let mut unsubscribed = None;
        let user_subscription = user_item.subscription;
        match user_subscription {
            Subscription::To => {
                unsubscribe = Some(Presence::build(
                    &user_jid.to_bare(),
                    &contact_jid.to_bare(),
                    PresenceType::Unsubscribe,
                ));
            }
            Subscription::From => {
                unsubscribed = Some(Presence::build(
                    &user_jid.to_bare(),
                    &contact_jid.to_bare(),
                    PresenceType::Unsubscribed,
                ));
            }
            Subscription::Both => {
                unsubscribe = Some(Presence::build(
                    &user_jid.to_bare(),
                    &contact_jid.to_bare(),
                    PresenceType::Unsubscribe,
                ));
                unsubscribed = Some(Presence::build(
                    &user_jid.to_bare(),
                    &contact_jid.to_bare(),
                    PresenceType::Unsubscribed,
                ));
            }
            _ => {}
        }
        user_item.subscription = Subscription::Remove;
        user_item.ask = false;

        self.store
            .delete_roster_notification(user_jid.node(), contact_jid.node())
            .await?;
        self.store
            .delete_roster_item(user_jid.node(), contact_jid.node())
            .await?;
        self.push_roster_item(&user_item, &user_jid);

        if self.is_local_jid(&contact_jid) {
            let contact_item = self
                .store
                .fetch_roster_item(contact_jid.node(), user_jid.node())
                .await?;
            if let Some(mut contact_item) = contact_item {
                if matches!(
                    contact_item.subscription,
                    Subscription::From | Subscription::Both
                ) {
                    self.route_presences_from(&contact_jid, &user_jid, PresenceType::Unavailable);
                }
                contact_item.subscription = match contact_item.subscription {
                    Subscription::Both => Subscription::To,
                    _ => Subscription::None,
                };
                self.store
                    .insert_or_update_roster_item(contact_item.clone())
                    .await?;
                self.push_roster_item(&contact_item, &contact_jid);
            }
        }

        if let Some(unsubscribe) = unsubscribe {
            self.route_presence(&unsubscribe, &contact_jid);
        }
        if let Some(unsubscribed) = unsubscribed {
            self.route_presence(&unsubscribed, &contact_jid);
        }
        if matches!(user_subscription, Subscription::From | Subscription::Both) {
            self.route_presences_from(&user_jid, &contact_jid, PresenceType::Unavailable);
        }
        Ok(())
    }

    async fn update_roster_item(&self, item: RosterItem) -> Result<(), Error> {
        let user_jid = self.strm.jid();
        let contact_jid = self.roster_item_jid(&item);

        info!(contact = %contact_jid, username = %self.strm.username(), "updating roster item");

        let stored = self
            .store
            .fetch_roster_item(user_jid.node(), contact_jid.node())
            .await?;
        let user_item = match stored {
            Some(mut stored) => {
                stored.name = item.name;
                stored.groups = item.groups;
                stored.ask = item.ask;
                stored
            }
            None => RosterItem {
                username: self.strm.username(),
                contact: item.contact,
                name: item.name,
                subscription: Subscription::None,
                ask: item.ask,
                groups: item.groups,
            },
        };
        self.store
            .insert_or_update_roster_item(user_item.clone())
            .await?;
        self.push_roster_item(&user_item, &user_jid);
        Ok(())
    }

    async fn process_presence(&self, presence: &Presence) -> Result<(), Error> {
        match presence.presence_type() {
            PresenceType::Subscribe => self.process_subscribe(presence).await,
            PresenceType::Subscribed => self.process_subscribed(presence).await,
            PresenceType::Unsubscribe => self.process_unsubscribe(presence).await,
            PresenceType::Unsubscribed => self.process_unsubscribed(presence).await,
            _ => Ok(()),
        }
    }

    async fn process_subscribe(&self, presence: &Presence) -> Result<(), Error> {
        let user_jid = self.strm.jid();
        let contact_jid = presence.to_jid().clone();

        info!(contact = %contact_jid, username = %self.strm.username(), "processing 'subscribe'");

        let stored = self
            .store
            .fetch_roster_item(user_jid.node(), contact_jid.node())
            .await?;
        let user_item = match stored {
            Some(mut stored) => match stored.subscription {
                Subscription::To | Subscription::Both => return Ok(()), // already subscribed
                _ => {
                    stored.ask = true;
                    stored
                }
            },
            None => RosterItem {
                username: user_jid.node().to_string(),
                contact: contact_jid.node().to_string(),
                name: String::new(),
                subscription: Subscription::None,
                ask: true,
                groups: Vec::new(),
            },
        };
        self.store
            .insert_or_update_roster_item(user_item.clone())
            .await?;
        self.push_roster_item(&user_item, &user_jid);

        // stamp the subscribe with the user's bare JID as 'from'
        let mut routed = Presence::build(
            &user_jid.to_bare(),
            &contact_jid.to_bare(),
            PresenceType::Subscribe,
        );
        routed.add_children(presence.children().to_vec());

        if self.is_local_jid(&contact_jid) {
            self.store
                .insert_or_update_roster_notification(RosterNotification {
                    username: user_jid.node().to_string(),
                    contact: contact_jid.node().to_string(),
                    elements: presence.children().to_vec(),
                })
                .await?;
        }
        self.route_presence(&routed, &contact_jid);
        Ok(())
    }

    async fn process_subscribed(&self, presence: &Presence) -> Result<(), Error> {
        let user_jid = presence.to_jid().clone();
        let contact_jid = self.strm.jid();

        info!(user = %user_jid, username = %self.strm.username(), "processing 'subscribed'");

        self.store
            .delete_roster_notification(user_jid.node(), contact_jid.node())
            .await?;

        let contact_item = self
            .store
            .fetch_roster_item(contact_jid.node(), user_jid.node())
            .await?;
        let contact_item = match contact_item {
            Some(mut contact_item) => {
                contact_item.subscription = match contact_item.subscription {
                    Subscription::To => Subscription::Both,
                    Subscription::None => Subscription::From,
                    other => other,
                };
                contact_item
            }
            // approving implicitly creates the approver's roster entry
            None => RosterItem {
                username: contact_jid.node().to_string(),
                contact: user_jid.node().to_string(),
                name: String::new(),
                subscription: Subscription::From,
                ask: false,
                groups: Vec::new(),
            },
        };
        self.store
            .insert_or_update_roster_item(contact_item.clone())
            .await?;
        self.push_roster_item(&contact_item, &contact_jid);

        // stamp the subscribed with the contact's bare JID as 'from'
        let mut routed = Presence::build(
            &contact_jid.to_bare(),
            &user_jid.to_bare(),
            PresenceType::Subscribed,
        );
        routed.add_children(presence.children().to_vec());

        if self.is_local_jid(&user_jid) {
            let user_item = self
                .store
                .fetch_roster_item(user_jid.node(), contact_jid.node())
                .await?;
            if let Some(mut user_item) = user_item {
                match user_item.subscription {
                    Subscription::From => user_item.subscription = Subscription::Both,
                    Subscription::None => user_item.subscription = Subscription::To,
                    _ => return Ok(()),
                }
                user_item.ask = false;
                self.store
                    .insert_or_update_roster_item(user_item.clone())
                    .await?;
                self.push_roster_item(&user_item, &user_jid);
            }
        }
        self.route_presence(&routed, &user_jid);
        self.route_presences_from(&contact_jid, &user_jid, PresenceType::Available);
        Ok(())
    }

    async fn process_unsubscribe(&self, presence: &Presence) -> Result<(), Error> {
        let user_jid = self.strm.jid();
        let contact_jid = presence.to_jid().clone();

        info!(contact = %contact_jid, username = %self.strm.username(), "processing 'unsubscribe'");

        let mut user_subscription = Subscription::None;
        let user_item = self
            .store
            .fetch_roster_item(user_jid.node(), contact_jid.node())
            .await?;
        if let Some(mut user_item) = user_item {
            user_subscription = user_item.subscription;
            user_item.subscription = match user_subscription {
                Subscription::Both => Subscription::From,
                _ => Subscription::None,
            };
            self.store
                .insert_or_update_roster_item(user_item.clone())
                .await?;
            self.push_roster_item(&user_item, &user_jid);
        }

        let mut routed = Presence::build(
            &user_jid.to_bare(),
            &contact_jid.to_bare(),
            PresenceType::Unsubscribe,
        );
        routed.add_children(presence.children().to_vec());

        if self.is_local_jid(&contact_jid) {
            let contact_item = self
                .store
                .fetch_roster_item(contact_jid.node(), user_jid.node())
                .await?;
            if let Some(mut contact_item) = contact_item {
                contact_item.subscription = match contact_item.subscription {
                    Subscription::Both => Subscription::To,
                    _ => Subscription::None,
                };
                self.store
                    .insert_or_update_roster_item(contact_item.clone())
                    .await?;
                self.push_roster_item(&contact_item, &contact_jid);
            }
        }
        self.route_presence(&routed, &contact_jid);

        if matches!(user_subscription, Subscription::To | Subscription::Both) {
            self.route_presences_from(&contact_jid, &user_jid, PresenceType::Unavailable);
        }
        Ok(())
    }

    async fn process_unsubscribed(&self, presence: &Presence) -> Result<(), Error> {
        let user_jid = presence.to_jid().clone();
        let contact_jid = self.strm.jid();

        info!(user = %user_jid, username = %self.strm.username(), "processing 'unsubscribed'");

        self.store
            .delete_roster_notification(user_jid.node(), contact_jid.node())
            .await?;

        let mut contact_subscription = Subscription::None;
        let contact_item = self
            .store
            .fetch_roster_item(contact_jid.node(), user_jid.node())
            .await?;
        if let Some(mut contact_item) = contact_item {
            contact_subscription = contact_item.subscription;
            contact_item.subscription = match contact_subscription {
                Subscription::Both => Subscription::To,
                _ => Subscription::None,
            };
            self.store
                .insert_or_update_roster_item(contact_item.clone())
                .await?;
            self.push_roster_item(&contact_item, &contact_jid);
        }

        let mut routed = Presence::build(
            &contact_jid.to_bare(),
            &user_jid.to_bare(),
            PresenceType::Unsubscribed,
        );
        routed.add_children(presence.children().to_vec());

        if self.is_local_jid(&user_jid) {
            let user_item = self
                .store
                .fetch_roster_item(user_jid.node(), contact_jid.node())
                .await?;
            if let Some(mut user_item) = user_item {
                user_item.subscription = match user_item.subscription {
                    Subscription::Both => Subscription::From,
                    _ => Subscription::None,
                };
                user_item.ask = false;
                self.store
                    .insert_or_update_roster_item(user_item.clone())
                    .await?;
                self.push_roster_item(&user_item, &user_jid);
            }
        }
        self.route_presence(&routed, &user_jid);

        if matches!(
            contact_subscription,
            Subscription::From | Subscription::Both
        ) {
            self.route_presences_from(&contact_jid, &user_jid, PresenceType::Unavailable);
        }
        Ok(())
    }

    async fn deliver_pending_approval_notifications(&self) -> Result<(), Error> {
        let notifications = self
            .store
            .fetch_roster_notifications(&self.strm.username())
            .await?;
        for notification in notifications {
            let from_jid = Jid::bare(&notification.username, &self.strm.domain());
            let mut presence =
                Presence::build(&from_jid, &self.strm.jid(), PresenceType::Subscribe);
            presence.add_children(notification.elements);
            self.strm.send(presence);
        }
        Ok(())
    }

    async fn receive_presences(&self) -> Result<(), Error> {
        let items = self.store.fetch_roster_items(&self.strm.username()).await?;
        let user_jid = self.strm.jid();
        for item in items {
            if matches!(item.subscription, Subscription::To | Subscription::Both) {
                let contact_jid = self.roster_item_jid(&item);
                self.route_presences_from(&contact_jid, &user_jid, PresenceType::Available);
            }
        }
        Ok(())
    }

    async fn broadcast_presence(
        &self,
        from: &Jid,
        presence_type: PresenceType,
        children: &[Element],
    ) -> Result<(), Error> {
        let items = self.store.fetch_roster_items_as_contact(from.node()).await?;
        for item in items {
            if !matches!(item.subscription, Subscription::To | Subscription::Both) {
                continue;
            }
            let user_jid = Jid::bare(&item.username, from.domain());
            let mut presence = Presence::build(from, &user_jid, presence_type);
            presence.add_children(children.to_vec());
            self.route_presence(&presence, &user_jid);
        }
        Ok(())
    }

    /// Sends `presence_type` presence from every available resource of
    /// `from` to `to`, carrying each resource's last advertised presence
    /// children when available.
    fn route_presences_from(&self, from: &Jid, to: &Jid, presence_type: PresenceType) {
        for from_stream in self.registry.available_streams(from.node()) {
            let mut presence =
                Presence::build(&from_stream.jid(), &to.to_bare(), presence_type);
            if presence_type == PresenceType::Available {
                presence.add_children(from_stream.presence_children());
            }
            self.route_presence(&presence, to);
        }
    }

    /// Delivers a presence element to every available resource of `to`,
    /// readdressed to each resource's full JID.
    fn route_presence(&self, presence: &Element, to: &Jid) {
        if !self.is_local_jid(to) {
            // federation stub
            return;
        }
        for to_stream in self.registry.available_streams(to.node()) {
            let mut readdressed = presence.clone();
            readdressed.set_attribute("to", &to_stream.jid().to_string());
            to_stream.send(readdressed);
        }
    }

    /// Builds a roster push and fans it out to every authenticated stream
    /// of the target user that has requested its roster.
    fn push_roster_item(&self, item: &RosterItem, to: &Jid) {
        let mut query = Element::new_ns("query", namespaces::ROSTER);
        query.add_child(self.element_from_roster_item(item));

        for stream in self.registry.available_streams(to.node()) {
            if !stream.is_roster_requested() {
                continue;
            }
            let mut push = Iq::build(&Uuid::new_v4().to_string(), IqType::Set);
            push.set_attribute("to", &stream.jid().to_string());
            push.add_child(query.clone());
            stream.send(push);
        }
    }

    fn is_local_jid(&self, jid: &Jid) -> bool {
        self.registry.is_local_domain(jid.domain())
    }

    fn roster_item_jid(&self, item: &RosterItem) -> Jid {
        Jid::bare(&item.contact, &self.strm.domain())
    }

    fn roster_item_from_element(&self, item: &Element) -> Result<RosterItem, Error> {
        let jid = item
            .attribute("jid")
            .ok_or_else(|| anyhow!("item 'jid' attribute is required"))?;
        let jid = jid.parse::<Jid>()?;
        if jid.node().is_empty() {
            return Err(anyhow!("item 'jid' must carry a node part"));
        }

        let subscription = match item.attribute("subscription") {
            Some(value) => Subscription::parse(value)
                .ok_or_else(|| anyhow!("unrecognized 'subscription' value: {value}"))?,
            None => Subscription::None,
        };
        let ask = match item.attribute("ask") {
            Some("subscribe") => true,
            Some(other) => return Err(anyhow!("unrecognized 'ask' value: {other}")),
            None => false,
        };
        let mut groups = Vec::new();
        for group in item.find_children("group") {
            if group.attributes_count() > 0 {
                return Err(anyhow!("group element must not contain any attribute"));
            }
            groups.push(group.text().to_string());
        }

        Ok(RosterItem {
            username: self.strm.username(),
            contact: jid.node().to_string(),
            name: item.attribute("name").unwrap_or("").to_string(),
            subscription,
            ask,
            groups,
        })
    }

    fn element_from_roster_item(&self, item: &RosterItem) -> Element {
        let jid = self.roster_item_jid(item);
        let mut element = Element::new("item");
        element.set_attribute("jid", &jid.to_string());
        if !item.name.is_empty() {
            element.set_attribute("name", &item.name);
        }
        element.set_attribute("subscription", item.subscription.as_str());
        if item.ask {
            element.set_attribute("ask", "subscribe");
        }
        for group in &item.groups {
            if group.is_empty() {
                continue;
            }
            let mut group_element = Element::new("group");
            group_element.set_text(group);
            element.add_child(group_element);
        }
        element
    }
}
