use crate::xml::{namespaces, Element};
use crate::xmpp::jid::Jid;
use crate::xmpp::stanza_error::{error_reply, StanzaErrorKind};

/// A validated top-level stanza with resolved addresses.
#[derive(Debug, Clone)]
pub enum Stanza {
    Iq(Iq),
    Presence(Presence),
    Message(Message),
}

impl Stanza {
    pub fn to_jid(&self) -> &Jid {
        match self {
            Stanza::Iq(iq) => iq.to_jid(),
            Stanza::Presence(presence) => presence.to_jid(),
            Stanza::Message(message) => message.to_jid(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Iq {
    element: Element,
    iq_type: IqType,
    from: Jid,
    to: Jid,
}

impl Iq {
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, StanzaErrorKind> {
        if element.name() != "iq" {
            return Err(StanzaErrorKind::BadRequest);
        }
        if !element.text().is_empty() {
            return Err(StanzaErrorKind::BadRequest);
        }
        let iq_type = match element.stanza_type() {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            _ => return Err(StanzaErrorKind::BadRequest),
        };
        Ok(Self {
            element,
            iq_type,
            from,
            to,
        })
    }

    /// Builds a bare IQ element for server-originated requests and pushes.
    pub fn build(id: &str, iq_type: IqType) -> Element {
        let mut element = Element::new("iq");
        element.set_attribute("id", id);
        element.set_attribute("type", iq_type.as_str());
        element
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn id(&self) -> &str {
        self.element.id().unwrap_or("")
    }

    pub fn iq_type(&self) -> IqType {
        self.iq_type
    }

    pub fn is_get(&self) -> bool {
        self.iq_type == IqType::Get
    }

    pub fn is_set(&self) -> bool {
        self.iq_type == IqType::Set
    }

    pub fn is_result(&self) -> bool {
        self.iq_type == IqType::Result
    }

    pub fn is_error(&self) -> bool {
        self.iq_type == IqType::Error
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.element.find_child(name)
    }

    pub fn find_child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.find_child_ns(name, namespace)
    }

    /// A `result` reply skeleton preserving the id, with addresses swapped.
    pub fn result_iq(&self) -> Element {
        let mut result = Iq::build(self.id(), IqType::Result);
        if let Some(from) = self.element.from() {
            result.set_attribute("to", from);
        }
        if let Some(to) = self.element.to() {
            result.set_attribute("from", to);
        }
        result
    }

    pub fn error_iq(&self, kind: StanzaErrorKind) -> Element {
        error_reply(&self.element, kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceType::Available => "",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            PresenceType::Probe => "probe",
            PresenceType::Error => "error",
        }
    }

    fn from_attribute(value: Option<&str>) -> Option<Self> {
        match value.unwrap_or("") {
            "" => Some(PresenceType::Available),
            "unavailable" => Some(PresenceType::Unavailable),
            "subscribe" => Some(PresenceType::Subscribe),
            "subscribed" => Some(PresenceType::Subscribed),
            "unsubscribe" => Some(PresenceType::Unsubscribe),
            "unsubscribed" => Some(PresenceType::Unsubscribed),
            "probe" => Some(PresenceType::Probe),
            "error" => Some(PresenceType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    Available,
    Away,
    Chat,
    DoNotDisturb,
    ExtendedAway,
}

#[derive(Debug, Clone)]
pub struct Presence {
    element: Element,
    presence_type: PresenceType,
    show_state: ShowState,
    priority: i8,
    from: Jid,
    to: Jid,
}

impl Presence {
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, StanzaErrorKind> {
        if element.name() != "presence" {
            return Err(StanzaErrorKind::BadRequest);
        }
        let presence_type = PresenceType::from_attribute(element.stanza_type())
            .ok_or(StanzaErrorKind::BadRequest)?;
        let show_state = parse_show_state(&element)?;
        validate_status(&element)?;
        let priority = parse_priority(&element)?;

        let mut element = element;
        element.set_attribute("from", &from.to_string());
        element.set_attribute("to", &to.to_string());

        Ok(Self {
            element,
            presence_type,
            show_state,
            priority,
            from,
            to,
        })
    }

    /// Builds a presence element addressed between two JIDs. The type
    /// attribute is omitted for available presence.
    pub fn build(from: &Jid, to: &Jid, presence_type: PresenceType) -> Element {
        let mut element = Element::new("presence");
        element.set_attribute("from", &from.to_string());
        element.set_attribute("to", &to.to_string());
        if presence_type != PresenceType::Available {
            element.set_attribute("type", presence_type.as_str());
        }
        element
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn presence_type(&self) -> PresenceType {
        self.presence_type
    }

    pub fn is_available(&self) -> bool {
        self.presence_type == PresenceType::Available
    }

    pub fn is_unavailable(&self) -> bool {
        self.presence_type == PresenceType::Unavailable
    }

    pub fn show_state(&self) -> ShowState {
        self.show_state
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn children(&self) -> &[Element] {
        self.element.children()
    }

    pub fn error_presence(&self, kind: StanzaErrorKind) -> Element {
        error_reply(&self.element, kind)
    }
}

fn parse_show_state(element: &Element) -> Result<ShowState, StanzaErrorKind> {
    let shows = element.find_children("show");
    match shows.len() {
        0 => Ok(ShowState::Available),
        1 => {
            let show = shows[0];
            if show.attributes_count() > 0 {
                return Err(StanzaErrorKind::BadRequest);
            }
            match show.text() {
                "away" => Ok(ShowState::Away),
                "chat" => Ok(ShowState::Chat),
                "dnd" => Ok(ShowState::DoNotDisturb),
                "xa" => Ok(ShowState::ExtendedAway),
                _ => Err(StanzaErrorKind::BadRequest),
            }
        }
        _ => Err(StanzaErrorKind::BadRequest),
    }
}

fn validate_status(element: &Element) -> Result<(), StanzaErrorKind> {
    for status in element.find_children("status") {
        let foreign = status
            .attributes()
            .iter()
            .any(|attr| attr.label != "xml:lang");
        if foreign {
            return Err(StanzaErrorKind::BadRequest);
        }
    }
    Ok(())
}

fn parse_priority(element: &Element) -> Result<i8, StanzaErrorKind> {
    let priorities = element.find_children("priority");
    match priorities.len() {
        0 => Ok(0),
        1 => {
            let value = priorities[0]
                .text()
                .parse::<i16>()
                .map_err(|_| StanzaErrorKind::BadRequest)?;
            i8::try_from(value).map_err(|_| StanzaErrorKind::BadRequest)
        }
        _ => Err(StanzaErrorKind::BadRequest),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

#[derive(Debug, Clone)]
pub struct Message {
    element: Element,
    message_type: MessageType,
    from: Jid,
    to: Jid,
}

impl Message {
    pub fn from_element(element: Element, from: Jid, to: Jid) -> Result<Self, StanzaErrorKind> {
        if element.name() != "message" {
            return Err(StanzaErrorKind::BadRequest);
        }
        let message_type = match element.stanza_type() {
            None | Some("") | Some("normal") => MessageType::Normal,
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            Some(_) => return Err(StanzaErrorKind::BadRequest),
        };
        let mut element = element;
        element.set_attribute("from", &from.to_string());
        element.set_attribute("to", &to.to_string());
        Ok(Self {
            element,
            message_type,
            from,
            to,
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn id(&self) -> &str {
        self.element.id().unwrap_or("")
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    /// A copy stamped with a `urn:xmpp:delay` element, for offline storage.
    pub fn delayed(&self, from_domain: &str, text: &str) -> Element {
        let mut delayed = self.element.clone();
        let mut delay = Element::new_ns("delay", namespaces::DELAY);
        delay.set_attribute("from", from_domain);
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        delay.set_attribute("stamp", &stamp);
        if !text.is_empty() {
            delay.set_text(text);
        }
        delayed.insert_child(0, delay);
        delayed
    }

    pub fn error_message(&self, kind: StanzaErrorKind) -> Element {
        error_reply(&self.element, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parser::parse_standalone;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn iq_from(xml: &str) -> Result<Iq, StanzaErrorKind> {
        Iq::from_element(
            parse_standalone(xml).unwrap(),
            jid("alice@localhost/phone"),
            jid("localhost"),
        )
    }

    fn presence_from(xml: &str) -> Result<Presence, StanzaErrorKind> {
        Presence::from_element(
            parse_standalone(xml).unwrap(),
            jid("alice@localhost/phone"),
            jid("bob@localhost"),
        )
    }

    #[test]
    fn iq_rejects_text_content_and_unknown_types() {
        assert!(iq_from(r#"<iq id="1" type="get"><ping/></iq>"#).is_ok());
        assert!(matches!(
            iq_from(r#"<iq id="1" type="get">text</iq>"#),
            Err(StanzaErrorKind::BadRequest)
        ));
        assert!(iq_from(r#"<iq id="1" type="ask"/>"#).is_err());
        assert!(iq_from(r#"<iq id="1"/>"#).is_err());
    }

    #[test]
    fn result_iq_preserves_id_and_swaps_addresses() {
        let iq = iq_from(r#"<iq id="42" type="get" from="alice@localhost/phone" to="localhost"/>"#)
            .unwrap();
        let result = iq.result_iq();
        assert_eq!(result.id(), Some("42"));
        assert_eq!(result.stanza_type(), Some("result"));
        assert_eq!(result.to(), Some("alice@localhost/phone"));
        assert_eq!(result.from(), Some("localhost"));
    }

    #[test]
    fn presence_accepts_all_defined_types() {
        for presence_type in [
            "unavailable",
            "subscribe",
            "subscribed",
            "unsubscribe",
            "unsubscribed",
            "probe",
            "error",
        ] {
            let xml = format!(r#"<presence type="{presence_type}"/>"#);
            assert!(presence_from(&xml).is_ok(), "{presence_type}");
        }
        assert!(presence_from(r#"<presence type="invisible"/>"#).is_err());
    }

    #[test]
    fn presence_parses_show_and_priority() {
        let presence =
            presence_from("<presence><show>dnd</show><priority>5</priority></presence>").unwrap();
        assert_eq!(presence.show_state(), ShowState::DoNotDisturb);
        assert_eq!(presence.priority(), 5);
        assert!(presence.is_available());
    }

    #[test]
    fn presence_rejects_malformed_children() {
        assert!(presence_from("<presence><show>busy</show></presence>").is_err());
        assert!(presence_from(r#"<presence><show lang="en">dnd</show></presence>"#).is_err());
        assert!(presence_from("<presence><show>away</show><show>dnd</show></presence>").is_err());
        assert!(presence_from("<presence><priority>1</priority><priority>2</priority></presence>")
            .is_err());
        assert!(presence_from("<presence><priority>300</priority></presence>").is_err());
        assert!(presence_from(r#"<presence><status who="x">hi</status></presence>"#).is_err());
        assert!(presence_from(r#"<presence><status xml:lang="en">hi</status></presence>"#).is_ok());
    }

    #[test]
    fn presence_stamps_resolved_addresses_onto_the_element() {
        let presence = presence_from("<presence/>").unwrap();
        assert_eq!(presence.element().from(), Some("alice@localhost/phone"));
        assert_eq!(presence.element().to(), Some("bob@localhost"));
    }

    #[test]
    fn message_type_defaults_to_normal() {
        let message = Message::from_element(
            parse_standalone("<message><body>hi</body></message>").unwrap(),
            jid("alice@localhost/phone"),
            jid("bob@localhost"),
        )
        .unwrap();
        assert_eq!(message.message_type(), MessageType::Normal);

        assert!(Message::from_element(
            parse_standalone(r#"<message type="shout"/>"#).unwrap(),
            jid("alice@localhost/phone"),
            jid("bob@localhost"),
        )
        .is_err());
    }

    #[test]
    fn delayed_copy_prepends_the_stamp() {
        let message = Message::from_element(
            parse_standalone(r#"<message type="chat"><body>hi</body></message>"#).unwrap(),
            jid("alice@localhost/phone"),
            jid("carol@localhost"),
        )
        .unwrap();
        let delayed = message.delayed("localhost", "Offline Storage");
        let delay = &delayed.children()[0];
        assert_eq!(delay.name(), "delay");
        assert_eq!(delay.namespace(), "urn:xmpp:delay");
        assert_eq!(delay.attribute("from"), Some("localhost"));
        assert_eq!(delay.text(), "Offline Storage");
        assert!(delay.attribute("stamp").unwrap().ends_with('Z'));
        assert_eq!(delayed.children()[1].name(), "body");
        // the original is untouched
        assert_eq!(message.element().children().len(), 1);
    }

    #[test]
    fn presence_build_omits_empty_type_attribute() {
        let available = Presence::build(
            &jid("alice@localhost/phone"),
            &jid("bob@localhost"),
            PresenceType::Available,
        );
        assert_eq!(available.stanza_type(), None);

        let unavailable = Presence::build(
            &jid("alice@localhost/phone"),
            &jid("bob@localhost"),
            PresenceType::Unavailable,
        );
        assert_eq!(unavailable.stanza_type(), Some("unavailable"));
    }
}
