use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::select;
use tracing::{debug, error, info};
use uuid::Uuid;

use warbler_backend::settings::ServerSettings;
use warbler_backend::store::StoreHandle;
use warbler_core::xml::parser::{Frame, StreamParser};
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::jid::Jid;
use warbler_core::xmpp::stanza::{Iq, Message, Presence, PresenceType, Stanza};
use warbler_core::xmpp::stanza_error::{error_reply, StanzaErrorKind};
use warbler_core::xmpp::stream_error::StreamErrorKind;
use warbler_services::registry::{SessionRegistry, StreamHandle, StreamMailbox, StreamPhase};

use crate::module::disco::{DiscoIdentity, DiscoInfo};
use crate::module::offline::Offline;
use crate::module::ping::Ping;
use crate::module::private::PrivateStorage;
use crate::module::register::Register;
use crate::module::roster::Roster;
use crate::module::vcard::VCard;
use crate::module::version::Version;
use crate::module::IqHandler;
use crate::sasl::{AuthContext, Authenticator, SaslFailure, SaslOutcome};
use crate::transport::{Transport, TransportError};

enum StanzaBuildError {
    Stream(StreamErrorKind),
    Stanza(StanzaErrorKind, Element),
}

/// One client connection: the stream state machine driving negotiation and,
/// once a session is established, stanza routing. The session task owns the
/// transport and parser; everything else reaches the stream through its
/// registered `StreamHandle`.
pub struct ClientSession {
    cfg: Arc<ServerSettings>,
    registry: Arc<SessionRegistry>,
    store: StoreHandle,
    transport: Transport,
    parser: StreamParser,
    strm: StreamHandle,
    mailbox: StreamMailbox,
    connected: Arc<AtomicBool>,
    authenticators: Vec<Authenticator>,
    active_authenticator: Option<usize>,
    iq_handlers: Vec<Arc<dyn IqHandler>>,
    roster: Arc<Roster>,
    offline: Option<Arc<Offline>>,
    ping: Option<Arc<Ping>>,
    register: Option<Arc<Register>>,
    roster_started: bool,
    offline_delivered: bool,
}

impl ClientSession {
    pub fn new(
        socket: TcpStream,
        cfg: Arc<ServerSettings>,
        registry: Arc<SessionRegistry>,
        store: StoreHandle,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let (strm, mailbox) = StreamHandle::channel(&id, registry.default_domain());

        let transport = Transport::new(
            socket,
            cfg.transport.buffer_size,
            Duration::from_secs(cfg.transport.keep_alive),
        );
        let authenticators = Authenticator::from_config(&cfg.sasl);

        let roster = Arc::new(Roster::new(strm.clone(), registry.clone(), store.clone()));
        let mut iq_handlers: Vec<Arc<dyn IqHandler>> = vec![roster.clone()];

        if cfg.modules.contains("private") {
            iq_handlers.push(Arc::new(PrivateStorage::new(strm.clone(), store.clone())));
        }
        if cfg.modules.contains("vcard") {
            iq_handlers.push(Arc::new(VCard::new(strm.clone(), store.clone())));
        }
        let register = cfg.modules.contains("registration").then(|| {
            Arc::new(Register::new(
                cfg.mod_registration.clone(),
                strm.clone(),
                store.clone(),
            ))
        });
        if let Some(register) = &register {
            iq_handlers.push(register.clone());
        }
        if cfg.modules.contains("version") {
            iq_handlers.push(Arc::new(Version::new(strm.clone())));
        }
        let ping = cfg
            .modules
            .contains("ping")
            .then(|| Arc::new(Ping::new(cfg.mod_ping.clone(), strm.clone())));
        if let Some(ping) = &ping {
            iq_handlers.push(ping.clone());
        }
        let offline = cfg.modules.contains("offline").then(|| {
            Arc::new(Offline::new(
                cfg.mod_offline.clone(),
                strm.clone(),
                store.clone(),
            ))
        });

        // the server disco entity announces every registered handler
        let mut features: Vec<String> = iq_handlers
            .iter()
            .flat_map(|handler| handler.associated_namespaces())
            .map(str::to_string)
            .collect();
        features.push(namespaces::DISCO_INFO.to_string());
        features.push(namespaces::DISCO_ITEMS.to_string());
        if let Some(offline) = &offline {
            features.extend(
                offline
                    .associated_namespaces()
                    .into_iter()
                    .map(str::to_string),
            );
        }
        let identities = vec![DiscoIdentity {
            category: "server".to_string(),
            kind: "im".to_string(),
            name: cfg.id.clone(),
        }];
        iq_handlers.insert(
            1,
            Arc::new(DiscoInfo::new(
                strm.clone(),
                identities,
                features,
                Vec::new(),
            )),
        );

        registry.register_stream(&strm);

        let connected = Arc::new(AtomicBool::new(false));
        if cfg.transport.connect_timeout > 0 {
            let connected = connected.clone();
            let timeout = Duration::from_secs(cfg.transport.connect_timeout);
            let handle = strm.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !connected.load(Ordering::SeqCst) {
                    handle.disconnect(Some(StreamErrorKind::ConnectionTimeout));
                }
            });
        }

        Self {
            cfg,
            registry,
            store,
            transport,
            parser: StreamParser::new(),
            strm,
            mailbox,
            connected,
            authenticators,
            active_authenticator: None,
            iq_handlers,
            roster,
            offline,
            ping,
            register,
            roster_started: false,
            offline_delivered: false,
        }
    }

    pub async fn handle(&mut self) {
        loop {
            if self.strm.phase() == StreamPhase::Disconnected {
                return;
            }

            select! {
                read = self.transport.read() => {
                    match read {
                        Ok(bytes) => self.process_bytes(&bytes).await,
                        Err(TransportError::ReadTimeout) => {
                            self.disconnect_with_stream_error(StreamErrorKind::ConnectionTimeout)
                                .await;
                        }
                        Err(TransportError::RemotePeerClosed) => {
                            self.disconnect(false).await;
                        }
                        Err(err) => {
                            debug!("transport read failed: {err}");
                            self.disconnect(false).await;
                        }
                    }
                }
                Some(element) = self.mailbox.elements.recv() => {
                    self.write_element(&element).await;
                }
                Some(reason) = self.mailbox.disconnects.recv() => {
                    match reason {
                        Some(kind) => self.disconnect_with_stream_error(kind).await,
                        None => self.disconnect(false).await,
                    }
                }
            }
        }
    }

    async fn process_bytes(&mut self, bytes: &[u8]) {
        if let Err(err) = self.parser.feed(bytes) {
            debug!("stream feed failed: {err}");
            self.disconnect_with_stream_error(StreamErrorKind::InvalidXml)
                .await;
            return;
        }
        loop {
            if self.strm.phase() == StreamPhase::Disconnected {
                return;
            }
            match self.parser.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => return,
                Err(err) => {
                    debug!("stream parse failed: {err}");
                    self.disconnect_with_stream_error(StreamErrorKind::InvalidXml)
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::StreamStart(element) => {
                if self.strm.phase() == StreamPhase::Connecting {
                    self.handle_connecting(element).await;
                } else {
                    self.disconnect_with_stream_error(StreamErrorKind::UnsupportedStanzaType)
                        .await;
                }
            }
            Frame::XmlFragment(element) => {
                debug!(element = %element, "RECV");
                match self.strm.phase() {
                    StreamPhase::Connecting => self.handle_connecting(element).await,
                    StreamPhase::Connected => self.handle_connected(element).await,
                    StreamPhase::Authenticating => self.handle_authenticating(element).await,
                    StreamPhase::Authenticated => self.handle_authenticated(element).await,
                    StreamPhase::SessionStarted => self.handle_session_started(element).await,
                    StreamPhase::Disconnected => {}
                }
            }
            Frame::StreamEnd => {
                self.disconnect(true).await;
            }
        }
    }

    async fn handle_connecting(&mut self, element: Element) {
        self.connected.store(true, Ordering::SeqCst);

        if let Err(kind) = self.validate_stream_element(&element) {
            self.disconnect_with_stream_error(kind).await;
            return;
        }
        if let Some(to) = element.to() {
            if !to.is_empty() {
                self.strm.set_domain(to);
            }
        }

        self.open_stream().await;

        let features = self.advertised_features();
        if self.strm.is_authenticated() {
            self.strm.set_phase(StreamPhase::Authenticated);
        } else {
            self.strm.set_phase(StreamPhase::Connected);
        }
        self.write_element(&features).await;
    }

    fn validate_stream_element(&self, element: &Element) -> Result<(), StreamErrorKind> {
        if element.name() != "stream:stream" {
            return Err(StreamErrorKind::UnsupportedStanzaType);
        }
        if let Some(to) = element.to() {
            if !to.is_empty() && !self.registry.is_local_domain(to) {
                return Err(StreamErrorKind::HostUnknown);
            }
        }
        if element.namespace() != namespaces::XMPP_CLIENT
            || element.attribute("xmlns:stream") != Some(namespaces::XMPP_STREAMS)
        {
            return Err(StreamErrorKind::InvalidNamespace);
        }
        if element.attribute("version") != Some("1.0") {
            return Err(StreamErrorKind::UnsupportedVersion);
        }
        Ok(())
    }

    fn advertised_features(&self) -> Element {
        build_features(
            &self.cfg,
            &self.authenticators,
            self.strm.is_secured(),
            self.strm.is_authenticated(),
            self.strm.is_compressed(),
        )
    }

    async fn handle_connected(&mut self, element: Element) {
        match element.name() {
            "starttls" => {
                if !element.namespace().is_empty()
                    && element.namespace() != namespaces::XMPP_STARTTLS
                {
                    self.disconnect_with_stream_error(StreamErrorKind::InvalidNamespace)
                        .await;
                    return;
                }
                self.proceed_starttls().await;
            }
            "auth" => {
                if element.namespace() != namespaces::XMPP_SASL {
                    self.disconnect_with_stream_error(StreamErrorKind::InvalidNamespace)
                        .await;
                    return;
                }
                self.start_authentication(element).await;
            }
            "iq" => {
                let iq = match self.build_stanza(element).await {
                    Some(Stanza::Iq(iq)) => iq,
                    Some(_) | None => return,
                };
                if let Some(register) = self.register.clone() {
                    if register.matches_iq(&iq) {
                        register.process_iq(iq);
                        return;
                    }
                }
                if iq
                    .find_child_ns("query", namespaces::NON_SASL_AUTH)
                    .is_some()
                {
                    // non-SASL authentication is long dead
                    self.write_element(&iq.error_iq(StanzaErrorKind::ServiceUnavailable))
                        .await;
                    return;
                }
                self.disconnect_with_stream_error(StreamErrorKind::NotAuthorized)
                    .await;
            }
            "message" | "presence" => {
                self.disconnect_with_stream_error(StreamErrorKind::NotAuthorized)
                    .await;
            }
            _ => {
                self.disconnect_with_stream_error(StreamErrorKind::UnsupportedStanzaType)
                    .await;
            }
        }
    }

    async fn proceed_starttls(&mut self) {
        if self.strm.is_secured() {
            self.disconnect_with_stream_error(StreamErrorKind::NotAuthorized)
                .await;
            return;
        }
        let Some(tls) = self.cfg.tls.clone() else {
            self.write_element(&Element::new_ns("failure", namespaces::XMPP_STARTTLS))
                .await;
            self.disconnect(true).await;
            return;
        };

        self.write_element(&Element::new_ns("proceed", namespaces::XMPP_STARTTLS))
            .await;
        if let Err(err) = self.transport.start_tls(tls.server_config).await {
            error!("TLS handshake failed: {err}");
            self.disconnect(false).await;
            return;
        }
        self.strm.set_secured();
        info!(id = self.strm.id(), "secured stream");
        self.restart();
    }

    async fn start_authentication(&mut self, element: Element) {
        let mechanism = element.attribute("mechanism").unwrap_or_default();
        let index = self
            .authenticators
            .iter()
            .position(|authenticator| authenticator.mechanism() == mechanism);
        match index {
            Some(index) => self.continue_authentication(&element, index).await,
            None => {
                self.write_element(&SaslFailure::InvalidMechanism.element())
                    .await;
            }
        }
    }

    async fn continue_authentication(&mut self, element: &Element, index: usize) {
        let context = AuthContext {
            store: &self.store,
            domain: self.strm.domain(),
            channel_binding: self.transport.channel_binding_bytes("tls-unique"),
        };
        let result = self.authenticators[index]
            .process_element(element, &context)
            .await;
        match result {
            Ok(SaslOutcome::Challenge(challenge)) => {
                self.active_authenticator = Some(index);
                self.strm.set_phase(StreamPhase::Authenticating);
                self.write_element(&challenge).await;
            }
            Ok(SaslOutcome::Success { username, element }) => {
                self.write_element(&element).await;
                self.finish_authentication(&username);
            }
            Err(failure) => self.fail_authentication(failure).await,
        }
    }

    async fn handle_authenticating(&mut self, element: Element) {
        if element.namespace() != namespaces::XMPP_SASL {
            self.disconnect_with_stream_error(StreamErrorKind::InvalidNamespace)
                .await;
            return;
        }
        match self.active_authenticator {
            Some(index) => self.continue_authentication(&element, index).await,
            None => self.fail_authentication(SaslFailure::TemporaryAuthFailure).await,
        }
    }

    fn finish_authentication(&mut self, username: &str) {
        if let Some(index) = self.active_authenticator.take() {
            self.authenticators[index].reset();
        }
        self.strm.set_authenticated(username);
        self.registry.authenticate_stream(&self.strm);
        self.restart();
    }

    async fn fail_authentication(&mut self, failure: SaslFailure) {
        self.write_element(&failure.element()).await;
        if let Some(index) = self.active_authenticator.take() {
            self.authenticators[index].reset();
        }
        self.strm.set_phase(StreamPhase::Connected);
    }

    async fn handle_authenticated(&mut self, element: Element) {
        match element.name() {
            "compress" => {
                if element.namespace() != namespaces::COMPRESS_PROTOCOL {
                    self.disconnect_with_stream_error(StreamErrorKind::UnsupportedStanzaType)
                        .await;
                    return;
                }
                self.compress(&element).await;
            }
            "iq" => {
                let iq = match self.build_stanza(element).await {
                    Some(Stanza::Iq(iq)) => iq,
                    Some(_) | None => return,
                };
                if self.strm.resource().is_empty() {
                    self.bind_resource(&iq).await;
                } else {
                    self.start_session(&iq).await;
                }
            }
            _ => {
                self.disconnect_with_stream_error(StreamErrorKind::UnsupportedStanzaType)
                    .await;
            }
        }
    }

    async fn compress(&mut self, element: &Element) {
        if self.strm.is_compressed() {
            self.disconnect_with_stream_error(StreamErrorKind::UnsupportedStanzaType)
                .await;
            return;
        }
        let Some(compression) = self.cfg.compression.clone() else {
            let mut failure = Element::new_ns("failure", namespaces::COMPRESS_PROTOCOL);
            failure.add_child(Element::new("setup-failed"));
            self.write_element(&failure).await;
            return;
        };
        let method = element.find_child("method");
        match method {
            None => {
                let mut failure = Element::new_ns("failure", namespaces::COMPRESS_PROTOCOL);
                failure.add_child(Element::new("setup-failed"));
                self.write_element(&failure).await;
                return;
            }
            Some(method) if method.text() != "zlib" => {
                let mut failure = Element::new_ns("failure", namespaces::COMPRESS_PROTOCOL);
                failure.add_child(Element::new("unsupported-method"));
                self.write_element(&failure).await;
                return;
            }
            Some(_) => {}
        }

        self.write_element(&Element::new_ns("compressed", namespaces::COMPRESS_PROTOCOL))
            .await;
        self.transport.enable_compression(compression.level);
        self.strm.set_compressed();
        info!(id = self.strm.id(), "compressed stream");
        self.restart();
    }

    async fn bind_resource(&mut self, iq: &Iq) {
        let Some(bind) = iq.find_child_ns("bind", namespaces::XMPP_BIND) else {
            self.write_element(&iq.error_iq(StanzaErrorKind::NotAllowed))
                .await;
            return;
        };
        let resource = match bind.find_child("resource") {
            Some(resource) => resource.text().to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let taken = self
            .registry
            .available_streams(&self.strm.username())
            .iter()
            .any(|stream| stream.resource() == resource);
        if taken {
            self.write_element(&iq.error_iq(StanzaErrorKind::Conflict))
                .await;
            return;
        }

        self.strm.bind_resource(&resource);
        info!(
            resource = %resource,
            username = %self.strm.username(),
            "bound resource"
        );

        let mut result = iq.result_iq();
        result.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.with_child("jid", None, |jid| {
                jid.set_text(&self.strm.jid().to_string());
            });
        });
        self.write_element(&result).await;
    }

    async fn start_session(&mut self, iq: &Iq) {
        if iq
            .find_child_ns("session", namespaces::XMPP_SESSION)
            .is_none()
        {
            self.write_element(&iq.error_iq(StanzaErrorKind::NotAllowed))
                .await;
            return;
        }
        self.write_element(&iq.result_iq()).await;

        if let Some(ping) = &self.ping {
            ping.start_pinging();
        }
        self.strm.set_phase(StreamPhase::SessionStarted);
    }

    async fn handle_session_started(&mut self, element: Element) {
        if let Some(ping) = &self.ping {
            ping.reset_deadline();
        }
        let Some(stanza) = self.build_stanza(element).await else {
            return;
        };
        if !self.registry.is_local_domain(stanza.to_jid().domain()) {
            // federation stub
            return;
        }
        match stanza {
            Stanza::Iq(iq) => self.process_iq(iq).await,
            Stanza::Presence(presence) => self.process_presence(presence).await,
            Stanza::Message(message) => self.process_message(message).await,
        }
    }

    /// Validates namespace and addressing, then builds the typed stanza.
    /// Stanza-level problems answer with a mirrored error; stream-level
    /// problems terminate the connection.
    async fn build_stanza(&mut self, element: Element) -> Option<Stanza> {
        match self.try_build_stanza(element) {
            Ok(stanza) => Some(stanza),
            Err(StanzaBuildError::Stream(kind)) => {
                self.disconnect_with_stream_error(kind).await;
                None
            }
            Err(StanzaBuildError::Stanza(kind, element)) => {
                self.write_element(&error_reply(&element, kind)).await;
                None
            }
        }
    }

    fn try_build_stanza(&self, element: Element) -> Result<Stanza, StanzaBuildError> {
        let namespace = element.namespace();
        if !namespace.is_empty() && namespace != namespaces::XMPP_CLIENT {
            return Err(StanzaBuildError::Stream(StreamErrorKind::InvalidNamespace));
        }

        if let Some(from) = element.from() {
            if !from.is_empty() && !self.is_valid_from(from) {
                return Err(StanzaBuildError::Stream(StreamErrorKind::InvalidFrom));
            }
        }
        let from_jid = self.strm.jid();

        let to_jid = match element.to() {
            Some(to) if !to.is_empty() => match to.parse::<Jid>() {
                Ok(jid) => jid,
                Err(_) => {
                    return Err(StanzaBuildError::Stanza(
                        StanzaErrorKind::BadRequest,
                        element,
                    ))
                }
            },
            _ => Jid::server(&self.strm.domain()),
        };

        match element.name() {
            "iq" => Iq::from_element(element.clone(), from_jid, to_jid)
                .map(Stanza::Iq)
                .map_err(|kind| StanzaBuildError::Stanza(kind, element)),
            "presence" => Presence::from_element(element.clone(), from_jid, to_jid)
                .map(Stanza::Presence)
                .map_err(|kind| StanzaBuildError::Stanza(kind, element)),
            "message" => Message::from_element(element.clone(), from_jid, to_jid)
                .map(Stanza::Message)
                .map_err(|kind| StanzaBuildError::Stanza(kind, element)),
            _ => Err(StanzaBuildError::Stream(
                StreamErrorKind::UnsupportedStanzaType,
            )),
        }
    }

    fn is_valid_from(&self, from: &str) -> bool {
        let Ok(jid) = from.parse::<Jid>() else {
            return false;
        };
        let own = self.strm.jid();
        let mut valid = jid.node() == own.node() && jid.domain() == own.domain();
        if !jid.resource().is_empty() {
            valid = valid && jid.resource() == own.resource();
        }
        valid
    }

    async fn process_iq(&mut self, iq: Iq) {
        let to = iq.to_jid().clone();

        if to.is_full() {
            let recipients = self.registry.available_streams(to.node());
            let target = recipients
                .iter()
                .find(|stream| stream.resource() == to.resource());
            match target {
                Some(stream) => stream.send(iq.element().clone()),
                None => {
                    // absent user and absent resource answer alike
                    self.write_element(&iq.error_iq(StanzaErrorKind::ServiceUnavailable))
                        .await;
                }
            }
            return;
        }

        let handlers = self.iq_handlers.clone();
        if let Some(handler) = handlers.iter().find(|handler| handler.matches_iq(&iq)) {
            handler.process_iq(iq);
            return;
        }

        if iq.is_get() || iq.is_set() {
            self.write_element(&iq.error_iq(StanzaErrorKind::ServiceUnavailable))
                .await;
        }
    }

    async fn process_presence(&mut self, presence: Presence) {
        let to = presence.to_jid().clone();

        if to.is_full() {
            let recipients = self.registry.available_streams(to.node());
            if let Some(stream) = recipients
                .iter()
                .find(|stream| stream.resource() == to.resource())
            {
                stream.send(presence.element().clone());
            }
            return;
        }

        let own = self.strm.jid();
        if !to.node().is_empty() && (to.node() != own.node() || to.domain() != own.domain()) {
            self.roster.process_presence(presence);
            return;
        }

        // a presence addressed to ourselves updates availability
        let available = match presence.presence_type() {
            PresenceType::Available => Some(true),
            PresenceType::Unavailable => Some(false),
            _ => None,
        };
        self.strm.set_presence(
            available,
            presence.priority(),
            presence.children().to_vec(),
        );

        if !self.roster_started {
            self.roster_started = true;
            self.roster.deliver_pending_approval_notifications();
            self.roster.receive_presences();
        }
        self.roster.broadcast_presence(
            presence.from_jid().clone(),
            presence.presence_type(),
            presence.children().to_vec(),
        );

        if let Some(offline) = &self.offline {
            if !self.offline_delivered && self.strm.priority() >= 0 {
                self.offline_delivered = true;
                offline.deliver_offline_messages();
            }
        }
    }

    async fn process_message(&mut self, message: Message) {
        let to = message.to_jid().clone();
        let recipients = self.registry.available_streams(to.node());

        if recipients.is_empty() {
            match &self.offline {
                Some(offline) => offline.archive_message(message),
                None => debug!("dropping message for absent user without offline storage"),
            }
            return;
        }

        if to.is_full() {
            match recipients
                .iter()
                .find(|stream| stream.resource() == to.resource())
            {
                Some(stream) => stream.send(message.element().clone()),
                None => {
                    self.write_element(
                        &message.error_message(StanzaErrorKind::ServiceUnavailable),
                    )
                    .await;
                }
            }
            return;
        }

        // bare JID: deliver to the highest-priority resource
        let mut target = &recipients[0];
        let mut highest_priority = target.priority();
        for candidate in &recipients[1..] {
            if candidate.priority() > highest_priority {
                target = candidate;
                highest_priority = candidate.priority();
            }
        }
        target.send(message.element().clone());
    }

    fn restart(&mut self) {
        self.strm.set_phase(StreamPhase::Connecting);
        self.parser.reset();
    }

    async fn open_stream(&mut self) {
        let mut open = Element::new("stream:stream");
        open.set_attribute("xmlns", namespaces::XMPP_CLIENT);
        open.set_attribute("xmlns:stream", namespaces::XMPP_STREAMS);
        open.set_attribute("id", &Uuid::new_v4().to_string());
        open.set_attribute("from", &self.strm.domain());
        open.set_attribute("version", "1.0");

        let header = format!("<?xml version=\"1.0\"?>{}", open.open_tag_xml());
        self.write_raw(header.as_bytes()).await;
    }

    async fn write_element(&mut self, element: &Element) {
        debug!(element = %element, "SEND");
        self.write_raw(element.to_xml().as_bytes()).await;
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        // writes on a dying connection are swallowed
        if let Err(err) = self.transport.write(bytes).await {
            debug!("transport write failed: {err}");
        }
    }

    async fn disconnect_with_stream_error(&mut self, kind: StreamErrorKind) {
        if self.strm.phase() == StreamPhase::Connecting {
            self.open_stream().await;
        }
        self.write_element(&kind.element()).await;
        self.disconnect(true).await;
    }

    async fn disconnect(&mut self, close_stream: bool) {
        if self.strm.is_available() {
            self.roster.broadcast_presence(
                self.strm.jid(),
                PresenceType::Unavailable,
                Vec::new(),
            );
        }
        if close_stream {
            self.write_raw(b"</stream:stream>").await;
        }
        self.transport.close().await;
        self.strm.set_phase(StreamPhase::Disconnected);
        self.registry.unregister_stream(&self.strm);
        info!(id = self.strm.id(), "disconnected stream");
    }
}

/// The `<stream:features/>` advertised on every stream (re)open, per the
/// negotiation state.
fn build_features(
    cfg: &ServerSettings,
    authenticators: &[Authenticator],
    secured: bool,
    authenticated: bool,
    compressed: bool,
) -> Element {
    let mut features = Element::new("stream:features");
    features.set_attribute("xmlns:stream", namespaces::XMPP_STREAMS);
    features.set_attribute("version", "1.0");

    if !authenticated {
        let tls_enabled = cfg.tls.is_some();
        let tls_required = cfg.tls.as_ref().is_some_and(|tls| tls.required);

        if !secured && tls_enabled {
            let mut starttls = Element::new_ns("starttls", namespaces::XMPP_STARTTLS);
            if tls_required {
                starttls.add_child(Element::new("required"));
            }
            features.add_child(starttls);
        }

        let should_offer_sasl = !tls_enabled || !tls_required || secured;
        if should_offer_sasl && !authenticators.is_empty() {
            let mut mechanisms = Element::new_ns("mechanisms", namespaces::XMPP_SASL);
            for authenticator in authenticators {
                // channel-binding mechanisms are meaningless on plaintext
                if authenticator.uses_channel_binding() && !secured {
                    continue;
                }
                let mut mechanism = Element::new("mechanism");
                mechanism.set_text(authenticator.mechanism());
                mechanisms.add_child(mechanism);
            }
            features.add_child(mechanisms);
        }

        let allow_registration = !tls_enabled || secured;
        if cfg.modules.contains("registration") && allow_registration {
            features.add_child(Element::new_ns("register", namespaces::REGISTER_FEATURE));
        }
    } else {
        if !compressed && cfg.compression.is_some() {
            let mut compression = Element::new_ns("compression", namespaces::COMPRESS_FEATURE);
            compression.with_child("method", None, |method| method.set_text("zlib"));
            features.add_child(compression);
        }
        features.add_child(Element::new_ns("session", namespaces::XMPP_SESSION));
        features.add_child(Element::new_ns("bind", namespaces::XMPP_BIND));
    }

    features
}
