use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::info;

use warbler_core::xml::Element;
use warbler_core::xmpp::jid::Jid;
use warbler_core::xmpp::stream_error::StreamErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamPhase {
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    SessionStarted,
    Disconnected,
}

#[derive(Debug)]
struct StreamState {
    domain: String,
    username: String,
    resource: String,
    jid: Jid,
    phase: StreamPhase,
    secured: bool,
    authenticated: bool,
    compressed: bool,
    available: bool,
    roster_requested: bool,
    priority: i8,
    presence_children: Vec<Element>,
}

/// Receiving ends of a stream's mailboxes, owned by its session task.
pub struct StreamMailbox {
    pub elements: mpsc::UnboundedReceiver<Element>,
    pub disconnects: mpsc::UnboundedReceiver<Option<StreamErrorKind>>,
}

/// The capability object handed to modules and stored in the registry:
/// read/write access to the shared per-stream state, plus the element and
/// disconnect mailboxes. Sending to a closed mailbox is a tolerated no-op.
#[derive(Clone)]
pub struct StreamHandle {
    id: Arc<str>,
    state: Arc<RwLock<StreamState>>,
    element_tx: mpsc::UnboundedSender<Element>,
    disconnect_tx: mpsc::UnboundedSender<Option<StreamErrorKind>>,
}

impl StreamHandle {
    pub fn channel(id: &str, domain: &str) -> (Self, StreamMailbox) {
        let (element_tx, element_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let state = StreamState {
            domain: domain.to_string(),
            username: String::new(),
            resource: String::new(),
            jid: Jid::server(domain),
            phase: StreamPhase::Connecting,
            secured: false,
            authenticated: false,
            compressed: false,
            available: false,
            roster_requested: false,
            priority: 0,
            presence_children: Vec::new(),
        };
        let handle = Self {
            id: id.into(),
            state: Arc::new(RwLock::new(state)),
            element_tx,
            disconnect_tx,
        };
        let mailbox = StreamMailbox {
            elements: element_rx,
            disconnects: disconnect_rx,
        };
        (handle, mailbox)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain(&self) -> String {
        self.state.read().unwrap().domain.clone()
    }

    pub fn username(&self) -> String {
        self.state.read().unwrap().username.clone()
    }

    pub fn resource(&self) -> String {
        self.state.read().unwrap().resource.clone()
    }

    pub fn jid(&self) -> Jid {
        self.state.read().unwrap().jid.clone()
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.read().unwrap().phase
    }

    pub fn priority(&self) -> i8 {
        self.state.read().unwrap().priority
    }

    pub fn is_secured(&self) -> bool {
        self.state.read().unwrap().secured
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().unwrap().authenticated
    }

    pub fn is_compressed(&self) -> bool {
        self.state.read().unwrap().compressed
    }

    pub fn is_available(&self) -> bool {
        self.state.read().unwrap().available
    }

    pub fn is_roster_requested(&self) -> bool {
        self.state.read().unwrap().roster_requested
    }

    pub fn presence_children(&self) -> Vec<Element> {
        self.state.read().unwrap().presence_children.clone()
    }

    pub fn set_phase(&self, phase: StreamPhase) {
        self.state.write().unwrap().phase = phase;
    }

    pub fn set_domain(&self, domain: &str) {
        let mut state = self.state.write().unwrap();
        state.domain = domain.to_string();
        state.jid = if !state.authenticated {
            Jid::server(domain)
        } else if state.resource.is_empty() {
            Jid::bare(&state.username, domain)
        } else {
            Jid::full(&state.username, domain, &state.resource)
        };
    }

    pub fn set_secured(&self) {
        self.state.write().unwrap().secured = true;
    }

    pub fn set_compressed(&self) {
        self.state.write().unwrap().compressed = true;
    }

    pub fn set_roster_requested(&self) {
        self.state.write().unwrap().roster_requested = true;
    }

    /// Marks the stream authenticated and rewrites its JID to the bare JID
    /// of the now-known user.
    pub fn set_authenticated(&self, username: &str) {
        let mut state = self.state.write().unwrap();
        state.username = username.to_string();
        state.authenticated = true;
        state.phase = StreamPhase::Authenticated;
        state.jid = Jid::bare(username, &state.domain);
    }

    pub fn bind_resource(&self, resource: &str) {
        let mut state = self.state.write().unwrap();
        state.resource = resource.to_string();
        state.jid = Jid::full(&state.username, &state.domain, resource);
    }

    pub fn set_presence(&self, available: Option<bool>, priority: i8, children: Vec<Element>) {
        let mut state = self.state.write().unwrap();
        state.priority = priority;
        if let Some(available) = available {
            state.available = available;
            state.presence_children = if available { children } else { Vec::new() };
        }
    }

    pub fn send(&self, element: Element) {
        let _ = self.element_tx.send(element);
    }

    pub fn disconnect(&self, error: Option<StreamErrorKind>) {
        let _ = self.disconnect_tx.send(error);
    }
}

/// The process-wide index of live streams: every stream by connection id,
/// and authenticated streams by username in authentication order.
pub struct SessionRegistry {
    domains: Vec<String>,
    inner: Mutex<Inner>,
}

struct Inner {
    streams_by_id: HashMap<String, StreamHandle>,
    authenticated_by_user: HashMap<String, Vec<StreamHandle>>,
}

impl SessionRegistry {
    pub fn new(domains: Vec<String>) -> Self {
        debug_assert!(!domains.is_empty());
        Self {
            domains,
            inner: Mutex::new(Inner {
                streams_by_id: HashMap::new(),
                authenticated_by_user: HashMap::new(),
            }),
        }
    }

    pub fn default_domain(&self) -> &str {
        &self.domains[0]
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|local| local == domain)
    }

    pub fn register_stream(&self, stream: &StreamHandle) {
        info!(id = stream.id(), "registered stream");
        let mut inner = self.inner.lock().unwrap();
        inner
            .streams_by_id
            .insert(stream.id().to_string(), stream.clone());
    }

    pub fn authenticate_stream(&self, stream: &StreamHandle) {
        let username = stream.username();
        info!(id = stream.id(), username = %username, "authenticated stream");
        let mut inner = self.inner.lock().unwrap();
        inner
            .authenticated_by_user
            .entry(username)
            .or_default()
            .push(stream.clone());
    }

    pub fn unregister_stream(&self, stream: &StreamHandle) {
        info!(id = stream.id(), "unregistered stream");
        let mut inner = self.inner.lock().unwrap();
        inner.streams_by_id.remove(stream.id());

        let username = stream.username();
        if let Some(streams) = inner.authenticated_by_user.get_mut(&username) {
            streams.retain(|candidate| candidate.id() != stream.id());
            if streams.is_empty() {
                inner.authenticated_by_user.remove(&username);
            }
        }
    }

    /// A snapshot of the user's authenticated streams, in authentication
    /// order. Iterating the snapshot never observes later mutations.
    pub fn available_streams(&self, username: &str) -> Vec<StreamHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .authenticated_by_user
            .get(username)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authed_stream(registry: &SessionRegistry, id: &str, username: &str) -> StreamHandle {
        let (handle, _mailbox) = StreamHandle::channel(id, "localhost");
        handle.set_authenticated(username);
        registry.register_stream(&handle);
        registry.authenticate_stream(&handle);
        handle
    }

    #[test]
    fn authenticated_streams_keep_authentication_order() {
        let registry = SessionRegistry::new(vec!["localhost".to_string()]);
        authed_stream(&registry, "c1", "alice");
        authed_stream(&registry, "c2", "alice");
        authed_stream(&registry, "c3", "alice");

        let ids: Vec<_> = registry
            .available_streams("alice")
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, ["c1", "c2", "c3"]);
    }

    #[test]
    fn unregister_preserves_relative_order_and_is_idempotent() {
        let registry = SessionRegistry::new(vec!["localhost".to_string()]);
        authed_stream(&registry, "c1", "alice");
        let second = authed_stream(&registry, "c2", "alice");
        authed_stream(&registry, "c3", "alice");

        registry.unregister_stream(&second);
        registry.unregister_stream(&second);

        let ids: Vec<_> = registry
            .available_streams("alice")
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, ["c1", "c3"]);
    }

    #[test]
    fn snapshot_does_not_observe_later_mutations() {
        let registry = SessionRegistry::new(vec!["localhost".to_string()]);
        let first = authed_stream(&registry, "c1", "alice");
        let snapshot = registry.available_streams("alice");

        registry.unregister_stream(&first);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.available_streams("alice").is_empty());
    }

    #[test]
    fn local_domains_come_from_configuration() {
        let registry =
            SessionRegistry::new(vec!["localhost".to_string(), "warbler.im".to_string()]);
        assert_eq!(registry.default_domain(), "localhost");
        assert!(registry.is_local_domain("warbler.im"));
        assert!(!registry.is_local_domain("example.com"));
    }

    #[test]
    fn bind_resource_yields_a_full_jid() {
        let (handle, _mailbox) = StreamHandle::channel("c1", "localhost");
        handle.set_authenticated("alice");
        assert_eq!(handle.jid().to_string(), "alice@localhost");

        handle.bind_resource("phone");
        assert_eq!(handle.jid().to_string(), "alice@localhost/phone");
        assert_eq!(handle.resource(), "phone");
    }

    #[test]
    fn unavailable_presence_clears_presence_children() {
        let (handle, _mailbox) = StreamHandle::channel("c1", "localhost");
        handle.set_presence(Some(true), 5, vec![Element::new("show")]);
        assert!(handle.is_available());
        assert_eq!(handle.priority(), 5);
        assert_eq!(handle.presence_children().len(), 1);

        handle.set_presence(Some(false), 5, Vec::new());
        assert!(!handle.is_available());
        assert!(handle.presence_children().is_empty());
    }
}
