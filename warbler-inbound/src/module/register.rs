use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use warbler_backend::settings::RegistrationSettings;
use warbler_backend::store::{StoreHandle, User};
use warbler_core::concurrent::OperationQueue;
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::jid::Jid;
use warbler_core::xmpp::stanza::Iq;
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

const REGISTER_QUEUE_SIZE: usize = 32;

/// XEP-0077 in-band registration. Reachable before authentication for
/// signup, and after for password changes and cancellation.
pub struct Register {
    queue: OperationQueue,
    ctx: RegisterCtx,
}

#[derive(Clone)]
struct RegisterCtx {
    cfg: RegistrationSettings,
    strm: StreamHandle,
    store: StoreHandle,
    registered: Arc<AtomicBool>,
}

impl Register {
    pub fn new(cfg: RegistrationSettings, strm: StreamHandle, store: StoreHandle) -> Self {
        Self {
            queue: OperationQueue::new(REGISTER_QUEUE_SIZE, None),
            ctx: RegisterCtx {
                cfg,
                strm,
                store,
                registered: Arc::new(AtomicBool::new(false)),
            },
        }
    }
}

impl IqHandler for Register {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::REGISTER]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.find_child_ns("query", namespaces::REGISTER).is_some()
    }

    fn process_iq(&self, iq: Iq) {
        let ctx = self.ctx.clone();
        let _ = self.queue.enqueue(move || async move {
            ctx.process_iq(&iq).await;
        });
    }
}

impl RegisterCtx {
    async fn process_iq(&self, iq: &Iq) {
        if !self.is_valid_to_jid(iq.to_jid()) {
            self.strm.send(iq.error_iq(StanzaErrorKind::Forbidden));
            return;
        }
        let Some(query) = iq.find_child_ns("query", namespaces::REGISTER) else {
            return;
        };

        if !self.strm.is_authenticated() {
            if iq.is_get() {
                self.send_registration_fields(iq, query);
            } else if iq.is_set() {
                if self.registered.load(Ordering::SeqCst) {
                    // one registration per connection
                    self.strm.send(iq.error_iq(StanzaErrorKind::NotAcceptable));
                } else {
                    self.register_new_user(iq, query).await;
                }
            } else {
                self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            }
        } else if iq.is_set() {
            if query.find_child("remove").is_some() {
                self.cancel_registration(iq, query).await;
            } else {
                let username = query.find_child("username");
                let password = query.find_child("password");
                match (username, password) {
                    (Some(username), Some(password)) => {
                        self.change_password(iq, username.text(), password.text()).await;
                    }
                    _ => self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest)),
                }
            }
        } else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
        }
    }

    fn send_registration_fields(&self, iq: &Iq, query: &Element) {
        if query.children_count() > 0 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        let mut result = iq.result_iq();
        let mut fields = Element::new_ns("query", namespaces::REGISTER);
        fields.add_child(Element::new("username"));
        fields.add_child(Element::new("password"));
        result.add_child(fields);
        self.strm.send(result);
    }

    async fn register_new_user(&self, iq: &Iq, query: &Element) {
        if !self.cfg.allow_registration {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAllowed));
            return;
        }
        let username = query.find_child("username").map(Element::text);
        let password = query.find_child("password").map(Element::text);
        let (Some(username), Some(password)) = (username, password) else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        };
        if username.is_empty() || password.is_empty() {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }

        match self.store.user_exists(username).await {
            Ok(true) => {
                self.strm.send(iq.error_iq(StanzaErrorKind::Conflict));
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!("user lookup failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                return;
            }
        }

        let user = User {
            username: username.to_lowercase(),
            password: password.to_string(),
        };
        if let Err(err) = self.store.insert_or_update_user(user).await {
            error!("user registration failed: {err}");
            self.strm
                .send(iq.error_iq(StanzaErrorKind::InternalServerError));
            return;
        }
        info!(username, "registered new user");
        self.strm.send(iq.result_iq());
        self.registered.store(true, Ordering::SeqCst);
    }

    async fn cancel_registration(&self, iq: &Iq, query: &Element) {
        if !self.cfg.allow_cancel {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAllowed));
            return;
        }
        if query.children_count() > 1 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        if let Err(err) = self.store.delete_user(&self.strm.username()).await {
            error!("user cancellation failed: {err}");
            self.strm
                .send(iq.error_iq(StanzaErrorKind::InternalServerError));
            return;
        }
        self.strm.send(iq.result_iq());
    }

    async fn change_password(&self, iq: &Iq, username: &str, password: &str) {
        if !self.cfg.allow_change {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAllowed));
            return;
        }
        if username != self.strm.username() {
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAllowed));
            return;
        }
        if !self.strm.is_secured() {
            // the channel is not safe enough for a password change
            self.strm.send(iq.error_iq(StanzaErrorKind::NotAuthorized));
            return;
        }

        let user = match self.store.fetch_user(username).await {
            Ok(user) => user,
            Err(err) => {
                error!("user lookup failed: {err}");
                self.strm
                    .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                return;
            }
        };
        match user {
            Some(user) if user.password == password => {
                // nothing to do
                self.strm.send(iq.result_iq());
            }
            Some(mut user) => {
                user.password = password.to_string();
                if let Err(err) = self.store.insert_or_update_user(user).await {
                    error!("password change failed: {err}");
                    self.strm
                        .send(iq.error_iq(StanzaErrorKind::InternalServerError));
                    return;
                }
                self.strm.send(iq.result_iq());
            }
            None => self.strm.send(iq.result_iq()),
        }
    }

    fn is_valid_to_jid(&self, jid: &Jid) -> bool {
        if self.strm.is_authenticated() {
            jid.is_server()
        } else {
            jid.is_server() || (jid.is_bare() && jid.node() == self.strm.username())
        }
    }
}
