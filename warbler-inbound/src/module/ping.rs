use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::info;
use uuid::Uuid;

use warbler_backend::settings::PingSettings;
use warbler_core::xml::{namespaces, Element};
use warbler_core::xmpp::stanza::{Iq, IqType};
use warbler_core::xmpp::stanza_error::StanzaErrorKind;
use warbler_core::xmpp::stream_error::StreamErrorKind;
use warbler_services::registry::StreamHandle;

use super::IqHandler;

enum PingEvent {
    Activity,
    Pong,
}

/// XEP-0199 ping. Answers client pings, and when sending is enabled probes
/// idle clients: a ping goes out after `send_interval` seconds of silence,
/// and a missing pong within another interval tears the stream down.
pub struct Ping {
    cfg: PingSettings,
    strm: StreamHandle,
    ping_id: Arc<Mutex<Option<String>>>,
    events_tx: mpsc::UnboundedSender<PingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PingEvent>>>,
    started: AtomicBool,
}

impl Ping {
    pub fn new(cfg: PingSettings, strm: StreamHandle) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            strm,
            ping_id: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            started: AtomicBool::new(false),
        }
    }

    /// Arms the ping timer once the session is established.
    pub fn start_pinging(&self) {
        if !self.cfg.send || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut events_rx) = self.events_rx.lock().unwrap().take() else {
            return;
        };

        let strm = self.strm.clone();
        let ping_id = self.ping_id.clone();
        let interval = Duration::from_secs(self.cfg.send_interval);

        tokio::spawn(async move {
            let mut deadline = Instant::now() + interval;
            let mut waiting_pong = false;
            loop {
                select! {
                    _ = sleep_until(deadline) => {
                        if waiting_pong {
                            info!("ping timeout; disconnecting stream");
                            strm.disconnect(Some(StreamErrorKind::ConnectionTimeout));
                            return;
                        }
                        let id = Uuid::new_v4().to_string();
                        *ping_id.lock().unwrap() = Some(id.clone());

                        let mut iq = Iq::build(&id, IqType::Get);
                        iq.set_attribute("to", &strm.jid().to_string());
                        iq.add_child(Element::new_ns("ping", namespaces::PING));
                        strm.send(iq);

                        waiting_pong = true;
                        deadline = Instant::now() + interval;
                    }
                    event = events_rx.recv() => {
                        match event {
                            Some(PingEvent::Activity) => {
                                if !waiting_pong {
                                    deadline = Instant::now() + interval;
                                }
                            }
                            Some(PingEvent::Pong) => {
                                waiting_pong = false;
                                deadline = Instant::now() + interval;
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    /// Any received stanza postpones the next ping.
    pub fn reset_deadline(&self) {
        if !self.cfg.send {
            return;
        }
        let _ = self.events_tx.send(PingEvent::Activity);
    }

    fn is_pong_iq(&self, iq: &Iq) -> bool {
        let ping_id = self.ping_id.lock().unwrap();
        ping_id.as_deref() == Some(iq.id()) && (iq.is_result() || iq.is_error())
    }
}

impl IqHandler for Ping {
    fn associated_namespaces(&self) -> Vec<&'static str> {
        vec![namespaces::PING]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        self.is_pong_iq(iq) || iq.find_child_ns("ping", namespaces::PING).is_some()
    }

    fn process_iq(&self, iq: Iq) {
        if self.is_pong_iq(&iq) {
            *self.ping_id.lock().unwrap() = None;
            let _ = self.events_tx.send(PingEvent::Pong);
            return;
        }
        let to = iq.to_jid();
        if to.is_bare() && to.node() != self.strm.username() {
            self.strm.send(iq.error_iq(StanzaErrorKind::Forbidden));
            return;
        }
        let Some(ping) = iq.find_child_ns("ping", namespaces::PING) else {
            return;
        };
        if ping.children_count() > 0 {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
            return;
        }
        if iq.is_get() {
            self.strm.send(iq.result_iq());
        } else {
            self.strm.send(iq.error_iq(StanzaErrorKind::BadRequest));
        }
    }
}

#[cfg(test)]
mod tests {
    use warbler_core::xml::parser::parse_standalone;
    use warbler_core::xmpp::jid::Jid;

    use super::*;

    fn stream() -> (StreamHandle, warbler_services::registry::StreamMailbox) {
        let (handle, mailbox) = StreamHandle::channel("c1", "localhost");
        handle.set_authenticated("alice");
        handle.bind_resource("phone");
        (handle, mailbox)
    }

    fn pong_for(ping: &Element) -> Iq {
        let xml = format!(r#"<iq id="{}" type="result"/>"#, ping.id().unwrap());
        Iq::from_element(
            parse_standalone(&xml).unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "localhost".parse::<Jid>().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn a_missing_pong_disconnects_with_connection_timeout() {
        let (handle, mut mailbox) = stream();
        let ping = Ping::new(
            PingSettings {
                send: true,
                send_interval: 3,
            },
            handle,
        );
        ping.start_pinging();

        let sent = mailbox.elements.recv().await.unwrap();
        assert_eq!(sent.stanza_type(), Some("get"));
        assert!(sent.find_child_ns("ping", namespaces::PING).is_some());

        let reason = mailbox.disconnects.recv().await.unwrap();
        assert_eq!(reason, Some(StreamErrorKind::ConnectionTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn a_pong_keeps_the_stream_alive() {
        let (handle, mut mailbox) = stream();
        let ping = Ping::new(
            PingSettings {
                send: true,
                send_interval: 3,
            },
            handle,
        );
        ping.start_pinging();

        let sent = mailbox.elements.recv().await.unwrap();
        ping.process_iq(pong_for(&sent));

        // the next timer firing sends another ping instead of disconnecting
        let next = mailbox.elements.recv().await.unwrap();
        assert!(next.find_child_ns("ping", namespaces::PING).is_some());
        assert!(mailbox.disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn answers_client_pings_and_rejects_foreign_targets() {
        let (handle, mut mailbox) = stream();
        let ping = Ping::new(PingSettings::default(), handle);

        let iq = Iq::from_element(
            parse_standalone(r#"<iq id="p1" type="get"><ping xmlns="urn:xmpp:ping"/></iq>"#)
                .unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "localhost".parse::<Jid>().unwrap(),
        )
        .unwrap();
        assert!(ping.matches_iq(&iq));
        ping.process_iq(iq);
        let reply = mailbox.elements.try_recv().unwrap();
        assert_eq!(reply.stanza_type(), Some("result"));
        assert_eq!(reply.id(), Some("p1"));

        let foreign = Iq::from_element(
            parse_standalone(r#"<iq id="p2" type="get"><ping xmlns="urn:xmpp:ping"/></iq>"#)
                .unwrap(),
            "alice@localhost/phone".parse::<Jid>().unwrap(),
            "bob@localhost".parse::<Jid>().unwrap(),
        )
        .unwrap();
        ping.process_iq(foreign);
        let reply = mailbox.elements.try_recv().unwrap();
        assert_eq!(reply.stanza_type(), Some("error"));
        assert!(reply
            .find_child("error")
            .unwrap()
            .find_child("forbidden")
            .is_some());
    }
}
