use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use warbler_core::xml::Element;

pub use self::fake::FakeStoreBackend;
pub use self::sql::SqlStoreBackend;

pub mod fake;
pub mod sql;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    From,
    To,
    Both,
    /// A transient write intent on roster pushes; never a stored value.
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::From => "from",
            Subscription::To => "to",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Subscription::None),
            "from" => Some(Subscription::From),
            "to" => Some(Subscription::To),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }
}

/// One contact entry in a user's roster; keyed by `(username, contact)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub username: String,
    pub contact: String,
    pub name: String,
    pub subscription: Subscription,
    pub ask: bool,
    pub groups: Vec<String>,
}

/// An archived inbound `subscribe` presence awaiting the contact's
/// approval; keyed by `(username, contact)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterNotification {
    pub username: String,
    pub contact: String,
    pub elements: Vec<Element>,
}

enum Query {
    UserExists {
        username: String,
        result_tx: oneshot::Sender<Result<bool, Error>>,
    },
    FetchUser {
        username: String,
        result_tx: oneshot::Sender<Result<Option<User>, Error>>,
    },
    FetchRosterItems {
        username: String,
        result_tx: oneshot::Sender<Result<Vec<RosterItem>, Error>>,
    },
    FetchRosterItemsAsContact {
        contact: String,
        result_tx: oneshot::Sender<Result<Vec<RosterItem>, Error>>,
    },
    FetchRosterItem {
        username: String,
        contact: String,
        result_tx: oneshot::Sender<Result<Option<RosterItem>, Error>>,
    },
    FetchRosterNotifications {
        username: String,
        result_tx: oneshot::Sender<Result<Vec<RosterNotification>, Error>>,
    },
    CountOfflineMessages {
        username: String,
        result_tx: oneshot::Sender<Result<usize, Error>>,
    },
    FetchOfflineMessages {
        username: String,
        result_tx: oneshot::Sender<Result<Vec<Element>, Error>>,
    },
    FetchPrivateElements {
        username: String,
        namespace: String,
        result_tx: oneshot::Sender<Result<Option<Vec<Element>>, Error>>,
    },
    FetchVcard {
        username: String,
        result_tx: oneshot::Sender<Result<Option<Element>, Error>>,
    },
}

enum Command {
    InsertOrUpdateUser {
        user: User,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteUser {
        username: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    InsertOrUpdateRosterItem {
        item: RosterItem,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteRosterItem {
        username: String,
        contact: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    InsertOrUpdateRosterNotification {
        notification: RosterNotification,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteRosterNotification {
        username: String,
        contact: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    InsertOfflineMessage {
        username: String,
        message: Element,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteOfflineMessages {
        username: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    SetPrivateElements {
        username: String,
        namespace: String,
        elements: Vec<Element>,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    SetVcard {
        username: String,
        vcard: Element,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

/// Persistence operations a backend must provide. Backends are driven by a
/// single store task, so writes never race each other.
pub trait StoreBackend {
    fn user_exists(&self, username: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    fn fetch_user(&self, username: &str)
        -> impl Future<Output = Result<Option<User>, Error>> + Send;

    fn insert_or_update_user(&mut self, user: User)
        -> impl Future<Output = Result<(), Error>> + Send;

    fn delete_user(&mut self, username: &str) -> impl Future<Output = Result<(), Error>> + Send;

    fn fetch_roster_items(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Vec<RosterItem>, Error>> + Send;

    fn fetch_roster_items_as_contact(
        &self,
        contact: &str,
    ) -> impl Future<Output = Result<Vec<RosterItem>, Error>> + Send;

    fn fetch_roster_item(
        &self,
        username: &str,
        contact: &str,
    ) -> impl Future<Output = Result<Option<RosterItem>, Error>> + Send;

    fn insert_or_update_roster_item(
        &mut self,
        item: RosterItem,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete_roster_item(
        &mut self,
        username: &str,
        contact: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn fetch_roster_notifications(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Vec<RosterNotification>, Error>> + Send;

    fn insert_or_update_roster_notification(
        &mut self,
        notification: RosterNotification,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete_roster_notification(
        &mut self,
        username: &str,
        contact: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn count_offline_messages(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    fn insert_offline_message(
        &mut self,
        username: &str,
        message: Element,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn fetch_offline_messages(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Vec<Element>, Error>> + Send;

    fn delete_offline_messages(
        &mut self,
        username: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn fetch_private_elements(
        &self,
        username: &str,
        namespace: &str,
    ) -> impl Future<Output = Result<Option<Vec<Element>>, Error>> + Send;

    fn set_private_elements(
        &mut self,
        username: &str,
        namespace: &str,
        elements: Vec<Element>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn fetch_vcard(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<Element>, Error>> + Send;

    fn set_vcard(
        &mut self,
        username: &str,
        vcard: Element,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

struct Store<B>
where
    B: StoreBackend,
{
    queries: mpsc::Receiver<Query>,
    commands: mpsc::Receiver<Command>,
    backend: B,
}

impl<B> Store<B>
where
    B: StoreBackend,
{
    async fn run(&mut self) {
        loop {
            select! {
                Some(query) = self.queries.recv() => {
                    self.handle_query(query).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                else => break,
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::UserExists {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.user_exists(&username).await);
            }
            Query::FetchUser {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_user(&username).await);
            }
            Query::FetchRosterItems {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_roster_items(&username).await);
            }
            Query::FetchRosterItemsAsContact { contact, result_tx } => {
                let _ = result_tx.send(self.backend.fetch_roster_items_as_contact(&contact).await);
            }
            Query::FetchRosterItem {
                username,
                contact,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_roster_item(&username, &contact).await);
            }
            Query::FetchRosterNotifications {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_roster_notifications(&username).await);
            }
            Query::CountOfflineMessages {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.count_offline_messages(&username).await);
            }
            Query::FetchOfflineMessages {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_offline_messages(&username).await);
            }
            Query::FetchPrivateElements {
                username,
                namespace,
                result_tx,
            } => {
                let _ = result_tx.send(
                    self.backend
                        .fetch_private_elements(&username, &namespace)
                        .await,
                );
            }
            Query::FetchVcard {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.fetch_vcard(&username).await);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::InsertOrUpdateUser { user, result_tx } => {
                let _ = result_tx.send(self.backend.insert_or_update_user(user).await);
            }
            Command::DeleteUser {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.delete_user(&username).await);
            }
            Command::InsertOrUpdateRosterItem { item, result_tx } => {
                let _ = result_tx.send(self.backend.insert_or_update_roster_item(item).await);
            }
            Command::DeleteRosterItem {
                username,
                contact,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.delete_roster_item(&username, &contact).await);
            }
            Command::InsertOrUpdateRosterNotification {
                notification,
                result_tx,
            } => {
                let _ = result_tx.send(
                    self.backend
                        .insert_or_update_roster_notification(notification)
                        .await,
                );
            }
            Command::DeleteRosterNotification {
                username,
                contact,
                result_tx,
            } => {
                let _ = result_tx.send(
                    self.backend
                        .delete_roster_notification(&username, &contact)
                        .await,
                );
            }
            Command::InsertOfflineMessage {
                username,
                message,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.insert_offline_message(&username, message).await);
            }
            Command::DeleteOfflineMessages {
                username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.delete_offline_messages(&username).await);
            }
            Command::SetPrivateElements {
                username,
                namespace,
                elements,
                result_tx,
            } => {
                let _ = result_tx.send(
                    self.backend
                        .set_private_elements(&username, &namespace, elements)
                        .await,
                );
            }
            Command::SetVcard {
                username,
                vcard,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.set_vcard(&username, vcard).await);
            }
        }
    }
}

/// Cloneable handle to the store task. All persistence used by the server
/// goes through this type.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    queries: mpsc::Sender<Query>,
    commands: mpsc::Sender<Command>,
}

const STORE_CHANNEL_BUFFER_SIZE: usize = 64;

impl StoreHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: StoreBackend + Send + 'static,
    {
        let (queries_tx, queries_rx) = mpsc::channel(STORE_CHANNEL_BUFFER_SIZE);
        let (commands_tx, commands_rx) = mpsc::channel(STORE_CHANNEL_BUFFER_SIZE);
        let mut store = Store {
            queries: queries_rx,
            commands: commands_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        StoreHandle {
            queries: queries_tx,
            commands: commands_tx,
        }
    }

    async fn query<T>(
        &self,
        result_rx: oneshot::Receiver<Result<T, Error>>,
        query: Query,
    ) -> Result<T, Error> {
        let _ = self.queries.send(query).await;
        result_rx
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("store is gone")))
    }

    async fn command(
        &self,
        result_rx: oneshot::Receiver<Result<(), Error>>,
        command: Command,
    ) -> Result<(), Error> {
        let _ = self.commands.send(command).await;
        result_rx
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("store is gone")))
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::UserExists {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_user(&self, username: &str) -> Result<Option<User>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchUser {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn insert_or_update_user(&self, user: User) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(result_rx, Command::InsertOrUpdateUser { user, result_tx })
            .await
    }

    pub async fn delete_user(&self, username: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::DeleteUser {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchRosterItems {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_roster_items_as_contact(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterItem>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchRosterItemsAsContact {
                contact: contact.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_roster_item(
        &self,
        username: &str,
        contact: &str,
    ) -> Result<Option<RosterItem>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchRosterItem {
                username: username.to_string(),
                contact: contact.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn insert_or_update_roster_item(&self, item: RosterItem) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::InsertOrUpdateRosterItem { item, result_tx },
        )
        .await
    }

    pub async fn delete_roster_item(&self, username: &str, contact: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::DeleteRosterItem {
                username: username.to_string(),
                contact: contact.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_roster_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<RosterNotification>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchRosterNotifications {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn insert_or_update_roster_notification(
        &self,
        notification: RosterNotification,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::InsertOrUpdateRosterNotification {
                notification,
                result_tx,
            },
        )
        .await
    }

    pub async fn delete_roster_notification(
        &self,
        username: &str,
        contact: &str,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::DeleteRosterNotification {
                username: username.to_string(),
                contact: contact.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn count_offline_messages(&self, username: &str) -> Result<usize, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::CountOfflineMessages {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn insert_offline_message(
        &self,
        username: &str,
        message: Element,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::InsertOfflineMessage {
                username: username.to_string(),
                message,
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchOfflineMessages {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn delete_offline_messages(&self, username: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::DeleteOfflineMessages {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_private_elements(
        &self,
        username: &str,
        namespace: &str,
    ) -> Result<Option<Vec<Element>>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchPrivateElements {
                username: username.to_string(),
                namespace: namespace.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn set_private_elements(
        &self,
        username: &str,
        namespace: &str,
        elements: Vec<Element>,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::SetPrivateElements {
                username: username.to_string(),
                namespace: namespace.to_string(),
                elements,
                result_tx,
            },
        )
        .await
    }

    pub async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.query(
            result_rx,
            Query::FetchVcard {
                username: username.to_string(),
                result_tx,
            },
        )
        .await
    }

    pub async fn set_vcard(&self, username: &str, vcard: Element) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(
            result_rx,
            Command::SetVcard {
                username: username.to_string(),
                vcard,
                result_tx,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_users_through_the_fake_backend() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        assert!(!store.user_exists("alice").await.unwrap());

        store
            .insert_or_update_user(User {
                username: "alice".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();

        assert!(store.user_exists("alice").await.unwrap());
        let user = store.fetch_user("alice").await.unwrap().unwrap();
        assert_eq!(user.password, "secret");

        store.delete_user("alice").await.unwrap();
        assert!(store.fetch_user("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roster_items_are_keyed_by_user_and_contact() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        let mut item = RosterItem {
            username: "alice".to_string(),
            contact: "bob".to_string(),
            name: String::new(),
            subscription: Subscription::None,
            ask: true,
            groups: vec![],
        };
        store.insert_or_update_roster_item(item.clone()).await.unwrap();

        item.subscription = Subscription::To;
        item.ask = false;
        store.insert_or_update_roster_item(item.clone()).await.unwrap();

        let fetched = store
            .fetch_roster_item("alice", "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.subscription, Subscription::To);
        assert!(!fetched.ask);
        assert_eq!(store.fetch_roster_items("alice").await.unwrap().len(), 1);
        assert_eq!(
            store
                .fetch_roster_items_as_contact("bob")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn offline_messages_keep_insertion_order() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        for i in 0..3 {
            let mut message = Element::new("message");
            message.set_attribute("id", &i.to_string());
            store.insert_offline_message("carol", message).await.unwrap();
        }

        assert_eq!(store.count_offline_messages("carol").await.unwrap(), 3);
        let messages = store.fetch_offline_messages("carol").await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id().unwrap()).collect();
        assert_eq!(ids, ["0", "1", "2"]);

        store.delete_offline_messages("carol").await.unwrap();
        assert_eq!(store.count_offline_messages("carol").await.unwrap(), 0);
    }
}
