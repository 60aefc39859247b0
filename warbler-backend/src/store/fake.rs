use std::collections::HashMap;

use anyhow::Error;

use warbler_core::xml::Element;

use super::{RosterItem, RosterNotification, StoreBackend, User};

/// In-memory backend for tests. State lives in plain maps; the store task
/// serializes access.
#[derive(Default)]
pub struct FakeStoreBackend {
    pub users: HashMap<String, User>,
    pub roster_items: HashMap<(String, String), RosterItem>,
    pub roster_notifications: HashMap<(String, String), RosterNotification>,
    pub offline_messages: HashMap<String, Vec<Element>>,
    pub private_elements: HashMap<(String, String), Vec<Element>>,
    pub vcards: HashMap<String, Element>,
}

impl StoreBackend for FakeStoreBackend {
    async fn user_exists(&self, username: &str) -> Result<bool, Error> {
        Ok(self.users.contains_key(username))
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, Error> {
        Ok(self.users.get(username).cloned())
    }

    async fn insert_or_update_user(&mut self, user: User) -> Result<(), Error> {
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn delete_user(&mut self, username: &str) -> Result<(), Error> {
        self.users.remove(username);
        Ok(())
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, Error> {
        let mut items: Vec<_> = self
            .roster_items
            .values()
            .filter(|item| item.username == username)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.contact.cmp(&b.contact));
        Ok(items)
    }

    async fn fetch_roster_items_as_contact(&self, contact: &str) -> Result<Vec<RosterItem>, Error> {
        let mut items: Vec<_> = self
            .roster_items
            .values()
            .filter(|item| item.contact == contact)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(items)
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        contact: &str,
    ) -> Result<Option<RosterItem>, Error> {
        Ok(self
            .roster_items
            .get(&(username.to_string(), contact.to_string()))
            .cloned())
    }

    async fn insert_or_update_roster_item(&mut self, item: RosterItem) -> Result<(), Error> {
        self.roster_items
            .insert((item.username.clone(), item.contact.clone()), item);
        Ok(())
    }

    async fn delete_roster_item(&mut self, username: &str, contact: &str) -> Result<(), Error> {
        self.roster_items
            .remove(&(username.to_string(), contact.to_string()));
        Ok(())
    }

    async fn fetch_roster_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<RosterNotification>, Error> {
        let mut notifications: Vec<_> = self
            .roster_notifications
            .values()
            .filter(|notification| notification.contact == username)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(notifications)
    }

    async fn insert_or_update_roster_notification(
        &mut self,
        notification: RosterNotification,
    ) -> Result<(), Error> {
        self.roster_notifications.insert(
            (notification.username.clone(), notification.contact.clone()),
            notification,
        );
        Ok(())
    }

    async fn delete_roster_notification(
        &mut self,
        username: &str,
        contact: &str,
    ) -> Result<(), Error> {
        self.roster_notifications
            .remove(&(username.to_string(), contact.to_string()));
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, Error> {
        Ok(self
            .offline_messages
            .get(username)
            .map_or(0, |messages| messages.len()))
    }

    async fn insert_offline_message(
        &mut self,
        username: &str,
        message: Element,
    ) -> Result<(), Error> {
        self.offline_messages
            .entry(username.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, Error> {
        Ok(self.offline_messages.get(username).cloned().unwrap_or_default())
    }

    async fn delete_offline_messages(&mut self, username: &str) -> Result<(), Error> {
        self.offline_messages.remove(username);
        Ok(())
    }

    async fn fetch_private_elements(
        &self,
        username: &str,
        namespace: &str,
    ) -> Result<Option<Vec<Element>>, Error> {
        Ok(self
            .private_elements
            .get(&(username.to_string(), namespace.to_string()))
            .cloned())
    }

    async fn set_private_elements(
        &mut self,
        username: &str,
        namespace: &str,
        elements: Vec<Element>,
    ) -> Result<(), Error> {
        self.private_elements
            .insert((username.to_string(), namespace.to_string()), elements);
        Ok(())
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, Error> {
        Ok(self.vcards.get(username).cloned())
    }

    async fn set_vcard(&mut self, username: &str, vcard: Element) -> Result<(), Error> {
        self.vcards.insert(username.to_string(), vcard);
        Ok(())
    }
}
