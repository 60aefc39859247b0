use anyhow::{anyhow, Error};
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{AnyPool, Row};

use warbler_core::xml::parser::{parse_fragments, parse_standalone};
use warbler_core::xml::Element;

use crate::settings::StorageSettings;

use super::{RosterItem, RosterNotification, StoreBackend, Subscription, User};

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        username TEXT PRIMARY KEY,
        password TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS roster_items (
        username TEXT NOT NULL,
        contact TEXT NOT NULL,
        name TEXT NOT NULL,
        subscription TEXT NOT NULL,
        ask INTEGER NOT NULL,
        item_groups TEXT NOT NULL,
        PRIMARY KEY (username, contact)
    )",
    "CREATE TABLE IF NOT EXISTS roster_notifications (
        username TEXT NOT NULL,
        contact TEXT NOT NULL,
        elements TEXT NOT NULL,
        PRIMARY KEY (username, contact)
    )",
    "CREATE TABLE IF NOT EXISTS offline_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS private_storage (
        username TEXT NOT NULL,
        namespace TEXT NOT NULL,
        elements TEXT NOT NULL,
        PRIMARY KEY (username, namespace)
    )",
    "CREATE TABLE IF NOT EXISTS vcards (
        username TEXT PRIMARY KEY,
        vcard TEXT NOT NULL
    )",
];

const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        username VARCHAR(255) PRIMARY KEY,
        password TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS roster_items (
        username VARCHAR(255) NOT NULL,
        contact VARCHAR(255) NOT NULL,
        name TEXT NOT NULL,
        subscription VARCHAR(16) NOT NULL,
        ask BIGINT NOT NULL,
        item_groups TEXT NOT NULL,
        PRIMARY KEY (username, contact)
    )",
    "CREATE TABLE IF NOT EXISTS roster_notifications (
        username VARCHAR(255) NOT NULL,
        contact VARCHAR(255) NOT NULL,
        elements TEXT NOT NULL,
        PRIMARY KEY (username, contact)
    )",
    "CREATE TABLE IF NOT EXISTS offline_messages (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        username VARCHAR(255) NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS private_storage (
        username VARCHAR(255) NOT NULL,
        namespace VARCHAR(255) NOT NULL,
        elements TEXT NOT NULL,
        PRIMARY KEY (username, namespace)
    )",
    "CREATE TABLE IF NOT EXISTS vcards (
        username VARCHAR(255) PRIMARY KEY,
        vcard TEXT NOT NULL
    )",
];

/// SQL persistence over sqlx's `Any` driver, so the one implementation
/// serves both the sqlite and mysql storage types. Statements stick to
/// portable `?` placeholders; upserts are delete-then-insert, which is safe
/// because the store task is the only writer.
pub struct SqlStoreBackend {
    pool: AnyPool,
}

impl SqlStoreBackend {
    pub async fn new(storage: &StorageSettings) -> Result<Self, Error> {
        let backend =
            Self::connect(&storage.connection_url(), storage.pool_size()).await?;
        let schema = match storage {
            StorageSettings::Sqlite(_) => SQLITE_SCHEMA,
            StorageSettings::MySql(_) => MYSQL_SCHEMA,
        };
        backend.ensure_schema(schema).await?;
        Ok(backend)
    }

    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self, schema: &[&str]) -> Result<(), Error> {
        for statement in schema {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn roster_item_from_row(row: &sqlx::any::AnyRow) -> Result<RosterItem, Error> {
    let subscription: String = row.try_get("subscription")?;
    let subscription = Subscription::parse(&subscription)
        .ok_or_else(|| anyhow!("unrecognized stored subscription: {subscription}"))?;
    let groups: String = row.try_get("item_groups")?;
    let groups = if groups.is_empty() {
        Vec::new()
    } else {
        groups.split('\n').map(str::to_string).collect()
    };
    Ok(RosterItem {
        username: row.try_get("username")?,
        contact: row.try_get("contact")?,
        name: row.try_get("name")?,
        subscription,
        ask: row.try_get::<i64, _>("ask")? != 0,
        groups,
    })
}

fn join_elements(elements: &[Element]) -> String {
    elements
        .iter()
        .map(|element| element.to_xml())
        .collect::<String>()
}

impl StoreBackend for SqlStoreBackend {
    async fn user_exists(&self, username: &str) -> Result<bool, Error> {
        let row = sqlx::query("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)? > 0)
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, Error> {
        let row = sqlx::query("SELECT username, password FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(User {
                username: row.try_get("username")?,
                password: row.try_get("password")?,
            })
        })
        .transpose()
    }

    async fn insert_or_update_user(&mut self, user: User) -> Result<(), Error> {
        sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(&user.username)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO users (username, password) VALUES (?, ?)")
            .bind(&user.username)
            .bind(&user.password)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user(&mut self, username: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, Error> {
        let rows = sqlx::query(
            "SELECT username, contact, name, subscription, ask, item_groups
             FROM roster_items WHERE username = ? ORDER BY contact",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(roster_item_from_row).collect()
    }

    async fn fetch_roster_items_as_contact(&self, contact: &str) -> Result<Vec<RosterItem>, Error> {
        let rows = sqlx::query(
            "SELECT username, contact, name, subscription, ask, item_groups
             FROM roster_items WHERE contact = ? ORDER BY username",
        )
        .bind(contact)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(roster_item_from_row).collect()
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        contact: &str,
    ) -> Result<Option<RosterItem>, Error> {
        let row = sqlx::query(
            "SELECT username, contact, name, subscription, ask, item_groups
             FROM roster_items WHERE username = ? AND contact = ?",
        )
        .bind(username)
        .bind(contact)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(roster_item_from_row).transpose()
    }

    async fn insert_or_update_roster_item(&mut self, item: RosterItem) -> Result<(), Error> {
        sqlx::query("DELETE FROM roster_items WHERE username = ? AND contact = ?")
            .bind(&item.username)
            .bind(&item.contact)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO roster_items (username, contact, name, subscription, ask, item_groups)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.username)
        .bind(&item.contact)
        .bind(&item.name)
        .bind(item.subscription.as_str())
        .bind(item.ask as i64)
        .bind(item.groups.join("\n"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_roster_item(&mut self, username: &str, contact: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM roster_items WHERE username = ? AND contact = ?")
            .bind(username)
            .bind(contact)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_roster_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<RosterNotification>, Error> {
        let rows = sqlx::query(
            "SELECT username, contact, elements FROM roster_notifications
             WHERE contact = ? ORDER BY username",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let elements: String = row.try_get("elements")?;
                Ok(RosterNotification {
                    username: row.try_get("username")?,
                    contact: row.try_get("contact")?,
                    elements: parse_fragments(&elements)?,
                })
            })
            .collect()
    }

    async fn insert_or_update_roster_notification(
        &mut self,
        notification: RosterNotification,
    ) -> Result<(), Error> {
        sqlx::query("DELETE FROM roster_notifications WHERE username = ? AND contact = ?")
            .bind(&notification.username)
            .bind(&notification.contact)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO roster_notifications (username, contact, elements) VALUES (?, ?, ?)",
        )
        .bind(&notification.username)
        .bind(&notification.contact)
        .bind(join_elements(&notification.elements))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_roster_notification(
        &mut self,
        username: &str,
        contact: &str,
    ) -> Result<(), Error> {
        sqlx::query("DELETE FROM roster_notifications WHERE username = ? AND contact = ?")
            .bind(username)
            .bind(contact)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, Error> {
        let row = sqlx::query("SELECT COUNT(*) FROM offline_messages WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as usize)
    }

    async fn insert_offline_message(
        &mut self,
        username: &str,
        message: Element,
    ) -> Result<(), Error> {
        sqlx::query("INSERT INTO offline_messages (username, message) VALUES (?, ?)")
            .bind(username)
            .bind(message.to_xml())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, Error> {
        let rows =
            sqlx::query("SELECT message FROM offline_messages WHERE username = ? ORDER BY id")
                .bind(username)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                let message: String = row.try_get("message")?;
                Ok(parse_standalone(&message)?)
            })
            .collect()
    }

    async fn delete_offline_messages(&mut self, username: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM offline_messages WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_private_elements(
        &self,
        username: &str,
        namespace: &str,
    ) -> Result<Option<Vec<Element>>, Error> {
        let row = sqlx::query(
            "SELECT elements FROM private_storage WHERE username = ? AND namespace = ?",
        )
        .bind(username)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let elements: String = row.try_get("elements")?;
            Ok(parse_fragments(&elements)?)
        })
        .transpose()
    }

    async fn set_private_elements(
        &mut self,
        username: &str,
        namespace: &str,
        elements: Vec<Element>,
    ) -> Result<(), Error> {
        sqlx::query("DELETE FROM private_storage WHERE username = ? AND namespace = ?")
            .bind(username)
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO private_storage (username, namespace, elements) VALUES (?, ?, ?)")
            .bind(username)
            .bind(namespace)
            .bind(join_elements(&elements))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, Error> {
        let row = sqlx::query("SELECT vcard FROM vcards WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let vcard: String = row.try_get("vcard")?;
            Ok(parse_standalone(&vcard)?)
        })
        .transpose()
    }

    async fn set_vcard(&mut self, username: &str, vcard: Element) -> Result<(), Error> {
        sqlx::query("DELETE FROM vcards WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO vcards (username, vcard) VALUES (?, ?)")
            .bind(username)
            .bind(vcard.to_xml())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_backend() -> SqlStoreBackend {
        let backend = SqlStoreBackend::connect("sqlite::memory:", 1).await.unwrap();
        backend.ensure_schema(SQLITE_SCHEMA).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn persists_users() {
        let mut backend = memory_backend().await;
        backend
            .insert_or_update_user(User {
                username: "alice".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();

        assert!(backend.user_exists("alice").await.unwrap());
        let user = backend.fetch_user("alice").await.unwrap().unwrap();
        assert_eq!(user.password, "secret");

        backend
            .insert_or_update_user(User {
                username: "alice".to_string(),
                password: "changed".to_string(),
            })
            .await
            .unwrap();
        let user = backend.fetch_user("alice").await.unwrap().unwrap();
        assert_eq!(user.password, "changed");
    }

    #[tokio::test]
    async fn persists_roster_items_with_groups() {
        let mut backend = memory_backend().await;
        backend
            .insert_or_update_roster_item(RosterItem {
                username: "alice".to_string(),
                contact: "bob".to_string(),
                name: "Bob".to_string(),
                subscription: Subscription::Both,
                ask: false,
                groups: vec!["pals".to_string(), "work".to_string()],
            })
            .await
            .unwrap();

        let item = backend
            .fetch_roster_item("alice", "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.subscription, Subscription::Both);
        assert_eq!(item.groups, ["pals", "work"]);

        assert_eq!(
            backend
                .fetch_roster_items_as_contact("bob")
                .await
                .unwrap()
                .len(),
            1
        );
        backend.delete_roster_item("alice", "bob").await.unwrap();
        assert!(backend
            .fetch_roster_item("alice", "bob")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn offline_messages_come_back_in_fifo_order() {
        let mut backend = memory_backend().await;
        for i in 0..3 {
            let mut message = Element::new("message");
            message.set_attribute("id", &i.to_string());
            backend.insert_offline_message("carol", message).await.unwrap();
        }

        assert_eq!(backend.count_offline_messages("carol").await.unwrap(), 3);
        let ids: Vec<String> = backend
            .fetch_offline_messages("carol")
            .await
            .unwrap()
            .iter()
            .map(|m| m.id().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["0", "1", "2"]);

        backend.delete_offline_messages("carol").await.unwrap();
        assert_eq!(backend.count_offline_messages("carol").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn roster_notifications_round_trip_their_elements() {
        let mut backend = memory_backend().await;
        let mut status = Element::new("status");
        status.set_text("please add me");
        backend
            .insert_or_update_roster_notification(RosterNotification {
                username: "alice".to_string(),
                contact: "bob".to_string(),
                elements: vec![status],
            })
            .await
            .unwrap();

        let notifications = backend.fetch_roster_notifications("bob").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].username, "alice");
        assert_eq!(notifications[0].elements[0].text(), "please add me");

        backend
            .delete_roster_notification("alice", "bob")
            .await
            .unwrap();
        assert!(backend
            .fetch_roster_notifications("bob")
            .await
            .unwrap()
            .is_empty());
    }
}
