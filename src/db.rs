//! Database-level operations: collection handles, creating/dropping collections, and
//! user management commands, grounded on the teacher's `Client`/`Database` split.

use bson::{doc, Document};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::session::Transaction;
use crate::client::Client;
use crate::coll::Collection;
use crate::error::{Error, Result};

/// A handle to one database on the connected server. Borrows the `Client` it came from; a
/// `Database` has no state of its own beyond its name.
pub struct Database<'a, S> {
    client: &'a Client<S>,
    name: String,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> Database<'a, S> {
    pub(crate) fn new(client: &'a Client<S>, name: String) -> Self {
        Self { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection<'a, S> {
        Collection::new(self.client, self.name.clone(), name.into())
    }

    pub async fn command(&self, cmd: Document, transaction: Option<&mut Transaction>) -> Result<Document> {
        self.client.request(cmd, &self.name, transaction).await
    }

    pub async fn create_collection(&self, name: &str) -> Result<()> {
        self.command(doc! { "create": name }, None).await?;
        Ok(())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        self.command(doc! { "drop": name }, None).await?;
        Ok(())
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        let reply = self
            .command(doc! { "listCollections": 1, "nameOnly": true }, None)
            .await?;
        let batch = reply
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .map_err(|_| Error::protocol("listCollections reply missing cursor.firstBatch"))?;
        Ok(batch
            .iter()
            .filter_map(|entry| entry.as_document()?.get_str("name").ok().map(str::to_string))
            .collect())
    }

    pub async fn create_user(&self, username: &str, password: &str, roles: Vec<Document>) -> Result<()> {
        self.command(
            doc! {
                "createUser": username,
                "pwd": password,
                "roles": roles,
            },
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn drop_user(&self, username: &str) -> Result<()> {
        self.command(doc! { "dropUser": username }, None).await?;
        Ok(())
    }

    pub async fn users_info(&self, username: &str) -> Result<Vec<Document>> {
        let reply = self.command(doc! { "usersInfo": username }, None).await?;
        let users = reply
            .get_array("users")
            .map_err(|_| Error::protocol("usersInfo reply missing users array"))?;
        Ok(users.iter().filter_map(bson::Bson::as_document).cloned().collect())
    }

    pub async fn grant_roles_to_user(&self, username: &str, roles: Vec<Document>) -> Result<()> {
        self.command(
            doc! { "grantRolesToUser": username, "roles": roles },
            None,
        )
        .await?;
        Ok(())
    }
}
