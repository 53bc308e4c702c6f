//! Resolution of a key alias to the identifier of a data encryption key.

use std::fmt;

use futures_util::{future::BoxFuture, FutureExt, TryStreamExt};
use mongodb::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    Collection,
};
use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};

/// A human-readable name of a data encryption key, stored in the key document's `keyAltNames`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyAlias(String);

impl KeyAlias {
    /// Wraps an alias.
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    /// The alias as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `_id` of a data encryption key: a binary UUID assigned when the key was created.
#[derive(Clone, Debug, PartialEq)]
pub struct DataKeyId(Binary);

impl DataKeyId {
    /// Wraps a key id, checking that it is a UUID binary.
    pub fn new(id: Binary) -> std::result::Result<Self, String> {
        if id.subtype != BinarySubtype::Uuid {
            return Err(format!(
                "expected a UUID binary, got subtype {:?}",
                id.subtype
            ));
        }
        Ok(Self(id))
    }

    /// The key id as a BSON binary.
    pub fn as_binary(&self) -> &Binary {
        &self.0
    }
}

impl From<DataKeyId> for Bson {
    fn from(id: DataKeyId) -> Self {
        Bson::Binary(id.0)
    }
}

impl fmt::Display for DataKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0.bytes))
    }
}

/// What the locator does when an alias matches more than one key document.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAliasPolicy {
    /// Fail with [`ErrorKind::DuplicateKeyAlias`].
    #[default]
    Reject,
    /// Use the key with the lowest `_id`.
    First,
}

/// Read access to the key vault collection.
pub trait KeyVault: Send + Sync {
    /// Returns the `_id` of at most `limit` key documents whose `keyAltNames` contain `alias`,
    /// in ascending `_id` order.
    fn find_key_ids<'a>(&'a self, alias: &'a str, limit: i64) -> BoxFuture<'a, Result<Vec<Bson>>>;
}

impl KeyVault for Collection<Document> {
    fn find_key_ids<'a>(&'a self, alias: &'a str, limit: i64) -> BoxFuture<'a, Result<Vec<Bson>>> {
        async move {
            let cursor = self
                .find(doc! { "keyAltNames": alias })
                .projection(doc! { "_id": 1 })
                .sort(doc! { "_id": 1 })
                .limit(limit)
                .await
                .map_err(ErrorKind::KeyLookup)?;
            let docs: Vec<Document> = cursor.try_collect().await.map_err(ErrorKind::KeyLookup)?;
            Ok(docs
                .into_iter()
                .filter_map(|mut d| d.remove("_id"))
                .collect())
        }
        .boxed()
    }
}

/// Finds the data encryption key bound to an alias.
pub struct KeyLocator<'a> {
    vault: &'a dyn KeyVault,
    policy: DuplicateAliasPolicy,
}

impl<'a> KeyLocator<'a> {
    /// Creates a locator reading from `vault`.
    pub fn new(vault: &'a dyn KeyVault, policy: DuplicateAliasPolicy) -> Self {
        Self { vault, policy }
    }

    /// Resolves `alias` to exactly one key id.
    ///
    /// Fails with [`ErrorKind::KeyNotFound`] if no key carries the alias. If more than one does,
    /// the outcome depends on the [`DuplicateAliasPolicy`].
    pub async fn locate(&self, alias: &KeyAlias) -> Result<DataKeyId> {
        // Two matches are enough to tell a unique alias from a duplicated one.
        let mut ids = self.vault.find_key_ids(alias.as_str(), 2).await?;
        match ids.len() {
            0 => return Err(Error::key_not_found(alias.as_str())),
            1 => {}
            count => match self.policy {
                DuplicateAliasPolicy::Reject => {
                    return Err(ErrorKind::DuplicateKeyAlias {
                        alias: alias.to_string(),
                        count,
                    }
                    .into())
                }
                DuplicateAliasPolicy::First => {
                    tracing::warn!(
                        %alias,
                        "key alt name matches more than one data encryption key, using the \
                         lowest _id"
                    );
                }
            },
        }

        let invalid = |message: String| -> Error {
            ErrorKind::InvalidKeyDocument {
                alias: alias.to_string(),
                message,
            }
            .into()
        };
        match ids.swap_remove(0) {
            Bson::Binary(binary) => DataKeyId::new(binary).map_err(invalid),
            other => Err(invalid(format!(
                "expected _id to be a binary, got {:?}",
                other.element_type()
            ))),
        }
    }
}
