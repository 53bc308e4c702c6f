//! Recognition and explicit decryption of ciphertext.
//!
//! Automatically encrypted values are stored as BSON binaries of subtype 6. A document read
//! through a client without automatic encryption still holds them as-is; [`ExplicitDecryptor`]
//! decrypts them with the key vault and KMS settings of the workflow.

use std::sync::Arc;

use futures_util::{future::BoxFuture, FutureExt};
use mongodb::{
    bson::{spec::BinarySubtype, Bson, Document},
    client_encryption::ClientEncryption,
};

use crate::error::{Error, ErrorKind, Result};

/// Whether `value` is a ciphertext produced by client-side field level encryption.
pub fn is_ciphertext(value: &Bson) -> bool {
    matches!(value, Bson::Binary(binary) if binary.subtype == BinarySubtype::Encrypted)
}

/// Dotted paths of every ciphertext in `document`, in document order. Array elements are
/// addressed by index.
pub fn ciphertext_paths(document: &Document) -> Vec<String> {
    let mut paths = Vec::new();
    for (key, value) in document {
        collect(value, key.clone(), &mut paths);
    }
    paths
}

fn collect(value: &Bson, path: String, paths: &mut Vec<String>) {
    match value {
        v if is_ciphertext(v) => paths.push(path),
        Bson::Document(document) => {
            for (key, child) in document {
                collect(child, format!("{path}.{key}"), paths);
            }
        }
        Bson::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect(item, format!("{path}.{index}"), paths);
            }
        }
        _ => {}
    }
}

/// Decrypts ciphertext found in documents read without automatic encryption.
pub struct ExplicitDecryptor {
    encryption: Arc<ClientEncryption>,
}

impl ExplicitDecryptor {
    /// Creates a decryptor using the key vault and KMS settings of `encryption`.
    pub fn new(encryption: Arc<ClientEncryption>) -> Self {
        Self { encryption }
    }

    /// Decrypts a single ciphertext value.
    pub async fn decrypt_value(&self, value: &Bson) -> Result<Bson> {
        let binary = match value {
            Bson::Binary(binary) if binary.subtype == BinarySubtype::Encrypted => binary,
            other => {
                return Err(decryption_error(format!(
                    "expected an encrypted binary, got {:?}",
                    other.element_type()
                )))
            }
        };
        let raw = self
            .encryption
            .decrypt(binary.as_raw_binary())
            .await
            .map_err(|e| decryption_error(e.to_string()))?;
        Bson::try_from(raw).map_err(|e| decryption_error(e.to_string()))
    }

    /// Returns `document` with every ciphertext replaced by its plaintext, at any depth.
    pub async fn decrypt_document(&self, document: Document) -> Result<Document> {
        let mut decrypted = Document::new();
        for (key, value) in document {
            let value = self.decrypt_nested(value).await?;
            decrypted.insert(key, value);
        }
        Ok(decrypted)
    }

    fn decrypt_nested(&self, value: Bson) -> BoxFuture<'_, Result<Bson>> {
        async move {
            match value {
                v if is_ciphertext(&v) => self.decrypt_value(&v).await,
                Bson::Document(document) => {
                    Ok(Bson::Document(self.decrypt_document(document).await?))
                }
                Bson::Array(items) => {
                    let mut decrypted = Vec::with_capacity(items.len());
                    for item in items {
                        decrypted.push(self.decrypt_nested(item).await?);
                    }
                    Ok(Bson::Array(decrypted))
                }
                other => Ok(other),
            }
        }
        .boxed()
    }
}

fn decryption_error(message: String) -> Error {
    ErrorKind::Decryption { message }.into()
}
