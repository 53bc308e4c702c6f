//! Explicit encryption of documents and query values.
//!
//! The encrypting client rewrites every command it sends according to the schema map. The same
//! ciphertext can be produced by hand: [`ExplicitEncryptor`] encrypts each field the schema marks
//! as encrypted, so the document can be written through a client without automatic encryption,
//! and turns a plaintext value into an equality filter on a deterministically encrypted field.

use futures_util::{future::BoxFuture, FutureExt};
use mongodb::{
    bson::{Bson, Document, RawBson},
    client_encryption::ClientEncryption,
};

use crate::{
    decrypt::is_ciphertext,
    error::{Error, Result},
    key_vault::DataKeyId,
    payload::{lookup, NormalizedPayload},
    schema::{EncryptionAlgorithm, EncryptionSchema},
};

/// Encrypts single values with a data encryption key.
pub trait ValueEncrypter: Send + Sync {
    /// Encrypts `value` under `key_id`, returning a BSON binary of subtype 6.
    fn encrypt_value<'a>(
        &'a self,
        value: Bson,
        key_id: &'a DataKeyId,
        algorithm: EncryptionAlgorithm,
    ) -> BoxFuture<'a, mongodb::error::Result<Bson>>;
}

impl ValueEncrypter for ClientEncryption {
    fn encrypt_value<'a>(
        &'a self,
        value: Bson,
        key_id: &'a DataKeyId,
        algorithm: EncryptionAlgorithm,
    ) -> BoxFuture<'a, mongodb::error::Result<Bson>> {
        async move {
            let value = RawBson::try_from(value)?;
            let binary = self
                .encrypt(value, key_id.as_binary().clone(), algorithm.to_mongocrypt())
                .await?;
            Ok(Bson::Binary(binary))
        }
        .boxed()
    }
}

/// Encrypts the fields of a schema explicitly.
pub struct ExplicitEncryptor<'a> {
    cipher: &'a dyn ValueEncrypter,
    schema: &'a EncryptionSchema,
}

impl<'a> ExplicitEncryptor<'a> {
    /// Creates an encryptor applying `schema` through `cipher`.
    pub fn new(cipher: &'a dyn ValueEncrypter, schema: &'a EncryptionSchema) -> Self {
        Self { cipher, schema }
    }

    /// Returns the payload with the value of every encrypted field replaced by its ciphertext,
    /// using the field's algorithm and the schema's key. Fields the payload omits stay absent.
    pub async fn encrypt_document(&self, payload: &NormalizedPayload) -> Result<Document> {
        let mut document = payload.document().clone();
        for encrypted in self.schema.encrypted_paths() {
            let Some(value) = lookup(&document, &encrypted.path).cloned() else {
                continue;
            };
            let ciphertext = self
                .encrypt_at(&encrypted.path, value, encrypted.algorithm)
                .await?;
            replace_at(&mut document, &encrypted.path, ciphertext);
        }
        Ok(document)
    }

    /// A filter matching documents whose deterministically encrypted field at `path` holds
    /// `value`.
    pub async fn equality_filter(&self, path: &str, value: impl Into<Bson>) -> Result<Document> {
        let algorithm = self
            .schema
            .encrypted_paths()
            .into_iter()
            .find(|encrypted| encrypted.path == path)
            .map(|encrypted| encrypted.algorithm);
        match algorithm {
            Some(EncryptionAlgorithm::Deterministic) => {}
            Some(EncryptionAlgorithm::Random) => {
                return Err(Error::encryption(
                    path,
                    "randomly encrypted fields cannot be queried",
                ))
            }
            None => return Err(Error::encryption(path, "field is not encrypted")),
        }

        let ciphertext = self
            .encrypt_at(path, value.into(), EncryptionAlgorithm::Deterministic)
            .await?;
        let mut filter = Document::new();
        filter.insert(path, ciphertext);
        Ok(filter)
    }

    async fn encrypt_at(
        &self,
        path: &str,
        value: Bson,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Bson> {
        if value == Bson::Null {
            return Err(Error::encryption(path, "null cannot be encrypted"));
        }
        let ciphertext = self
            .cipher
            .encrypt_value(value, self.schema.key_id(), algorithm)
            .await
            .map_err(|e| Error::encryption(path, e.to_string()))?;
        if !is_ciphertext(&ciphertext) {
            return Err(Error::encryption(
                path,
                format!(
                    "expected an encrypted binary, got {:?}",
                    ciphertext.element_type()
                ),
            ));
        }
        Ok(ciphertext)
    }
}

fn replace_at(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if let Ok(child) = document.get_document_mut(head) {
                replace_at(child, rest, value);
            }
        }
    }
}
