use mongodb::bson::{Bson, Document};

use super::{Backend, RecordStore};
use crate::{
    decrypt::is_ciphertext,
    error::{Error, Result},
    payload::lookup,
    schema::EncryptionSchema,
};

/// What a read-back of the inserted document established.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct VerificationReport {
    /// Encrypted paths that were stored as ciphertext.
    pub ciphertext_paths: Vec<String>,
    /// Encrypted paths that had no value and are absent from the stored document.
    pub absent_paths: Vec<String>,
    /// Top-level fields whose decrypted value equals the value sent.
    pub matched_fields: Vec<String>,
}

/// Reads the document with `id` back and checks it against `sent`.
///
/// Through the plain client, every encrypted path with a value must hold ciphertext and every
/// encrypted path without one must be absent. Through the encrypting client, and again through
/// explicit decryption of the raw document, every field sent must come back unchanged.
pub(super) async fn verify(
    backend: &dyn Backend,
    store: &dyn RecordStore,
    schema: &EncryptionSchema,
    sent: &Document,
    id: &Bson,
) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();

    let raw = backend
        .find_raw_by_id(id)
        .await?
        .ok_or_else(|| Error::verification("_id", "not found through the plain client"))?;

    for encrypted in schema.encrypted_paths() {
        let path = encrypted.path;
        match (lookup(sent, &path), lookup(&raw, &path)) {
            (None, None) => report.absent_paths.push(path),
            (None, Some(_)) => {
                return Err(Error::verification(
                    path,
                    "field had no value but is present in the stored document",
                ))
            }
            (Some(_), Some(stored)) if is_ciphertext(stored) => {
                report.ciphertext_paths.push(path)
            }
            (Some(_), _) => {
                return Err(Error::verification(path, "field is not stored as ciphertext"))
            }
        }
    }

    let decrypted = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::verification("_id", "not found through the encrypted client"))?;
    let explicit = backend.decrypt(raw).await?;

    for (key, value) in sent {
        compare(key, value, decrypted.get(key), "automatic decryption")?;
        compare(key, value, explicit.get(key), "explicit decryption")?;
        report.matched_fields.push(key.clone());
    }

    tracing::info!(
        ciphertext = report.ciphertext_paths.len(),
        absent = report.absent_paths.len(),
        "inserted document verified"
    );
    Ok(report)
}

fn compare(key: &str, sent: &Bson, read: Option<&Bson>, via: &str) -> Result<()> {
    match read {
        Some(read) if read == sent => Ok(()),
        // Values stay out of the message, they may be sensitive.
        Some(read) => Err(Error::verification(
            key,
            format!(
                "{via} returned a different {:?} value than the {:?} sent",
                read.element_type(),
                sent.element_type()
            ),
        )),
        None => Err(Error::verification(key, format!("missing after {via}"))),
    }
}
