//! The record written by the workflow and its normalization.
//!
//! Optional fields without a value serialize to BSON null. libmongocrypt refuses to encrypt a null
//! and a schema treats a null and a missing field differently, so every payload passes through
//! [`NormalizedPayload::new`], which removes null-valued fields at any depth. Absence is the only
//! representation of "no value" that reaches the driver.

use mongodb::bson::{self, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    schema::EncryptionSchema,
};

/// An employee of `companyData.employee`.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeRecord {
    pub name: PersonName,
    pub address: Address,
    pub dob: DateTime,
    #[builder(setter(into))]
    pub phone_number: String,
    pub salary: f64,
    #[builder(setter(into))]
    pub tax_identifier: String,
    #[builder(default)]
    pub role: Vec<String>,
}

impl EmployeeRecord {
    /// Serializes the record. Unset optional fields are present as nulls until normalized.
    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(|e| Error::invalid_payload(e.to_string()))
    }
}

/// An employee's names.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    #[builder(setter(into))]
    pub first_name: String,
    #[builder(setter(into))]
    pub last_name: String,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub other_names: Option<String>,
}

/// A postal address.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Address {
    pub street_address: String,
    pub suburb_county: String,
    pub state_province: String,
    pub zip_postcode: String,
    pub country: String,
}

/// A payload that holds no null values, ready to be inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedPayload {
    document: Document,
    omitted: Vec<String>,
}

impl NormalizedPayload {
    /// Removes every null-valued field from `document`, recursing into subdocuments, then checks
    /// that nothing at an object-encrypted path of `schema` has a non-document value.
    pub fn new(mut document: Document, schema: &EncryptionSchema) -> Result<Self> {
        let mut omitted = Vec::new();
        strip_nulls(&mut document, "", &mut omitted);

        for path in schema.object_encrypted_paths() {
            match lookup(&document, &path) {
                None | Some(Bson::Document(_)) => {}
                Some(other) => {
                    return Err(Error::invalid_payload(format!(
                        "{path} is encrypted as an object but holds a {:?}",
                        other.element_type()
                    )))
                }
            }
        }

        Ok(Self { document, omitted })
    }

    /// The normalized document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Dotted paths of the fields that were removed because they were null.
    pub fn omitted(&self) -> &[String] {
        &self.omitted
    }

    /// Takes the normalized document.
    pub fn into_document(self) -> Document {
        self.document
    }
}

fn strip_nulls(document: &mut Document, prefix: &str, omitted: &mut Vec<String>) {
    let nulls: Vec<String> = document
        .iter()
        .filter(|(_, value)| matches!(value, Bson::Null))
        .map(|(key, _)| key.clone())
        .collect();
    for key in nulls {
        document.remove(&key);
        omitted.push(join(prefix, &key));
    }

    for (key, value) in document.iter_mut() {
        if let Bson::Document(child) = value {
            strip_nulls(child, &join(prefix, key), omitted);
        }
    }
}

/// Returns the value at a dotted path, descending through subdocuments only.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => document.get(path),
        Some((head, rest)) => match document.get(head)? {
            Bson::Document(child) => lookup(child, rest),
            _ => None,
        },
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
