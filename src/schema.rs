//! Encryption schemas for automatic encryption.
//!
//! A schema is described as a tree of [`FieldPolicy`] entries rather than as a JSON schema
//! literal, so the choice between deterministic and randomized encryption stays visible field by
//! field. [`EncryptionSchema::new`] checks the tree against the constraints libmongocrypt
//! enforces and [`EncryptionSchema::to_document`] renders the `$jsonSchema` document handed to
//! the driver.
//!
//! Deterministic encryption produces the same ciphertext for the same plaintext and key, which
//! allows equality queries on the field but reveals which documents share a value. Randomized
//! encryption reveals nothing but the field can no longer be queried.

pub mod employee;

use std::collections::{HashMap, HashSet};

use derive_more::Display;
use mongodb::{
    bson::{doc, Bson, Document},
    mongocrypt::ctx::Algorithm,
    Namespace,
};

use crate::{
    error::{ConfigInput, Error, Result},
    key_vault::DataKeyId,
};

/// An encryption algorithm of client-side field level encryption.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// Same plaintext and key always give the same ciphertext.
    #[display("deterministic")]
    Deterministic,
    /// Every encryption gives a different ciphertext.
    #[display("random")]
    Random,
}

impl EncryptionAlgorithm {
    /// The algorithm name used in JSON schemas.
    pub const fn schema_name(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            EncryptionAlgorithm::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
        }
    }

    /// The matching libmongocrypt algorithm, for explicit encryption.
    pub fn to_mongocrypt(self) -> Algorithm {
        match self {
            EncryptionAlgorithm::Deterministic => Algorithm::Deterministic,
            EncryptionAlgorithm::Random => Algorithm::Random,
        }
    }
}

/// The BSON type of an encrypted value.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BsonType {
    #[display("string")]
    String,
    #[display("int")]
    Int,
    #[display("long")]
    Long,
    #[display("double")]
    Double,
    #[display("decimal")]
    Decimal,
    #[display("date")]
    Date,
    #[display("bool")]
    Bool,
    #[display("object")]
    Object,
    #[display("array")]
    Array,
    #[display("binData")]
    BinData,
}

impl BsonType {
    /// Whether libmongocrypt allows deterministic encryption of this type.
    pub const fn supports_deterministic(self) -> bool {
        !matches!(
            self,
            BsonType::Double
                | BsonType::Decimal
                | BsonType::Bool
                | BsonType::Object
                | BsonType::Array
        )
    }
}

/// How a single field of a document is stored.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldPolicy {
    /// Stored as-is.
    Plaintext,
    /// Encrypted with [`EncryptionAlgorithm::Deterministic`].
    DeterministicEncrypt(BsonType),
    /// Encrypted with [`EncryptionAlgorithm::Random`].
    RandomizedEncrypt(BsonType),
    /// Encrypted with the schema's default algorithm.
    DefaultEncrypt(BsonType),
    /// A subdocument encrypted as one opaque value with the schema's default algorithm. None of its
    /// fields are visible to the server.
    NestedObjectEncrypt,
    /// A subdocument whose fields carry their own policies.
    Object(ObjectPolicy),
}

impl FieldPolicy {
    fn explicit_algorithm(&self) -> Option<EncryptionAlgorithm> {
        match self {
            FieldPolicy::DeterministicEncrypt(_) => Some(EncryptionAlgorithm::Deterministic),
            FieldPolicy::RandomizedEncrypt(_) => Some(EncryptionAlgorithm::Random),
            _ => None,
        }
    }

    fn encrypted_type(&self) -> Option<BsonType> {
        match self {
            FieldPolicy::DeterministicEncrypt(t)
            | FieldPolicy::RandomizedEncrypt(t)
            | FieldPolicy::DefaultEncrypt(t) => Some(*t),
            FieldPolicy::NestedObjectEncrypt => Some(BsonType::Object),
            FieldPolicy::Plaintext | FieldPolicy::Object(_) => None,
        }
    }
}

/// The policies of the fields of one (sub)document, in declaration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectPolicy {
    fields: Vec<(String, FieldPolicy)>,
}

impl ObjectPolicy {
    /// Starts an empty policy table.
    pub fn builder() -> ObjectPolicyBuilder {
        ObjectPolicyBuilder::default()
    }

    /// Iterates over the declared fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldPolicy)> {
        self.fields.iter().map(|(name, policy)| (name.as_str(), policy))
    }

    /// Looks up the policy of a dotted path.
    pub fn get(&self, path: &str) -> Option<&FieldPolicy> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let policy = self
            .fields
            .iter()
            .find(|(name, _)| name == head)
            .map(|(_, policy)| policy)?;
        match (rest, policy) {
            (None, policy) => Some(policy),
            (Some(rest), FieldPolicy::Object(child)) => child.get(rest),
            (Some(_), _) => None,
        }
    }
}

/// Builds an [`ObjectPolicy`] one field at a time.
#[derive(Debug, Default)]
pub struct ObjectPolicyBuilder {
    fields: Vec<(String, FieldPolicy)>,
}

impl ObjectPolicyBuilder {
    /// Declares a field with an arbitrary policy.
    pub fn field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.push((name.into(), policy));
        self
    }

    /// Declares a field stored in plaintext.
    pub fn plaintext(self, name: impl Into<String>) -> Self {
        self.field(name, FieldPolicy::Plaintext)
    }

    /// Declares a deterministically encrypted field.
    pub fn deterministic(self, name: impl Into<String>, bson_type: BsonType) -> Self {
        self.field(name, FieldPolicy::DeterministicEncrypt(bson_type))
    }

    /// Declares a field encrypted with randomized encryption.
    pub fn randomized(self, name: impl Into<String>, bson_type: BsonType) -> Self {
        self.field(name, FieldPolicy::RandomizedEncrypt(bson_type))
    }

    /// Declares a field encrypted with the schema's default algorithm.
    pub fn encrypted(self, name: impl Into<String>, bson_type: BsonType) -> Self {
        self.field(name, FieldPolicy::DefaultEncrypt(bson_type))
    }

    /// Declares a subdocument encrypted as a whole.
    pub fn encrypted_object(self, name: impl Into<String>) -> Self {
        self.field(name, FieldPolicy::NestedObjectEncrypt)
    }

    /// Declares a subdocument and the policies of its fields.
    pub fn object(
        self,
        name: impl Into<String>,
        fields: impl FnOnce(ObjectPolicyBuilder) -> ObjectPolicyBuilder,
    ) -> Self {
        let child = fields(ObjectPolicyBuilder::default()).build();
        self.field(name, FieldPolicy::Object(child))
    }

    /// Finishes the table.
    pub fn build(self) -> ObjectPolicy {
        ObjectPolicy {
            fields: self.fields,
        }
    }
}

/// An encrypted field of a schema together with its effective settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPath {
    /// Dotted path of the field.
    pub path: String,
    /// Declared BSON type of the plaintext.
    pub bson_type: BsonType,
    /// The algorithm applied, explicit or inherited.
    pub algorithm: EncryptionAlgorithm,
    /// Whether the algorithm comes from the schema default.
    pub inherited: bool,
}

/// A validated schema for one collection.
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionSchema {
    key_id: DataKeyId,
    default_algorithm: EncryptionAlgorithm,
    root: ObjectPolicy,
}

impl EncryptionSchema {
    /// Binds a policy table to a data encryption key.
    ///
    /// Every encrypted field uses `key_id` through the schema's `encryptMetadata`, and fields
    /// without an explicit algorithm use `default_algorithm`. Fails if a field name is empty,
    /// dotted, or repeated, or if deterministic encryption would apply to a type that does not
    /// support it.
    pub fn new(
        key_id: DataKeyId,
        default_algorithm: EncryptionAlgorithm,
        root: ObjectPolicy,
    ) -> Result<Self> {
        let schema = Self {
            key_id,
            default_algorithm,
            root,
        };
        schema.check_object(&schema.root, "")?;
        Ok(schema)
    }

    fn check_object(&self, object: &ObjectPolicy, prefix: &str) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, policy) in object.fields() {
            let path = join(prefix, name);
            if name.is_empty() || name.contains('.') || name.starts_with('$') {
                return Err(schema_error(format!("invalid field name {path:?}")));
            }
            if !seen.insert(name) {
                return Err(schema_error(format!("field {path:?} is declared twice")));
            }
            if let FieldPolicy::Object(child) = policy {
                self.check_object(child, &path)?;
                continue;
            }
            if let Some(bson_type) = policy.encrypted_type() {
                let algorithm = policy
                    .explicit_algorithm()
                    .unwrap_or(self.default_algorithm);
                if algorithm == EncryptionAlgorithm::Deterministic
                    && !bson_type.supports_deterministic()
                {
                    return Err(schema_error(format!(
                        "field {path:?} of type {bson_type} cannot use deterministic encryption"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The key every encrypted field is bound to.
    pub fn key_id(&self) -> &DataKeyId {
        &self.key_id
    }

    /// Renders the `$jsonSchema` document understood by libmongocrypt.
    pub fn to_document(&self) -> Document {
        doc! {
            "bsonType": "object",
            "encryptMetadata": {
                "keyId": [Bson::from(self.key_id.clone())],
                "algorithm": self.default_algorithm.schema_name(),
            },
            "properties": properties(&self.root),
        }
    }

    /// The schema map entry for `target`.
    pub fn schema_map(&self, target: &Namespace) -> HashMap<String, Document> {
        [(target.to_string(), self.to_document())].into_iter().collect()
    }

    /// Every encrypted field with its effective algorithm.
    pub fn encrypted_paths(&self) -> Vec<EncryptedPath> {
        let mut out = Vec::new();
        self.collect_encrypted(&self.root, "", &mut out);
        out
    }

    fn collect_encrypted(
        &self,
        object: &ObjectPolicy,
        prefix: &str,
        out: &mut Vec<EncryptedPath>,
    ) {
        for (name, policy) in object.fields() {
            let path = join(prefix, name);
            if let FieldPolicy::Object(child) = policy {
                self.collect_encrypted(child, &path, out);
            } else if let Some(bson_type) = policy.encrypted_type() {
                let explicit = policy.explicit_algorithm();
                out.push(EncryptedPath {
                    path,
                    bson_type,
                    algorithm: explicit.unwrap_or(self.default_algorithm),
                    inherited: explicit.is_none(),
                });
            }
        }
    }

    /// Paths of encrypted fields holding a whole subdocument. A null at one of these paths cannot
    /// be encrypted, so payloads must omit the field instead.
    pub fn object_encrypted_paths(&self) -> Vec<String> {
        self.encrypted_paths()
            .into_iter()
            .filter(|p| p.bson_type == BsonType::Object)
            .map(|p| p.path)
            .collect()
    }
}

fn properties(object: &ObjectPolicy) -> Document {
    let mut props = Document::new();
    for (name, policy) in object.fields() {
        let entry = match policy {
            FieldPolicy::Plaintext => continue,
            FieldPolicy::DeterministicEncrypt(t) => {
                encrypt_entry(*t, Some(EncryptionAlgorithm::Deterministic))
            }
            FieldPolicy::RandomizedEncrypt(t) => {
                encrypt_entry(*t, Some(EncryptionAlgorithm::Random))
            }
            FieldPolicy::DefaultEncrypt(t) => encrypt_entry(*t, None),
            FieldPolicy::NestedObjectEncrypt => encrypt_entry(BsonType::Object, None),
            FieldPolicy::Object(child) => {
                let child_props = properties(child);
                // A subdocument without encrypted fields needs no entry.
                if child_props.is_empty() {
                    continue;
                }
                doc! { "bsonType": "object", "properties": child_props }
            }
        };
        props.insert(name, entry);
    }
    props
}

fn encrypt_entry(bson_type: BsonType, algorithm: Option<EncryptionAlgorithm>) -> Document {
    let mut encrypt = doc! { "bsonType": bson_type.to_string() };
    if let Some(algorithm) = algorithm {
        encrypt.insert("algorithm", algorithm.schema_name());
    }
    doc! { "encrypt": encrypt }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn schema_error(message: String) -> Error {
    Error::invalid_configuration(ConfigInput::Schema, message)
}
