//! The encrypted insert workflow.
//!
//! A run moves through the stages of [`Stage`] strictly in order and stops at the first error:
//! the key alias is resolved through the plain client, the schema is bound to the resolved key,
//! the key management provider is reached and the encrypting client is built, the payload is
//! normalized, and a single insert is issued. No step is retried. Both clients are shut down on
//! every exit path.

mod verify;

use std::collections::HashMap;

use derive_more::Display;
use futures_util::future::BoxFuture;
use mongodb::bson::{Bson, Document};

use crate::{
    client::MongoBackend,
    config::WorkflowConfig,
    error::Result,
    key_vault::{DataKeyId, KeyAlias, KeyLocator, KeyVault},
    payload::{EmployeeRecord, NormalizedPayload},
    schema::{
        employee::{employee_policy, DEFAULT_ALGORITHM},
        EncryptionAlgorithm,
        EncryptionSchema,
        ObjectPolicy,
    },
};

pub use verify::VerificationReport;

/// The stages of a run, in order.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Stage {
    #[display("start")]
    Start,
    #[display("key resolved")]
    KeyResolved,
    #[display("schema built")]
    SchemaBuilt,
    #[display("clients ready")]
    ClientsReady,
    #[display("payload normalized")]
    PayloadNormalized,
    #[display("inserted")]
    Inserted,
    #[display("reported")]
    Reported,
}

/// A collection reached through the auto-encrypting client.
pub trait RecordStore: Send + Sync {
    /// Inserts one document and returns its `_id`.
    fn insert_one(&self, document: Document) -> BoxFuture<'_, Result<Bson>>;

    /// Reads a document by `_id`, decrypting its encrypted fields.
    fn find_by_id<'a>(&'a self, id: &'a Bson) -> BoxFuture<'a, Result<Option<Document>>>;

    /// Releases the store's client.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// The database access a run needs beyond the encrypted store.
pub trait Backend: Send + Sync {
    /// The key vault, read without automatic encryption.
    fn key_vault(&self) -> &dyn KeyVault;

    /// Unwraps `key_id` through the key management provider once, so that an unreachable or
    /// misconfigured provider fails the run before anything is written.
    fn check_kms<'a>(&'a self, key_id: &'a DataKeyId) -> BoxFuture<'a, Result<()>>;

    /// Builds the auto-encrypting client for `schema_map` and returns the target collection.
    fn open_secure_store(
        &self,
        schema_map: HashMap<String, Document>,
    ) -> BoxFuture<'_, Result<Box<dyn RecordStore>>>;

    /// Reads a document of the target collection by `_id` without decrypting it.
    fn find_raw_by_id<'a>(&'a self, id: &'a Bson) -> BoxFuture<'a, Result<Option<Document>>>;

    /// Decrypts every ciphertext in `document` explicitly.
    fn decrypt(&self, document: Document) -> BoxFuture<'_, Result<Document>>;
}

/// The outcome of a successful run.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct InsertReport {
    /// The `_id` generated for the inserted document.
    pub inserted_id: Bson,
    /// The data encryption key the schema was bound to.
    pub key_id: DataKeyId,
    /// Paths removed from the payload because they had no value.
    pub omitted: Vec<String>,
    /// The stages passed through.
    pub stages: Vec<Stage>,
    /// Present when read-back verification was requested.
    pub verification: Option<VerificationReport>,
}

impl InsertReport {
    /// The generated `_id` in its plain textual form.
    pub fn inserted_id_string(&self) -> String {
        match &self.inserted_id {
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    stages: Vec<Stage>,
}

impl Progress {
    fn start() -> Self {
        let mut progress = Self::default();
        progress.advance(Stage::Start);
        progress
    }

    fn advance(&mut self, stage: Stage) {
        tracing::info!(%stage, "workflow stage reached");
        self.stages.push(stage);
    }
}

struct Inserted {
    id: Bson,
    omitted: Vec<String>,
    verification: Option<VerificationReport>,
}

/// Runs the encrypted insert against one deployment.
#[derive(Clone, Debug)]
pub struct Workflow {
    config: WorkflowConfig,
    policy: ObjectPolicy,
    default_algorithm: EncryptionAlgorithm,
    verify: bool,
}

impl Workflow {
    /// A workflow writing employee records with the employee field policies.
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            policy: employee_policy(),
            default_algorithm: DEFAULT_ALGORITHM,
            verify: false,
        }
    }

    /// Replaces the field policy table and the schema's default algorithm.
    pub fn with_policy(
        mut self,
        policy: ObjectPolicy,
        default_algorithm: EncryptionAlgorithm,
    ) -> Self {
        self.policy = policy;
        self.default_algorithm = default_algorithm;
        self
    }

    /// Reads the document back after the insert and checks what was stored.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Inserts `record` into the target collection.
    pub async fn run(&self, record: &EmployeeRecord) -> Result<InsertReport> {
        self.run_document(record.to_document()?).await
    }

    /// Inserts an arbitrary document into the target collection.
    pub async fn run_document(&self, payload: Document) -> Result<InsertReport> {
        self.config.validate()?;
        tracing::debug!(
            uri = %self.config.connection.redacted_connection_string(),
            kms = self.config.kms.provider_name(),
            "connecting"
        );
        let backend = MongoBackend::connect(&self.config).await?;
        let result = self.drive(&backend, payload).await;
        backend.shutdown().await;
        result
    }

    /// Runs every stage against `backend`. The encrypted store opened here is closed before
    /// returning, whatever the outcome; `backend` is left to the caller.
    pub async fn drive(&self, backend: &dyn Backend, payload: Document) -> Result<InsertReport> {
        let mut progress = Progress::start();

        let alias = KeyAlias::new(self.config.key_vault.key_alias.as_str());
        let key_id = KeyLocator::new(
            backend.key_vault(),
            self.config.key_vault.duplicate_alias_policy,
        )
        .locate(&alias)
        .await?;
        tracing::info!(%alias, key_id = %key_id, "data encryption key resolved");
        progress.advance(Stage::KeyResolved);

        let schema = EncryptionSchema::new(key_id, self.default_algorithm, self.policy.clone())?;
        for encrypted in schema.encrypted_paths() {
            tracing::debug!(
                path = %encrypted.path,
                algorithm = %encrypted.algorithm,
                inherited = encrypted.inherited,
                "encrypted field"
            );
        }
        progress.advance(Stage::SchemaBuilt);

        backend.check_kms(schema.key_id()).await?;
        let store = backend
            .open_secure_store(schema.schema_map(&self.config.target))
            .await?;
        progress.advance(Stage::ClientsReady);

        let result = self
            .insert(backend, store.as_ref(), &schema, payload, &mut progress)
            .await;
        store.close().await;
        let inserted = result?;

        progress.advance(Stage::Reported);
        Ok(InsertReport {
            inserted_id: inserted.id,
            key_id: schema.key_id().clone(),
            omitted: inserted.omitted,
            stages: progress.stages,
            verification: inserted.verification,
        })
    }

    async fn insert(
        &self,
        backend: &dyn Backend,
        store: &dyn RecordStore,
        schema: &EncryptionSchema,
        payload: Document,
        progress: &mut Progress,
    ) -> Result<Inserted> {
        let payload = NormalizedPayload::new(payload, schema)?;
        for path in payload.omitted() {
            tracing::debug!(%path, "omitting field without a value");
        }
        let omitted = payload.omitted().to_vec();
        progress.advance(Stage::PayloadNormalized);

        let sent = payload.document().clone();
        let id = store.insert_one(payload.into_document()).await?;
        tracing::info!(inserted_id = %id, namespace = %self.config.target, "record inserted");
        progress.advance(Stage::Inserted);

        let verification = if self.verify {
            Some(verify::verify(backend, store, schema, &sent, &id).await?)
        } else {
            None
        };

        Ok(Inserted {
            id,
            omitted,
            verification,
        })
    }
}
