//! Construction of the plain and the auto-encrypting database clients.
//!
//! Both clients are built from the same connection string. The plain client reads the key vault
//! and serves as the key vault client of the encrypting one, which encrypts the fields named by
//! the schema map with the crypt_shared library and the configured KMS provider.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use futures_util::{future::BoxFuture, FutureExt};
use mongodb::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    client_encryption::ClientEncryption,
    mongocrypt::ctx::KmsProvider,
    options::{ClientOptions, TlsOptions},
    Client,
    Collection,
};

use crate::{
    config::{KmsConfig, WorkflowConfig},
    decrypt::ExplicitDecryptor,
    encrypt::{ExplicitEncryptor, ValueEncrypter},
    error::{ClientRole, ConfigInput, Error, ErrorKind, Result},
    key_vault::{DataKeyId, KeyVault},
    payload::{EmployeeRecord, NormalizedPayload},
    schema::{EncryptionAlgorithm, EncryptionSchema},
    workflow::{Backend, RecordStore},
};

// Encrypted once before the encrypting client is used, to reach the KMS early.
const KMS_CHECK_VALUE: &str = "kms check";

/// A KMS provider entry as accepted by the encrypted client builder.
pub type KmsProviderEntry = (KmsProvider, Document, Option<TlsOptions>);

/// Translates the KMS settings into the driver's provider list.
pub fn kms_providers(kms: &KmsConfig) -> Result<Vec<KmsProviderEntry>> {
    let entry = match kms {
        KmsConfig::Kmip(kmip) => {
            let tls = match &kmip.tls_certificate_key_password {
                Some(password) => TlsOptions::builder()
                    .ca_file_path(kmip.tls_ca_file.clone())
                    .cert_key_file_path(kmip.tls_certificate_key_file.clone())
                    .tls_certificate_key_file_password(password.as_bytes().to_vec())
                    .build(),
                None => TlsOptions::builder()
                    .ca_file_path(kmip.tls_ca_file.clone())
                    .cert_key_file_path(kmip.tls_certificate_key_file.clone())
                    .build(),
            };
            (
                KmsProvider::kmip(),
                doc! { "endpoint": kmip.endpoint.as_str() },
                Some(tls),
            )
        }
        KmsConfig::Local(local) => (
            KmsProvider::local(),
            doc! {
                "key": Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: local.key_bytes()?,
                },
            },
            None,
        ),
    };
    Ok(vec![entry])
}

/// Builds the clients of a run.
#[derive(Clone, Copy, Debug)]
pub struct SecureClientFactory<'a> {
    config: &'a WorkflowConfig,
}

impl<'a> SecureClientFactory<'a> {
    /// Creates a factory for `config`.
    pub fn new(config: &'a WorkflowConfig) -> Self {
        Self { config }
    }

    async fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(self.config.connection.connection_string())
            .await
            .map_err(|e| {
                Error::invalid_configuration(ConfigInput::ConnectionString, e.to_string())
            })?;
        options.server_selection_timeout = Some(self.config.connection.server_selection_timeout);
        Ok(options)
    }

    /// Builds the client without automatic encryption and checks that the deployment answers.
    pub async fn plain_client(&self) -> Result<Client> {
        let client = Client::with_options(self.client_options().await?)
            .map_err(|e| Error::client_construction(ClientRole::Plain, e))?;
        ping(client, ClientRole::Plain).await
    }

    /// Builds the auto-encrypting client, using `key_vault_client` to fetch data encryption keys.
    /// The crypt_shared library is always configured explicitly, so the driver never falls back
    /// to mongocryptd unless the configuration allows it.
    pub async fn encrypted_client(
        &self,
        key_vault_client: &Client,
        schema_map: HashMap<String, Document>,
    ) -> Result<Client> {
        let crypt_shared = &self.config.crypt_shared;
        if !crypt_shared.required {
            tracing::warn!(
                lib_path = %crypt_shared.lib_path.display(),
                bypass_spawn = crypt_shared.mongocryptd_bypass_spawn,
                "crypt_shared is not required; a running mongocryptd may be used instead"
            );
        }
        let options = self.client_options().await?;
        let client = Client::encrypted_builder(
            options,
            self.config.key_vault.namespace.clone(),
            kms_providers(&self.config.kms)?,
        )
        .map_err(|e| Error::client_construction(ClientRole::Encrypted, e))?
        .key_vault_client(key_vault_client.clone())
        .schema_map(schema_map)
        .extra_options(crypt_shared.extra_options())
        .build()
        .await
        .map_err(|e| Error::client_construction(ClientRole::Encrypted, e))?;
        ping(client, ClientRole::Encrypted).await
    }

    /// Builds the handle for explicit encryption and decryption, reading data encryption keys
    /// through `key_vault_client`.
    pub fn client_encryption(&self, key_vault_client: &Client) -> Result<ClientEncryption> {
        ClientEncryption::new(
            key_vault_client.clone(),
            self.config.key_vault.namespace.clone(),
            kms_providers(&self.config.kms)?,
        )
        .map_err(|e| Error::client_construction(ClientRole::Encrypted, e))
    }
}

async fn ping(client: Client, role: ClientRole) -> Result<Client> {
    match client
        .database("admin")
        .run_command(doc! { "hello": 1 })
        .await
    {
        Ok(_) => {
            tracing::debug!(%role, "client connected");
            Ok(client)
        }
        Err(e) => {
            client.shutdown().await;
            Err(Error::client_construction(role, e))
        }
    }
}

/// The deployment as seen through the plain client.
pub struct MongoBackend {
    config: WorkflowConfig,
    plain: Client,
    key_vault: Collection<Document>,
    explicit: OnceLock<Arc<ClientEncryption>>,
}

impl MongoBackend {
    /// Connects the plain client and prepares key vault access.
    pub async fn connect(config: &WorkflowConfig) -> Result<Self> {
        let plain = SecureClientFactory::new(config).plain_client().await?;
        let namespace = &config.key_vault.namespace;
        let key_vault = plain
            .database(&namespace.db)
            .collection::<Document>(&namespace.coll);
        Ok(Self {
            config: config.clone(),
            plain,
            key_vault,
            explicit: OnceLock::new(),
        })
    }

    /// The client without automatic encryption.
    pub fn plain_client(&self) -> &Client {
        &self.plain
    }

    /// The explicit encryption handle, built on first use.
    pub fn client_encryption(&self) -> Result<Arc<ClientEncryption>> {
        if let Some(encryption) = self.explicit.get() {
            return Ok(encryption.clone());
        }
        let encryption =
            Arc::new(SecureClientFactory::new(&self.config).client_encryption(&self.plain)?);
        Ok(self.explicit.get_or_init(|| encryption).clone())
    }

    /// A decryptor for documents read through the plain client.
    pub fn decryptor(&self) -> Result<ExplicitDecryptor> {
        Ok(ExplicitDecryptor::new(self.client_encryption()?))
    }

    /// Shuts the plain client down.
    pub async fn shutdown(self) {
        let Self {
            plain, explicit, ..
        } = self;
        drop(explicit);
        plain.shutdown().await;
    }

    /// Opens the encrypted store directly, outside of a workflow run.
    pub async fn open_store(
        &self,
        schema_map: HashMap<String, Document>,
    ) -> Result<EncryptedStore> {
        let client = SecureClientFactory::new(&self.config)
            .encrypted_client(&self.plain, schema_map)
            .await?;
        let target = &self.config.target;
        let collection = client.database(&target.db).collection(&target.coll);
        Ok(EncryptedStore { client, collection })
    }

    /// Encrypts the fields of `payload` named by `schema` explicitly and inserts the result
    /// through the plain client. Returns the generated `_id`.
    pub async fn insert_explicit(
        &self,
        schema: &EncryptionSchema,
        payload: &NormalizedPayload,
    ) -> Result<Bson> {
        let encryption = self.client_encryption()?;
        let document = ExplicitEncryptor::new(encryption.as_ref(), schema)
            .encrypt_document(payload)
            .await?;
        let result = self
            .raw_target()
            .insert_one(document)
            .await
            .map_err(ErrorKind::Insert)?;
        Ok(result.inserted_id)
    }

    /// Finds a document through the plain client by the value of a deterministically encrypted
    /// field. The document is returned as stored, still encrypted.
    pub async fn find_explicit(
        &self,
        schema: &EncryptionSchema,
        path: &str,
        value: impl Into<Bson>,
    ) -> Result<Option<Document>> {
        let encryption = self.client_encryption()?;
        let filter = ExplicitEncryptor::new(encryption.as_ref(), schema)
            .equality_filter(path, value)
            .await?;
        self.raw_target()
            .find_one(filter)
            .await
            .map_err(|e| ErrorKind::ReadBack(e).into())
    }

    fn raw_target(&self) -> Collection<Document> {
        let target = &self.config.target;
        self.plain.database(&target.db).collection(&target.coll)
    }
}

impl Backend for MongoBackend {
    fn key_vault(&self) -> &dyn KeyVault {
        &self.key_vault
    }

    fn check_kms<'a>(&'a self, key_id: &'a DataKeyId) -> BoxFuture<'a, Result<()>> {
        async move {
            let encryption = self.client_encryption()?;
            encryption
                .encrypt_value(
                    Bson::from(KMS_CHECK_VALUE),
                    key_id,
                    EncryptionAlgorithm::Random,
                )
                .await
                .map_err(Error::kms_unavailable)?;
            tracing::debug!(
                kms = self.config.kms.provider_name(),
                "key management provider reached"
            );
            Ok(())
        }
        .boxed()
    }

    fn open_secure_store(
        &self,
        schema_map: HashMap<String, Document>,
    ) -> BoxFuture<'_, Result<Box<dyn RecordStore>>> {
        async move {
            let store = self.open_store(schema_map).await?;
            Ok(Box::new(store) as Box<dyn RecordStore>)
        }
        .boxed()
    }

    fn find_raw_by_id<'a>(&'a self, id: &'a Bson) -> BoxFuture<'a, Result<Option<Document>>> {
        async move {
            self.raw_target()
                .find_one(doc! { "_id": id.clone() })
                .await
                .map_err(|e| ErrorKind::ReadBack(e).into())
        }
        .boxed()
    }

    fn decrypt(&self, document: Document) -> BoxFuture<'_, Result<Document>> {
        async move { self.decryptor()?.decrypt_document(document).await }.boxed()
    }
}

/// The target collection reached through the auto-encrypting client.
pub struct EncryptedStore {
    client: Client,
    collection: Collection<Document>,
}

impl EncryptedStore {
    /// Finds an employee by first name. The name is encrypted deterministically, so the filter
    /// value is encrypted before it is sent and matches the stored ciphertext.
    pub async fn find_by_first_name(&self, first_name: &str) -> Result<Option<EmployeeRecord>> {
        let found = self
            .collection
            .clone_with_type::<EmployeeRecord>()
            .find_one(doc! { "name.firstName": first_name })
            .await
            .map_err(ErrorKind::ReadBack)?;
        Ok(found)
    }

    /// Shuts the encrypting client down.
    pub async fn shutdown(self) {
        self.client.shutdown().await;
    }
}

impl RecordStore for EncryptedStore {
    fn insert_one(&self, document: Document) -> BoxFuture<'_, Result<Bson>> {
        async move {
            let result = self
                .collection
                .insert_one(document)
                .await
                .map_err(ErrorKind::Insert)?;
            Ok(result.inserted_id)
        }
        .boxed()
    }

    fn find_by_id<'a>(&'a self, id: &'a Bson) -> BoxFuture<'a, Result<Option<Document>>> {
        async move {
            self.collection
                .find_one(doc! { "_id": id.clone() })
                .await
                .map_err(|e| ErrorKind::ReadBack(e).into())
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        (*self).shutdown().boxed()
    }
}
