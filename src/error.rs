//! Contains the `Error` and `Result` types that `csfle_workflow` uses.

use derive_more::Display;
use thiserror::Error;

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while configuring or running the encrypted insert workflow. The inner
/// [`ErrorKind`] is boxed to keep `Result` small.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    pub(crate) fn invalid_configuration(input: ConfigInput, message: impl Into<String>) -> Self {
        ErrorKind::InvalidConfiguration {
            input,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn key_not_found(alias: impl Into<String>) -> Self {
        ErrorKind::KeyNotFound {
            alias: alias.into(),
        }
        .into()
    }

    pub(crate) fn invalid_payload(message: impl Into<String>) -> Self {
        ErrorKind::InvalidPayload {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn verification(path: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorKind::Verification {
            path: path.into(),
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn client_construction(role: ClientRole, source: mongodb::error::Error) -> Self {
        let input = suspect_input(role, &source);
        ErrorKind::ClientConstruction {
            role,
            input,
            source,
        }
        .into()
    }

    /// The key management provider could not be reached or refused the client while the
    /// encrypting client was being prepared.
    pub(crate) fn kms_unavailable(source: mongodb::error::Error) -> Self {
        let input = if mentions_certificate(&source) {
            ConfigInput::KmsCertificate
        } else {
            ConfigInput::KmsProvider
        };
        ErrorKind::ClientConstruction {
            role: ClientRole::Encrypted,
            input: Some(input),
            source,
        }
        .into()
    }

    pub(crate) fn encryption(path: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorKind::Encryption {
            path: path.into(),
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was caused by a key alias that resolved to no data encryption key.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::KeyNotFound { .. })
    }

    /// The configuration input this error blames, if any.
    pub fn config_input(&self) -> Option<&ConfigInput> {
        match self.kind.as_ref() {
            ErrorKind::InvalidConfiguration { input, .. } => Some(input),
            ErrorKind::ClientConstruction { input, .. } => input.as_ref(),
            _ => None,
        }
    }

    /// Classifies this error according to where in the workflow it can arise.
    pub fn class(&self) -> ErrorClass {
        match self.kind.as_ref() {
            ErrorKind::InvalidConfiguration { .. } | ErrorKind::InvalidPayload { .. } => {
                ErrorClass::Configuration
            }
            ErrorKind::ClientConstruction { input: Some(_), .. } => ErrorClass::Configuration,
            ErrorKind::KeyNotFound { .. }
            | ErrorKind::DuplicateKeyAlias { .. }
            | ErrorKind::InvalidKeyDocument { .. } => ErrorClass::KeyResolution,
            ErrorKind::ClientConstruction { input: None, .. }
            | ErrorKind::KeyLookup(_)
            | ErrorKind::Insert(_)
            | ErrorKind::ReadBack(_)
            | ErrorKind::Encryption { .. }
            | ErrorKind::Decryption { .. }
            | ErrorKind::Verification { .. } => ErrorClass::Transport,
        }
    }

    /// A short, human-readable label for the step that failed.
    pub fn diagnostic(&self) -> &'static str {
        match self.kind.as_ref() {
            ErrorKind::InvalidConfiguration { .. } => "invalid configuration",
            ErrorKind::KeyNotFound { .. } => "key not found",
            ErrorKind::DuplicateKeyAlias { .. } => "ambiguous key alias",
            ErrorKind::InvalidKeyDocument { .. } => "invalid key document",
            ErrorKind::KeyLookup(_) => "key lookup failed",
            ErrorKind::ClientConstruction { .. } => "client construction failed",
            ErrorKind::InvalidPayload { .. } => "invalid payload",
            ErrorKind::Insert(_) => "insert failed",
            ErrorKind::ReadBack(_) => "read back failed",
            ErrorKind::Encryption { .. } => "encryption failed",
            ErrorKind::Decryption { .. } => "decryption failed",
            ErrorKind::Verification { .. } => "verification failed",
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A configuration input was missing or invalid.
    #[error("Invalid {input}: {message}")]
    #[non_exhaustive]
    InvalidConfiguration {
        /// The input at fault.
        input: ConfigInput,
        /// What is wrong with it.
        message: String,
    },

    /// The key alias did not match any document in the key vault.
    #[error("No data encryption key found with key alt name {alias:?}")]
    #[non_exhaustive]
    KeyNotFound {
        /// The key alt name looked up.
        alias: String,
    },

    /// The key alias matched more than one document in the key vault.
    #[error("Key alt name {alias:?} matches {count} data encryption keys")]
    #[non_exhaustive]
    DuplicateKeyAlias {
        /// The key alt name looked up.
        alias: String,
        /// How many key documents carry it, at most two.
        count: usize,
    },

    /// The key vault returned a document whose `_id` is not a UUID binary.
    #[error("Key vault document for {alias:?} is invalid: {message}")]
    #[non_exhaustive]
    InvalidKeyDocument {
        /// The key alt name looked up.
        alias: String,
        /// What is wrong with the document.
        message: String,
    },

    /// The key vault query failed.
    #[error("Key vault query failed: {0}")]
    KeyLookup(mongodb::error::Error),

    /// A database client could not be built or could not reach the deployment.
    #[error("{}", describe_client_construction(*role, input.as_ref(), source))]
    #[non_exhaustive]
    ClientConstruction {
        /// Which of the two clients failed.
        role: ClientRole,
        /// The configuration input most likely at fault, when one can be told.
        input: Option<ConfigInput>,
        /// The driver error.
        source: mongodb::error::Error,
    },

    /// The record could not be turned into an insertable document.
    #[error("Invalid payload: {message}")]
    #[non_exhaustive]
    InvalidPayload {
        /// What is wrong with the payload.
        message: String,
    },

    /// The insert was rejected by the driver or the server.
    #[error("Insert failed: {0}")]
    Insert(mongodb::error::Error),

    /// The inserted document could not be read back.
    #[error("Reading back the inserted document failed: {0}")]
    ReadBack(mongodb::error::Error),

    /// A value could not be encrypted explicitly.
    #[error("Encryption of {path} failed: {message}")]
    #[non_exhaustive]
    Encryption {
        /// Dotted path of the field.
        path: String,
        /// The cause, without the value.
        message: String,
    },

    /// A ciphertext value could not be decrypted.
    #[error("Decryption failed: {message}")]
    #[non_exhaustive]
    Decryption {
        /// The cause, without the value.
        message: String,
    },

    /// The stored document does not match what was sent.
    #[error("Verification failed at {path}: {message}")]
    #[non_exhaustive]
    Verification {
        /// Dotted path of the mismatching field.
        path: String,
        /// How it differs, without the values.
        message: String,
    },
}

fn describe_client_construction(
    role: ClientRole,
    input: Option<&ConfigInput>,
    source: &mongodb::error::Error,
) -> String {
    match input {
        Some(input) => {
            format!("Failed to construct the {role} client (check the {input}): {source}")
        }
        None => format!("Failed to construct the {role} client: {source}"),
    }
}

/// The configuration input behind a client construction failure, if the driver error names one.
/// Network and server errors blame no input.
fn suspect_input(role: ClientRole, err: &mongodb::error::Error) -> Option<ConfigInput> {
    use mongodb::error::ErrorKind as DriverErrorKind;

    match err.kind.as_ref() {
        DriverErrorKind::InvalidTlsConfig { .. } => Some(match role {
            ClientRole::Plain => ConfigInput::CaFile,
            ClientRole::Encrypted => ConfigInput::KmsCertificate,
        }),
        DriverErrorKind::InvalidArgument { message, .. } => input_named_by(message),
        DriverErrorKind::Encryption(e) => input_named_by(&e.to_string()),
        _ => None,
    }
}

fn input_named_by(message: &str) -> Option<ConfigInput> {
    if message.contains("crypt_shared") || message.contains("cryptShared") {
        Some(ConfigInput::CryptSharedLib)
    } else if message.contains("schema") {
        Some(ConfigInput::Schema)
    } else if message.contains("kms") || message.contains("KMS") {
        Some(ConfigInput::KmsProvider)
    } else {
        None
    }
}

fn mentions_certificate(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind as DriverErrorKind;

    if matches!(err.kind.as_ref(), DriverErrorKind::InvalidTlsConfig { .. }) {
        return true;
    }
    let message = err.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "pem", "handshake"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// A configuration input that can be reported as invalid.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigInput {
    /// The configuration file or one of its sources.
    #[display("configuration file")]
    ConfigFile,
    /// A named field of the configuration.
    #[display("configuration field `{_0}`")]
    Field(String),
    /// The database connection string or its parts.
    #[display("connection string")]
    ConnectionString,
    /// The CA bundle used to verify the database server.
    #[display("CA file")]
    CaFile,
    /// The key management provider settings.
    #[display("KMS provider settings")]
    KmsProvider,
    /// The CA bundle used to verify the key management endpoint.
    #[display("KMS CA file")]
    KmsCaFile,
    /// The client certificate presented to the key management endpoint.
    #[display("KMS client certificate")]
    KmsCertificate,
    /// The local encryption engine.
    #[display("crypt_shared library")]
    CryptSharedLib,
    /// The key vault namespace.
    #[display("key vault namespace")]
    KeyVaultNamespace,
    /// The key alias.
    #[display("key alias")]
    KeyAlias,
    /// The namespace of the encrypted collection.
    #[display("target namespace")]
    TargetNamespace,
    /// The encryption schema.
    #[display("encryption schema")]
    Schema,
}

/// Which of the two database clients an error concerns.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ClientRole {
    /// The client without automatic encryption, used for the key vault.
    #[display("plain")]
    Plain,
    /// The client with automatic encryption enabled.
    #[display("encrypted")]
    Encrypted,
}

/// The coarse error taxonomy of the workflow. No class is retried.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad connection string, missing certificate or library files, malformed schema.
    #[display("configuration error")]
    Configuration,
    /// The key alias could not be resolved to exactly one data encryption key.
    #[display("key resolution error")]
    KeyResolution,
    /// TLS handshake, server selection, or write failures.
    #[display("transport error")]
    Transport,
}

impl ErrorClass {
    /// The process exit code reported for this class of error.
    pub fn exit_code(self) -> exitcode::ExitCode {
        match self {
            ErrorClass::Configuration => exitcode::CONFIG,
            ErrorClass::KeyResolution => exitcode::DATAERR,
            ErrorClass::Transport => exitcode::UNAVAILABLE,
        }
    }
}
