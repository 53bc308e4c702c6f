//! Configuration for the encrypted insert workflow.
//!
//! A [`WorkflowConfig`] is built once, either programmatically through its builder or by layering
//! a TOML/JSON file with `CSFLE_`-prefixed environment variables, and is then passed by value into
//! the workflow. Nested keys are separated by `__` in environment variables, e.g.
//! `CSFLE_CONNECTION__PASSWORD` or `CSFLE_KMS__ENDPOINT`.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use base64::Engine;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use mongodb::{
    bson::{doc, Document},
    Namespace,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use typed_builder::TypedBuilder;

use crate::{
    error::{ConfigInput, Error, Result},
    key_vault::DuplicateAliasPolicy,
};

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "CSFLE";

/// The configuration file read by the binary when no other path is given.
pub const DEFAULT_CONFIG_FILE_PATH: &str = "csfle.toml";

const LOCAL_MASTER_KEY_LEN: usize = 96;

// RFC 3986 unreserved characters are left as-is.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Everything needed to run one encrypted insert.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct WorkflowConfig {
    /// How to reach the database deployment.
    pub connection: ConnectionConfig,

    /// Where data encryption keys live and which one to use.
    #[serde(default)]
    #[builder(default)]
    pub key_vault: KeyVaultConfig,

    /// The key management provider holding the master key.
    pub kms: KmsConfig,

    /// The local encryption engine. There is no fallback to mongocryptd, so the section is
    /// mandatory.
    pub crypt_shared: CryptSharedConfig,

    /// The collection the encrypted record is written to.
    #[serde(default = "default_target")]
    #[builder(default = default_target())]
    pub target: Namespace,

    /// Logging output.
    #[serde(default)]
    #[builder(default)]
    pub log: LogConfig,
}

fn default_target() -> Namespace {
    Namespace::new("companyData", "employee")
}

impl WorkflowConfig {
    /// Loads the configuration from `path` (TOML, JSON, or any format the file extension names),
    /// overridden by `CSFLE_` environment variables. A missing file is not an error as long as the
    /// environment supplies every required value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from(path.as_ref()).required(false)))
    }

    /// Parses the configuration from a string in the given format, overridden by `CSFLE_`
    /// environment variables.
    pub fn parse(contents: &str, format: FileFormat) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(contents, format)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .separator("__")
            .prefix_separator("_");

        builder
            .add_source(env)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(config_error)
    }

    /// Checks everything that can be checked without touching the network: referenced files exist,
    /// namespaces are complete, and key material is well formed.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        check_namespace(&self.key_vault.namespace, ConfigInput::KeyVaultNamespace)?;
        check_namespace(&self.target, ConfigInput::TargetNamespace)?;
        if self.key_vault.key_alias.trim().is_empty() {
            return Err(Error::invalid_configuration(
                ConfigInput::KeyAlias,
                "key alias must not be empty",
            ));
        }
        self.kms.validate()?;
        self.crypt_shared.validate()
    }
}

fn config_error(err: config::ConfigError) -> Error {
    let message = err.to_string();
    let input = match &err {
        config::ConfigError::NotFound(key) => ConfigInput::Field(key.clone()),
        _ => missing_field_name(&message)
            .map(ConfigInput::Field)
            .unwrap_or(ConfigInput::ConfigFile),
    };
    Error::invalid_configuration(input, message)
}

fn missing_field_name(message: &str) -> Option<String> {
    let rest = message.split("missing field `").nth(1)?;
    rest.split('`').next().map(str::to_string)
}

fn check_namespace(namespace: &Namespace, input: ConfigInput) -> Result<()> {
    if namespace.db.is_empty() || namespace.coll.is_empty() {
        return Err(Error::invalid_configuration(
            input,
            format!("{namespace:?} must name both a database and a collection"),
        ));
    }
    Ok(())
}

fn check_file(path: &Path, input: ConfigInput) -> Result<()> {
    if !path.is_file() {
        return Err(Error::invalid_configuration(
            input,
            format!("{} does not exist or is not a file", path.display()),
        ));
    }
    Ok(())
}

fn encode(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT).to_string()
}

/// Parameters of the database connection shared by the plain and the encrypted client.
#[serde_as]
#[derive(Clone, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// `mongodb` or `mongodb+srv`.
    #[serde(default = "default_scheme")]
    #[builder(default = default_scheme())]
    pub scheme: String,

    /// The database user.
    pub user: String,

    /// The database user's password.
    pub password: String,

    /// Host (and optional port) of the deployment.
    pub host: String,

    /// How long to wait for a suitable server before failing an operation.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "server_selection_timeout_ms",
        default = "default_server_selection_timeout"
    )]
    #[builder(default = default_server_selection_timeout())]
    pub server_selection_timeout: Duration,

    /// CA bundle used to verify the deployment's certificate.
    pub tls_ca_file: PathBuf,

    /// Name of the replica set to connect to.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub replica_set: Option<String>,

    /// Application name reported to the server.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub app_name: Option<String>,
}

fn default_scheme() -> String {
    "mongodb".to_string()
}

fn default_server_selection_timeout() -> Duration {
    Duration::from_millis(5000)
}

impl ConnectionConfig {
    /// Renders the connection string used by both clients.
    pub fn connection_string(&self) -> String {
        self.render(&encode(&self.password))
    }

    /// Renders the connection string with the password masked, for logs and diagnostics.
    pub fn redacted_connection_string(&self) -> String {
        self.render("*****")
    }

    fn render(&self, password: &str) -> String {
        let mut uri = format!(
            "{}://{}:{}@{}/?serverSelectionTimeoutMS={}&tls=true&tlsCAFile={}",
            self.scheme,
            encode(&self.user),
            password,
            self.host,
            self.server_selection_timeout.as_millis(),
            encode(&self.tls_ca_file.to_string_lossy()),
        );
        if let Some(replica_set) = &self.replica_set {
            uri.push_str("&replicaSet=");
            uri.push_str(&encode(replica_set));
        }
        if let Some(app_name) = &self.app_name {
            uri.push_str("&appName=");
            uri.push_str(&encode(app_name));
        }
        uri
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.scheme.as_str(), "mongodb" | "mongodb+srv") {
            return Err(Error::invalid_configuration(
                ConfigInput::ConnectionString,
                format!("unsupported scheme {:?}", self.scheme),
            ));
        }
        if self.user.is_empty() || self.host.is_empty() {
            return Err(Error::invalid_configuration(
                ConfigInput::ConnectionString,
                "user and host are required",
            ));
        }
        if self.host.contains('/') || self.host.contains('@') {
            return Err(Error::invalid_configuration(
                ConfigInput::ConnectionString,
                format!("host {:?} must not contain '/' or '@'", self.host),
            ));
        }
        check_file(&self.tls_ca_file, ConfigInput::CaFile)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("uri", &self.redacted_connection_string())
            .finish()
    }
}

/// Location of the key vault collection and the key to look up in it.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct KeyVaultConfig {
    /// The key vault collection.
    #[serde(default = "default_key_vault_namespace")]
    #[builder(default = default_key_vault_namespace())]
    pub namespace: Namespace,

    /// The key alt name of the data encryption key.
    #[serde(default = "default_key_alias")]
    #[builder(default = default_key_alias())]
    pub key_alias: String,

    /// What to do when the alias matches more than one key.
    #[serde(default)]
    #[builder(default)]
    pub duplicate_alias_policy: DuplicateAliasPolicy,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_key_vault_namespace() -> Namespace {
    Namespace::new("__encryption", "__keyVault")
}

fn default_key_alias() -> String {
    "dataKey1".to_string()
}

/// The key management provider wrapping the data encryption keys.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
#[non_exhaustive]
pub enum KmsConfig {
    /// A KMIP server reached over mutually authenticated TLS.
    Kmip(KmipConfig),
    /// A master key held in the configuration. Only suitable for test deployments.
    Local(LocalKmsConfig),
}

impl KmsConfig {
    /// The provider name as it appears in the KMS provider map.
    pub fn provider_name(&self) -> &'static str {
        match self {
            KmsConfig::Kmip(_) => "kmip",
            KmsConfig::Local(_) => "local",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            KmsConfig::Kmip(kmip) => kmip.validate(),
            KmsConfig::Local(local) => local.key_bytes().map(|_| ()),
        }
    }
}

/// Settings of a KMIP key management endpoint.
#[derive(Clone, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct KmipConfig {
    /// Host (and optional port) of the KMIP server.
    pub endpoint: String,

    /// CA bundle used to verify the KMIP server.
    pub tls_ca_file: PathBuf,

    /// PEM file holding the client certificate and its private key.
    pub tls_certificate_key_file: PathBuf,

    /// Password protecting the private key in `tls_certificate_key_file`.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub tls_certificate_key_password: Option<String>,
}

impl KmipConfig {
    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::invalid_configuration(
                ConfigInput::KmsProvider,
                "kmip endpoint must not be empty",
            ));
        }
        check_file(&self.tls_ca_file, ConfigInput::KmsCaFile)?;
        check_file(&self.tls_certificate_key_file, ConfigInput::KmsCertificate)
    }
}

impl fmt::Debug for KmipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmipConfig")
            .field("endpoint", &self.endpoint)
            .field("tls_ca_file", &self.tls_ca_file)
            .field("tls_certificate_key_file", &self.tls_certificate_key_file)
            .field(
                "tls_certificate_key_password",
                &self.tls_certificate_key_password.as_ref().map(|_| "*****"),
            )
            .finish()
    }
}

/// A locally held master key.
#[derive(Clone, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct LocalKmsConfig {
    /// Base64 encoding of the 96-byte master key.
    #[builder(setter(into))]
    pub master_key: String,
}

impl LocalKmsConfig {
    /// Decodes the master key, checking its length.
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.master_key.trim())
            .map_err(|e| {
                Error::invalid_configuration(
                    ConfigInput::KmsProvider,
                    format!("local master key is not valid base64: {e}"),
                )
            })?;
        if bytes.len() != LOCAL_MASTER_KEY_LEN {
            return Err(Error::invalid_configuration(
                ConfigInput::KmsProvider,
                format!(
                    "local master key must be {LOCAL_MASTER_KEY_LEN} bytes, got {}",
                    bytes.len()
                ),
            ));
        }
        Ok(bytes)
    }
}

impl fmt::Debug for LocalKmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKmsConfig")
            .field("master_key", &"*****")
            .finish()
    }
}

/// The crypt_shared library used for automatic encryption.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct CryptSharedConfig {
    /// Absolute path of the `mongo_crypt_v1` shared library.
    #[builder(setter(into))]
    pub lib_path: PathBuf,

    /// Fail client construction if the library cannot be loaded instead of falling back to
    /// mongocryptd.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub required: bool,

    /// Do not spawn mongocryptd.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub mongocryptd_bypass_spawn: bool,
}

fn default_true() -> bool {
    true
}

impl CryptSharedConfig {
    /// The driver's extra options selecting this library.
    pub fn extra_options(&self) -> Document {
        doc! {
            "cryptSharedLibPath": self.lib_path.to_string_lossy().into_owned(),
            "cryptSharedRequired": self.required,
            "mongocryptdBypassSpawn": self.mongocryptd_bypass_spawn,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.required {
            check_file(&self.lib_path, ConfigInput::CryptSharedLib)?;
        }
        Ok(())
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    #[builder(default = default_log_level(), setter(into))]
    pub level: String,

    /// Output format.
    #[serde(default)]
    #[builder(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}
