//! This crate writes a single employee record into a MongoDB collection with client-side field
//! level encryption.
//!
//! A run of the [`Workflow`]:
//!
//! 1. resolves the key alt name `dataKey1` to the `_id` of a data encryption key by querying the
//!    key vault with a client that does not encrypt;
//! 2. builds a JSON schema from the typed field policies of [`schema::employee`], binding every
//!    encrypted field to that key;
//! 3. reaches the KMIP (or, for tests, local) key management provider once, then builds a second
//!    client with automatic encryption that requires the crypt_shared library;
//! 4. removes fields without a value from the payload, so that "no value" is always represented
//!    by absence rather than by BSON null;
//! 5. inserts the record and reports the generated `_id`.
//!
//! # Configuration
//!
//! [`WorkflowConfig`] is read from a TOML or JSON file and `CSFLE_`-prefixed environment
//! variables:
//!
//! ```toml
//! [connection]
//! user = "app_user"
//! password = "secret"
//! host = "mongodb.example.com:27017"
//! tls_ca_file = "/etc/pki/ca.pem"
//!
//! [kms]
//! provider = "kmip"
//! endpoint = "kmip.example.com:5696"
//! tls_ca_file = "/etc/pki/ca.pem"
//! tls_certificate_key_file = "/etc/pki/client.pem"
//!
//! [crypt_shared]
//! lib_path = "/opt/mongodb/lib/mongo_crypt_v1.so"
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> csfle_workflow::error::Result<()> {
//! use csfle_workflow::{payload::EmployeeRecord, Workflow, WorkflowConfig};
//!
//! let config = WorkflowConfig::load("csfle.toml")?;
//! # let record: EmployeeRecord = unimplemented!();
//! let report = Workflow::new(config).run(&record).await?;
//! println!("{}", report.inserted_id_string());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod key_vault;
pub mod log;
pub mod payload;
pub mod schema;
pub mod workflow;

#[cfg(test)]
mod test;

pub use ::mongodb;

pub use crate::{
    config::WorkflowConfig,
    error::{Error, ErrorKind, Result},
    workflow::{InsertReport, Workflow},
};
