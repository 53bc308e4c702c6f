mod config;
mod payload;

use std::path::PathBuf;

use mongodb::bson::{spec::BinarySubtype, Binary, DateTime};

use crate::{
    config::{ConnectionConfig, CryptSharedConfig, KmsConfig, LocalKmsConfig, WorkflowConfig},
    key_vault::DataKeyId,
    payload::{Address, EmployeeRecord, PersonName},
};

pub(crate) type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// 96 bytes of key material, base64 encoded.
pub(crate) const LOCAL_MASTER_KEY: &str =
    "xPTAjBRG5JiPm+d3fj6XLi2q5DMXUS/f1f+SMAlhhwkhDRL0kr8r9GDLIGTAGlvC+HVjSIgdL+RKwZCvpXSyxTICWSXTU\
     YsWYPyu3IoHbuBZdmw2faM3WhcRIgbMReU5";

/// Log a message on stderr that won't be captured by `cargo test`.
pub(crate) fn log_uncaptured<S: AsRef<str>>(text: S) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    stderr.write_all(text.as_ref().as_bytes()).unwrap();
    stderr.write_all(b"\n").unwrap();
}

/// A path that is guaranteed to name an existing file.
pub(crate) fn existing_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml")
}

pub(crate) fn missing_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("no-such-file.pem")
}

/// A configuration that passes validation and uses the local KMS provider.
pub(crate) fn local_config() -> WorkflowConfig {
    WorkflowConfig::builder()
        .connection(
            ConnectionConfig::builder()
                .user("app_user")
                .password("secret")
                .host("localhost:27017")
                .tls_ca_file(existing_file())
                .build(),
        )
        .kms(KmsConfig::Local(
            LocalKmsConfig::builder()
                .master_key(LOCAL_MASTER_KEY)
                .build(),
        ))
        .crypt_shared(CryptSharedConfig::builder().lib_path(existing_file()).build())
        .build()
}

pub(crate) fn key_id(byte: u8) -> DataKeyId {
    DataKeyId::new(Binary {
        subtype: BinarySubtype::Uuid,
        bytes: vec![byte; 16],
    })
    .unwrap()
}

/// The sample employee, without other names.
pub(crate) fn employee() -> EmployeeRecord {
    EmployeeRecord::builder()
        .name(
            PersonName::builder()
                .first_name("Kuber")
                .last_name("Engineer")
                .build(),
        )
        .address(
            Address::builder()
                .street_address("12 Bson Street")
                .suburb_county("Mongoville")
                .state_province("Victoria")
                .zip_postcode("3999")
                .country("Oz")
                .build(),
        )
        .dob(DateTime::from_millis(916_099_200_000))
        .phone_number("1800MONGO")
        .salary(999_999.99)
        .tax_identifier("78SDSSWN001")
        .role(vec!["DEV".to_string()])
        .build()
}

/// The record written by a default run of `csfle-insert`: a non-ASCII last name, no other names.
pub(crate) fn magnus() -> EmployeeRecord {
    EmployeeRecord::builder()
        .name(
            PersonName::builder()
                .first_name("Magnus")
                .last_name("Stråle")
                .build(),
        )
        .address(
            Address::builder()
                .street_address("29 Bson Street")
                .suburb_county("Mongoville")
                .state_province("Victoria")
                .zip_postcode("3999")
                .country("Oz")
                .build(),
        )
        .dob(DateTime::parse_rfc3339_str("1999-01-12T00:00:00Z").unwrap())
        .phone_number("1800MONGO")
        .salary(999_999.99)
        .tax_identifier("78SDSSWN001")
        .role(vec!["Student".to_string()])
        .build()
}
