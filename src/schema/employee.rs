//! The field policy table of `companyData.employee`.

use super::{BsonType, EncryptionAlgorithm, ObjectPolicy};

/// Fields without an explicit algorithm are encrypted randomly.
pub const DEFAULT_ALGORITHM: EncryptionAlgorithm = EncryptionAlgorithm::Random;

/// Field policies of an employee record.
///
/// First and last names are deterministic so records can be looked up by name. Other names
/// inherit the default algorithm. The address is a single opaque ciphertext. Date of birth,
/// phone number, salary and tax identifier are randomized as they are never queried. Roles are
/// stored in plaintext.
pub fn employee_policy() -> ObjectPolicy {
    ObjectPolicy::builder()
        .object("name", |name| {
            name.deterministic("firstName", BsonType::String)
                .deterministic("lastName", BsonType::String)
                .encrypted("otherNames", BsonType::String)
        })
        .encrypted_object("address")
        .randomized("dob", BsonType::Date)
        .randomized("phoneNumber", BsonType::String)
        .randomized("salary", BsonType::Double)
        .randomized("taxIdentifier", BsonType::String)
        .plaintext("role")
        .build()
}
