use mongodb::bson::{doc, Bson};
use pretty_assertions::assert_eq;

use super::{employee, key_id};
use crate::{
    error::ErrorKind,
    payload::{lookup, NormalizedPayload, PersonName},
    schema::{
        employee::{employee_policy, DEFAULT_ALGORITHM},
        EncryptionSchema,
    },
};

fn schema() -> EncryptionSchema {
    EncryptionSchema::new(key_id(0x22), DEFAULT_ALGORITHM, employee_policy()).unwrap()
}

#[test]
fn unset_other_names_serialize_as_null() {
    let document = employee().to_document().unwrap();

    assert_eq!(lookup(&document, "name.otherNames"), Some(&Bson::Null));
}

#[test]
fn null_other_names_are_removed() {
    let payload = NormalizedPayload::new(employee().to_document().unwrap(), &schema()).unwrap();

    assert_eq!(
        payload.document().get_document("name").unwrap(),
        &doc! { "firstName": "Kuber", "lastName": "Engineer" }
    );
    assert_eq!(payload.omitted(), ["name.otherNames".to_string()]);
    assert_eq!(lookup(payload.document(), "name.otherNames"), None);
}

#[test]
fn supplied_other_names_are_kept() {
    let mut record = employee();
    record.name = PersonName::builder()
        .first_name("Kuber")
        .last_name("Engineer")
        .other_names("Jr")
        .build();

    let payload = NormalizedPayload::new(record.to_document().unwrap(), &schema()).unwrap();

    assert_eq!(
        lookup(payload.document(), "name.otherNames"),
        Some(&Bson::String("Jr".to_string()))
    );
    assert!(payload.omitted().is_empty());
}

#[test]
fn normalization_is_idempotent() {
    let once = NormalizedPayload::new(employee().to_document().unwrap(), &schema()).unwrap();
    let twice = NormalizedPayload::new(once.document().clone(), &schema()).unwrap();

    assert_eq!(once.document(), twice.document());
    assert!(twice.omitted().is_empty());
}

#[test]
fn nested_nulls_are_removed_at_any_depth() {
    let document = doc! {
        "a": Bson::Null,
        "b": { "c": Bson::Null, "d": { "e": Bson::Null, "f": 1 } },
        "g": [Bson::Null],
    };

    let payload = NormalizedPayload::new(document, &schema()).unwrap();

    assert_eq!(
        payload.document(),
        &doc! { "b": { "d": { "f": 1 } }, "g": [Bson::Null] }
    );
    assert_eq!(payload.omitted(), ["a", "b.c", "b.d.e"]);
}

#[test]
fn null_address_is_omitted() {
    let mut document = employee().to_document().unwrap();
    document.insert("address", Bson::Null);

    let payload = NormalizedPayload::new(document, &schema()).unwrap();

    assert!(!payload.document().contains_key("address"));
    assert!(payload.omitted().contains(&"address".to_string()));
}

#[test]
fn scalar_at_object_encrypted_path_is_rejected() {
    let mut document = employee().to_document().unwrap();
    document.insert("address", "29 Bson Street");

    let err = NormalizedPayload::new(document, &schema()).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidPayload { .. }));
}

#[test]
fn record_fields_are_camel_case() {
    let document = employee().to_document().unwrap();
    let keys: Vec<&str> = document.keys().map(String::as_str).collect();

    assert_eq!(
        keys,
        vec!["name", "address", "dob", "phoneNumber", "salary", "taxIdentifier", "role"]
    );
    assert!(matches!(document.get("dob"), Some(Bson::DateTime(_))));
}
