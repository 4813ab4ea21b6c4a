use super::common::*;
use ledgerlink_common::{MetadataKind, MetadataPayload};
use ledgerlink_testkit::entity;

#[tokio::test(start_paused = true)]
async fn labels_are_decoded_once_and_cached() {
    let h = harness(test_config());
    h.remote
        .set_metadata(MetadataKind::Label, "4000", r#""\"Revenue\"""#);
    let first = h.engine.label(&entity("4000")).await.unwrap();
    let second = h.engine.label(&entity("4000")).await.unwrap();

    assert_eq!(first, MetadataPayload::Text("Revenue".into()));
    assert_eq!(first, second);
    assert_eq!(h.remote.metadata_count(), 1);
    assert_eq!(h.engine.stats().metadata_fetches, 1);
}

#[tokio::test(start_paused = true)]
async fn classification_records_keep_their_fields() {
    let h = harness(test_config());
    h.remote.set_metadata(
        MetadataKind::Classification,
        "4000",
        r#"{"accttype":"Income","sign":-1}"#,
    );
    let payload = h.engine.classification(&entity("4000")).await.unwrap();
    assert_eq!(payload.display_text().as_deref(), Some("Income"));
    assert_eq!(payload.field("sign"), Some(&serde_json::json!(-1)));
    // Label and classification are separate cache domains.
    assert!(h.engine.label(&entity("4000")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn missing_metadata_is_not_cached() {
    let h = harness(test_config());
    assert!(h.engine.label(&entity("9999")).await.is_err());
    assert!(h.engine.label(&entity("9999")).await.is_err());
    assert_eq!(h.remote.metadata_count(), 2);
}
