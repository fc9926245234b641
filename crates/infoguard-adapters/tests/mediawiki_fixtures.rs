use std::path::PathBuf;

use infoguard_adapters::{
    load_fixture_json, normalize_markup, parse_latest_revision, parse_recent_changes,
    top_edited_documents, topics_from_response,
};
use serde_json::Value;

fn fixture(name: &str) -> Value {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    load_fixture_json(&path).expect("fixture")
}

#[test]
fn recent_changes_fixture_promotes_most_edited_human_documents() {
    let changes = parse_recent_changes(&fixture("recentchanges.json")).expect("feed");
    assert_eq!(changes.len(), 10);

    let promoted = top_edited_documents(&changes, 10);
    assert_eq!(
        promoted,
        vec!["2026 Lok Sabha by-elections", "Moon", "Vaccine hesitancy"]
    );
    assert_eq!(
        top_edited_documents(&changes, 2),
        vec!["2026 Lok Sabha by-elections", "Moon"]
    );
}

#[test]
fn latest_revision_fixture_decodes_and_normalizes() {
    let snapshot =
        parse_latest_revision("Moon", &fixture("revision_latest.json")).expect("snapshot");
    assert_eq!(snapshot.document_id, "Moon");
    assert_eq!(snapshot.revision_id, 1_224_470_385);
    assert_eq!(snapshot.parent_id, Some(1_224_470_001));
    assert_eq!(snapshot.author, "Selenographer");
    assert_eq!(snapshot.comment, "/* Orbit */ expand");

    assert_eq!(
        normalize_markup(&snapshot.content),
        "The Moon is Earth's only natural satellite. It is the fifth largest satellite. \
         Orbit Period: 27.3 days"
    );
}

#[test]
fn deleted_or_empty_pages_are_skipped() {
    assert!(parse_latest_revision(
        "Deleted hoax article",
        &fixture("revision_missing_page.json")
    )
    .is_none());
    assert!(parse_latest_revision(
        "Moon landing conspiracy",
        &fixture("revision_without_revisions.json")
    )
    .is_none());
}

#[test]
fn documents_turned_into_redirects_are_skipped() {
    assert_eq!(
        parse_latest_revision("Luna (satellite)", &fixture("revision_redirect.json")),
        None
    );
}

#[test]
fn cluster_fixture_drops_outliers_and_labels_topics() {
    let topics = topics_from_response(&fixture("cluster_response.json")).expect("topics");
    assert_eq!(topics.len(), 2);

    assert_eq!(topics[0].topic_id, 0);
    assert_eq!(topics[0].count, 7);
    assert_eq!(topics[0].label, "Election, Fraud, Vote");
    assert_eq!(topics[0].keywords.len(), 5);

    assert_eq!(topics[1].label, "Vaccine safety");
    assert_eq!(topics[1].keywords, vec!["vaccine", "trial", "safety"]);
}
