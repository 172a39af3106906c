use std::path::PathBuf;

use djh_adapters::{load_fixture_document, AdapterContext, DataJsonAdapter, SourceAdapter};

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-source/data.json")
}

#[test]
fn sample_source_document_parses_and_maps() {
    let entries = load_fixture_document(fixture_path()).expect("fixture parses");
    let ids = entries.iter().map(|e| e.identifier.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, ["doe-wq-2026", "doe-air-2026", "doe-budget-fy26"]);

    let ctx = AdapterContext {
        source_id: "sample-source".into(),
        source_url: "https://example.gov/data.json".into(),
    };
    let mapped = entries
        .iter()
        .map(|entry| DataJsonAdapter.map_entry(&ctx, entry).expect("maps"))
        .collect::<Vec<_>>();

    assert_eq!(mapped[0].resources.len(), 2);
    assert_eq!(
        mapped[0].notes.as_deref(),
        Some("Monthly water quality samples from river stations.")
    );
    assert_eq!(mapped[1].resources[0].format.as_deref(), Some("GeoJSON"));
    assert!(mapped[2].resources.is_empty());
    assert_eq!(
        mapped[2].extras.get("bureau_code").map(String::as_str),
        Some("010:04")
    );
}
