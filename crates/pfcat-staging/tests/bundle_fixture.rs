use std::path::{Path, PathBuf};

use pfcat_core::IngredientsSource;
use pfcat_staging::{append_bundle, append_bundle_file, load_staging_bundle, StagingBundle};
use pfcat_storage::{MemoryStore, StagingStore};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/staging/bozita-2026-03-01.json")
}

#[test]
fn fixture_bundle_parses_with_worker_aliases() {
    let bundle = load_staging_bundle(fixture()).expect("fixture loads");
    let rows = bundle.into_rows().expect("fixture validates");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].product_key_computed, "bozita-chicken-dry");
    assert_eq!(rows[0].product_name_raw, "Chicken Dry");
    assert_eq!(rows[1].ingredients_source, Some(IngredientsSource::Pdf));
    assert_eq!(rows[1].debug["pdf_page"], 2);
    assert!(rows[2].ingredients_raw.is_none());
}

#[tokio::test]
async fn appending_the_same_bundle_twice_is_a_no_op() {
    let store = MemoryStore::new();

    let first = append_bundle_file(&store, fixture()).await.expect("first append");
    let second = append_bundle_file(&store, fixture()).await.expect("second append");

    assert_eq!(first.appended, 3);
    assert_eq!(first.duplicates, 0);
    assert_eq!(second.appended, 0);
    assert_eq!(second.duplicates, 3);
    assert_eq!(
        store
            .staging_rows("bozita-site-2026-03-01")
            .await
            .expect("rows")
            .len(),
        3
    );
}

#[test]
fn unreadable_bundle_reports_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").expect("write");
    let err = load_staging_bundle(&path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.json"));
}

#[tokio::test]
async fn label_and_pdf_reads_in_one_bundle_both_land() {
    let store = MemoryStore::new();
    let bundle: StagingBundle = serde_json::from_value(serde_json::json!({
        "run_id": "R",
        "extracted_at": "2026-03-01T08:00:00Z",
        "rows": [
            {
                "brand_slug": "bozita",
                "name_slug": "chicken-dry",
                "product_key": "bozita-chicken-dry",
                "ingredients_raw": "chicken, rice",
                "ingredients_source": "label"
            },
            {
                "brand_slug": "bozita",
                "name_slug": "chicken-dry",
                "product_key": "bozita-chicken-dry",
                "ingredients_raw": "chicken, rice, salt",
                "ingredients_source": "pdf"
            }
        ]
    }))
    .expect("bundle parses");

    let first = append_bundle(&store, bundle.clone()).await.expect("append");
    assert_eq!(first.appended, 2);
    assert_eq!(first.duplicates, 0);

    let again = append_bundle(&store, bundle).await.expect("re-append");
    assert_eq!(again.appended, 0);
    assert_eq!(again.duplicates, 2);

    let mut sources: Vec<_> = store
        .staging_rows("R")
        .await
        .expect("rows")
        .into_iter()
        .map(|r| r.ingredients_source)
        .collect();
    sources.sort();
    assert_eq!(
        sources,
        vec![Some(IngredientsSource::Label), Some(IngredientsSource::Pdf)]
    );
}
