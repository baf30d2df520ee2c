//! Runs against a live database: `DATABASE_URL=... cargo test -- --ignored`.

use std::collections::BTreeSet;

use chrono::Utc;
use pfcat_core::{CanonicalProduct, IngredientsFields, IngredientsSource, NutritionFields};
use pfcat_storage::{CatalogStore, PgStore};

async fn store_from_env() -> Option<PgStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let store = PgStore::connect(&database_url, 2).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn fill_product_keeps_present_columns() {
    let Some(store) = store_from_env().await else {
        return;
    };
    let now = Utc::now();
    let key = format!("bozita-chicken-dry-{}", uuid::Uuid::new_v4().simple());
    let product = CanonicalProduct {
        id: uuid::Uuid::new_v4(),
        product_key: key.clone(),
        brand: "Bozita".into(),
        product_name: "Chicken Dry".into(),
        brand_slug: "bozita".into(),
        name_slug: key.clone(),
        ingredients: IngredientsFields {
            raw: Some("beef, peas".into()),
            source: Some(IngredientsSource::Label),
            ..Default::default()
        },
        nutrition: NutritionFields::default(),
        sources: BTreeSet::from(["https://bozita.example/chicken-dry".to_string()]),
        created_at: now,
        updated_at: now,
    };

    let mut tx = store.begin_merge().await.expect("begin");
    tx.insert_product(&product).await.expect("insert");
    tx.commit().await.expect("commit");

    let patch = IngredientsFields {
        raw: Some("lamb, carrots".into()),
        tokens: vec!["lamb".into(), "carrots".into()],
        language: Some("sv".into()),
        source: Some(IngredientsSource::Pdf),
        parsed_at: Some(now),
    };
    let mut tx = store.begin_merge().await.expect("begin");
    tx.fill_product(&key, &patch, "staging:pdf", now)
        .await
        .expect("fill");
    tx.commit().await.expect("commit");

    let stored = store
        .product_by_key(&key)
        .await
        .expect("lookup")
        .expect("product exists");
    assert_eq!(stored.ingredients.raw.as_deref(), Some("beef, peas"));
    assert_eq!(stored.ingredients.source, Some(IngredientsSource::Label));
    assert_eq!(stored.ingredients.tokens, vec!["lamb", "carrots"]);
    assert_eq!(stored.ingredients.language.as_deref(), Some("sv"));
    assert!(stored.sources.contains("staging:pdf"));
}
