mod common;

use serde_json::{json, Value as Json};

use common::{catalog_store, catalog_store_with, ids, seeded_catalog, SESSION};
use oxide_filter::backend::CatalogClient;
use oxide_filter::filter::JoinKind;
use oxide_filter::prelude::*;
use oxide_filter::query::{CatalogQuery, QueryBuilder};

/// Builds the catalog query a request would run, without running it.
fn build<'s>(
    store: &'s CatalogStore<InMemoryCatalog>,
    entity: &str,
    filters: &[Json],
) -> Result<CatalogQuery<'s>> {
    let factory = FilterFactory::new(store.schema(), entity, store.backend())?;
    let mut handler = FilterHandler::new();
    handler.add_all(factory.parse_all(filters)?)?;
    let mut query = store.query(entity)?;
    handler.apply(&mut query)?;
    Ok(query)
}

#[tokio::test]
async fn test_skip_and_limit_travel_together() {
    let store = catalog_store().await;
    let filters = [
        json!({"where": {"title": {"like": "Test"}}}),
        json!({"limit": 2}),
        json!({"order": "id ASC"}),
        json!({"skip": 1}),
    ];
    let query = build(&store, "Book", &filters).unwrap();
    assert_eq!(query.limit(), Some((1, 2)));
    assert_eq!(
        query.to_string(),
        "SELECT o FROM Book o WHERE o.title LIKE '%Test%' ORDER BY o.id ASC LIMIT 1, 2"
    );

    let books = get_with_filters(&store, SESSION, "Book", &filters).await.unwrap();
    assert_eq!(ids(&books), vec![2, 3]);
}

#[tokio::test]
async fn test_lone_skip_or_limit() {
    let store = catalog_store().await;
    let query = build(&store, "Book", &[json!({"skip": 3})]).unwrap();
    assert_eq!(query.limit(), Some((3, 10_000)));
    let query = build(&store, "Book", &[json!({"limit": 3})]).unwrap();
    assert_eq!(query.limit(), Some((0, 3)));

    let books = get_with_filters(
        &store,
        SESSION,
        "Book",
        &[json!({"order": "id ASC"}), json!({"skip": 3})],
    )
    .await
    .unwrap();
    assert_eq!(ids(&books), vec![4, 5]);
}

#[tokio::test]
async fn test_negative_pagination_fails_before_the_catalog() {
    let store = catalog_store().await;
    for (filter, name) in [(json!({"skip": -1}), "skip"), (json!({"limit": -5}), "limit")] {
        let err = get_with_filters(&store, SESSION, "Book", &[filter])
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ApiError::Filter(FilterError::InvalidValue { field, .. }) if field == name),
            "{err:?}"
        );
    }
}

#[tokio::test]
async fn test_orders_accumulate_with_join_specs() {
    let store = catalog_store().await;
    let query = build(
        &store,
        "Author",
        &[json!({"order": "books.title ASC"}), json!({"order": "name DESC"})],
    )
    .unwrap();
    assert_eq!(query.join_specs().get("books"), Some(&JoinKind::LeftOuter));
    assert_eq!(query.order().len(), 2);
    assert_eq!(
        query.to_string(),
        "SELECT o FROM Author o LEFT JOIN o.books ORDER BY o.books.title ASC, o.name DESC"
    );

    // A to-one hop needs no join specification.
    let query = build(&store, "Book", &[json!({"order": "author.name ASC"})]).unwrap();
    assert!(query.join_specs().is_empty());
}

#[tokio::test]
async fn test_order_by_to_many_path_keeps_unrelated_records() {
    let store = catalog_store().await;
    let authors = get_with_filters(&store, SESSION, "Author", &[json!({"order": "books.title ASC"})])
        .await
        .unwrap();
    // NULL sorts first; each author appears once.
    assert_eq!(ids(&authors), vec![3, 1, 2]);
}

#[tokio::test]
async fn test_value_formatting() {
    let store = catalog_store().await;
    let query = build(
        &store,
        "Book",
        &[
            json!({"where": {"id": {"in": []}}}),
            json!({"where": {"title": {"eq": "O'Brien"}}}),
            json!({"where": {"published_at": {"gt": "2020-01-01 00:00:00"}}}),
            json!({"where": {"author_id": {"eq": null}}}),
        ],
    )
    .unwrap();
    let text = query.to_string();
    assert!(text.contains("o.id IN (NULL)"), "{text}");
    assert!(text.contains("o.title = 'O''Brien'"), "{text}");
    assert!(text.contains("o.published_at > {ts '2020-01-01 00:00:00'}"), "{text}");
    assert!(text.contains("o.author_id IS NULL"), "{text}");
}

#[tokio::test]
async fn test_conditions_on_one_field_are_kept_together() {
    let store = catalog_store().await;
    let filters = [
        json!({"where": {"year": {"gte": 2003}}}),
        json!({"where": {"year": {"lt": 2010}}}),
        json!({"order": "id ASC"}),
    ];
    let query = build(&store, "Book", &filters).unwrap();
    assert_eq!(query.conditions().get("year").map(Vec::len), Some(2));

    let books = get_with_filters(&store, SESSION, "Book", &filters).await.unwrap();
    assert_eq!(ids(&books), vec![2, 3]);
}

#[tokio::test]
async fn test_distinct_counts() {
    let store = catalog_store().await;
    let count = count_with_filters(&store, SESSION, "Author", &[json!({"distinct": ["name"]})])
        .await
        .unwrap();
    assert_eq!(count, 3);

    let query = {
        let mut query = build(&store, "Book", &[json!({"distinct": ["year", "author_id"]})]).unwrap();
        query.set_count().unwrap();
        query
    };
    assert_eq!(
        query.to_string(),
        "SELECT COUNT(DISTINCT o.year, o.author_id) FROM Book o"
    );
    // Answered by fetching the distinct tuples.
    let QueryOutput::Count(n) = store.execute(SESSION, query).await.unwrap() else {
        panic!("expected a count");
    };
    assert_eq!(n, 4);
}

#[tokio::test]
async fn test_native_multi_attribute_count_distinct_fails() {
    let catalog = seeded_catalog().await;
    let mut client = catalog.clone();
    client.set_session_id(SESSION);
    let store = catalog_store_with(FilterConfig::default(), catalog);
    let mut query = build(&store, "Book", &[json!({"distinct": ["year", "author_id"]})]).unwrap();
    query.set_count().unwrap();
    assert!(client.search(&query).await.is_err());
}

#[tokio::test]
async fn test_sessions_are_checked() {
    let catalog = seeded_catalog().await.with_sessions([SESSION]);
    let store = catalog_store_with(FilterConfig::default(), catalog);

    let books = get_with_filters(&store, SESSION, "Book", &[]).await.unwrap();
    assert_eq!(books.len(), 5);

    for session in ["", "intruder"] {
        let err = get_with_filters(&store, session, "Book", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)), "{err:?}");
        assert_eq!(err.status_code(), 403);
    }
}

#[tokio::test]
async fn test_pool_is_bounded() {
    let config = FilterConfig {
        client_pool_size: 1,
        pool_acquire_timeout_ms: 50,
        ..FilterConfig::default()
    };
    let store = catalog_store_with(config, seeded_catalog().await);
    assert_eq!(store.pool().idle(), 0);

    for _ in 0..3 {
        get_with_filters(&store, SESSION, "Book", &[]).await.unwrap();
    }
    assert_eq!(store.pool().idle(), 1);

    let held = store.pool().acquire().await.unwrap();
    let err = get_with_filters(&store, SESSION, "Book", &[])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, ApiError::BadRequest(m) if m == "client pool exhausted"),
        "{err:?}"
    );

    drop(held);
    assert_eq!(store.pool().available(), 1);
    get_with_filters(&store, SESSION, "Book", &[]).await.unwrap();
}

#[tokio::test]
async fn test_empty_pool_setting_still_serves() {
    let config = FilterConfig {
        client_pool_size: 0,
        pool_acquire_timeout_ms: 50,
        ..FilterConfig::default()
    };
    let store = catalog_store_with(config, seeded_catalog().await);
    assert_eq!(store.pool().available(), 1);
    let books = get_with_filters(&store, SESSION, "Book", &[]).await.unwrap();
    assert_eq!(books.len(), 5);
}

#[tokio::test]
async fn test_writes_reach_the_shared_catalog() {
    let catalog = seeded_catalog().await;
    let store = catalog_store_with(FilterConfig::default(), catalog.clone());

    let created = create(
        &store,
        SESSION,
        "Review",
        &json!({"book_id": 5, "rating": 2}),
    )
    .await
    .unwrap();
    assert_eq!(created.get("id"), Some(&json!(4)));
    assert_eq!(catalog.len("Review").await, 4);

    let err = create(&store, SESSION, "Review", &json!({"id": 1, "book_id": 2}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");

    delete_by_id(&store, SESSION, "Review", &json!(4)).await.unwrap();
    assert_eq!(catalog.len("Review").await, 3);
}
