mod common;

use std::collections::BTreeSet;

use serde_json::{json, Value as Json};

use common::{catalog_store, ids, relational_store, SESSION};
use oxide_filter::prelude::*;

async fn fetch<S: RecordStore>(store: &S, entity: &str, filters: &[Json]) -> Vec<SerializedRecord> {
    get_with_filters(store, SESSION, entity, filters)
        .await
        .unwrap_or_else(|e| panic!("{entity} {filters:?} failed on {:?}: {e}", store.backend()))
}

/// Runs the same request on both stores and checks the results agree.
async fn both(entity: &str, filters: &[Json]) -> Vec<SerializedRecord> {
    let relational = fetch(&relational_store().await, entity, filters).await;
    let catalog = fetch(&catalog_store().await, entity, filters).await;
    assert_eq!(relational, catalog, "{entity} {filters:?}");
    relational
}

/// Like [`both`], for results whose row order is unspecified.
async fn both_unordered(entity: &str, filters: &[Json]) -> BTreeSet<String> {
    let as_set = |rows: Vec<SerializedRecord>| -> BTreeSet<String> {
        rows.into_iter().map(|r| r.into_value().to_string()).collect()
    };
    let relational = as_set(fetch(&relational_store().await, entity, filters).await);
    let catalog = as_set(fetch(&catalog_store().await, entity, filters).await);
    assert_eq!(relational, catalog, "{entity} {filters:?}");
    relational
}

#[tokio::test]
async fn test_eq_selects_exact_matches() {
    let books = both("Book", &[json!({"where": {"year": {"eq": 2003}}}), json!({"order": "id ASC"})]).await;
    assert_eq!(ids(&books), vec![2, 3]);

    let none = both("Book", &[json!({"where": {"year": {"eq": 1999}}})]).await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_comparison_operators() {
    let cases = [
        (json!({"year": {"ne": 2010}}), vec![1, 2, 3]),
        (json!({"year": {"lt": 2003}}), vec![1]),
        (json!({"year": {"lte": 2003}}), vec![1, 2, 3]),
        (json!({"year": {"gt": 2003}}), vec![4, 5]),
        (json!({"year": {"gte": 2010}}), vec![4, 5]),
        (json!({"price": {"lt": 10}}), vec![2, 5]),
        (json!({"published_at": {"gte": "2020-01-01 00:00:00"}}), vec![3, 4, 5]),
        (json!({"id": {"in": [5, 1, 9]}}), vec![1, 5]),
        (json!({"title": {"nlike": "test 1"}}), vec![1, 3, 4, 5]),
    ];
    for (condition, expected) in cases {
        let books = both("Book", &[json!({"where": condition}), json!({"order": "id ASC"})]).await;
        assert_eq!(ids(&books), expected, "{condition}");
    }
}

#[tokio::test]
async fn test_empty_in_matches_nothing() {
    let books = both("Book", &[json!({"where": {"id": {"in": []}}})]).await;
    assert!(books.is_empty());
}

#[tokio::test]
async fn test_null_equality() {
    let authors = both("Author", &[json!({"where": {"country_id": {"eq": null}}})]).await;
    assert_eq!(ids(&authors), vec![3]);

    let authors = both(
        "Author",
        &[json!({"where": {"country_id": {"ne": null}}}), json!({"order": "id ASC"})],
    )
    .await;
    assert_eq!(ids(&authors), vec![1, 2]);
}

#[tokio::test]
async fn test_like_order_skip_limit_scenario() {
    let books = both(
        "Book",
        &[
            json!({"where": {"title": {"like": "Test"}}}),
            json!({"order": "id ASC"}),
            json!({"skip": 1}),
            json!({"limit": 2}),
        ],
    )
    .await;
    assert_eq!(ids(&books), vec![2, 3]);
    assert_eq!(books[0].get("title"), Some(&json!("Test 1")));
}

#[tokio::test]
async fn test_filters_apply_in_fixed_order() {
    let books = both(
        "Book",
        &[
            json!({"limit": 2}),
            json!({"skip": 1}),
            json!({"order": "id DESC"}),
            json!({"where": {"title": {"like": "Test"}}}),
        ],
    )
    .await;
    assert_eq!(ids(&books), vec![4, 3]);
}

#[tokio::test]
async fn test_multiple_orders() {
    let books = both("Book", &[json!({"order": "year DESC"}), json!({"order": "price asc"})]).await;
    assert_eq!(ids(&books), vec![5, 4, 2, 3, 1]);
}

#[tokio::test]
async fn test_where_through_relationships() {
    let books = both(
        "Book",
        &[json!({"where": {"author.name": {"eq": "Borges"}}}), json!({"order": "id ASC"})],
    )
    .await;
    assert_eq!(ids(&books), vec![3, 4, 5]);

    let reviews = both(
        "Review",
        &[json!({"where": {"book.author.name": {"eq": "Ada"}}}), json!({"order": "id ASC"})],
    )
    .await;
    assert_eq!(ids(&reviews), vec![1, 2]);

    // Both conditions must hold for the same joined book.
    let authors = both(
        "Author",
        &[
            json!({"where": {"books.year": {"eq": 2003}, "books.price": {"gt": 10}}}),
            json!({"order": "id ASC"}),
        ],
    )
    .await;
    assert_eq!(ids(&authors), vec![2]);
}

#[tokio::test]
async fn test_distinct_rows_are_unique() {
    let filters = [json!({"distinct": "year"})];
    let years = fetch(&relational_store().await, "Book", &filters).await;
    assert_eq!(years.len(), 3);
    assert!(years.iter().all(|r| r.keys().eq(["year"])));

    let rows = both_unordered("Book", &filters).await;
    let expected: BTreeSet<String> = [json!({"year": 2001}), json!({"year": 2003}), json!({"year": 2010})]
        .iter()
        .map(Json::to_string)
        .collect();
    assert_eq!(rows, expected);

    let pairs = both_unordered("Book", &[json!({"distinct": ["year", "author_id"]})]).await;
    assert_eq!(pairs.len(), 4);
}

#[tokio::test]
async fn test_order_through_to_many_path_uses_each_records_extreme() {
    // Book 1 has ratings 5 and 3, book 3 has 4, the rest none.
    let cases = [
        ("reviews.rating DESC", vec![1, 3, 2, 4, 5]),
        ("reviews.rating ASC", vec![2, 4, 5, 1, 3]),
    ];
    for (order, expected) in cases {
        let books = both("Book", &[json!({"order": order}), json!({"order": "id ASC"})]).await;
        assert_eq!(ids(&books), expected, "{order}");
    }

    let authors = both("Author", &[json!({"order": "books.title DESC"})]).await;
    assert_eq!(ids(&authors), vec![2, 1, 3]);
    let authors = both("Author", &[json!({"order": "books.title ASC"})]).await;
    assert_eq!(ids(&authors), vec![3, 1, 2]);
}

#[tokio::test]
async fn test_distinct_ordered_by_its_field() {
    let rows = both("Book", &[json!({"distinct": "year"}), json!({"order": "year DESC"})]).await;
    let years: Vec<Option<&Json>> = rows.iter().map(|r| r.get("year")).collect();
    assert_eq!(
        years,
        vec![Some(&json!(2010)), Some(&json!(2003)), Some(&json!(2001))]
    );
}

#[tokio::test]
async fn test_mismatched_filters_fail_alike() {
    let relational = relational_store().await;
    let catalog = catalog_store().await;
    let cases = [
        vec![json!({"where": {"year": {"like": "200"}}})],
        vec![json!({"where": {"price": {"nlike": "1"}}})],
        vec![json!({"distinct": "year"}), json!({"order": "price DESC"})],
        vec![json!({"order": "id ASC"}), json!({"distinct": ["year", "author_id"]})],
    ];
    for filters in cases {
        let a = rejected(&relational, &filters).await;
        let b = rejected(&catalog, &filters).await;
        assert!(matches!(a, FilterError::InvalidValue { .. }), "{filters:?}: {a:?}");
        assert_eq!(a, b, "{filters:?}");
    }
}

#[tokio::test]
async fn test_distinct_dotted_fields_nest() {
    let names = both_unordered(
        "Book",
        &[json!({"distinct": ["author.name"]}), json!({"where": {"year": {"gte": 2003}}})],
    )
    .await;
    let expected: BTreeSet<String> = [
        json!({"author": {"name": "Ada"}}),
        json!({"author": {"name": "Borges"}}),
    ]
    .iter()
    .map(Json::to_string)
    .collect();
    assert_eq!(names, expected);
}

async fn count<S: RecordStore>(store: &S, entity: &str, filters: &[Json]) -> u64 {
    count_with_filters(store, SESSION, entity, filters).await.unwrap()
}

#[tokio::test]
async fn test_counts_agree() {
    let relational = relational_store().await;
    let catalog = catalog_store().await;
    let cases: [(&str, Vec<Json>, u64); 6] = [
        ("Book", vec![], 5),
        ("Book", vec![json!({"where": {"year": {"eq": 1999}}})], 0),
        ("Book", vec![json!({"distinct": "year"})], 3),
        ("Book", vec![json!({"distinct": ["year", "author_id"]})], 4),
        ("Author", vec![json!({"where": {"books.year": {"eq": 2003}}})], 2),
        (
            "Book",
            vec![json!({"where": {"title": {"like": "Test"}}}), json!({"distinct": "author.name"})],
            2,
        ),
    ];
    for (entity, filters, expected) in cases {
        assert_eq!(count(&relational, entity, &filters).await, expected, "{filters:?}");
        assert_eq!(count(&catalog, entity, &filters).await, expected, "{filters:?}");
    }
}

#[tokio::test]
async fn test_flat_form_without_include() {
    let books = both("Book", &[json!({"where": {"id": {"eq": 1}}})]).await;
    assert_eq!(
        books[0].clone().into_value(),
        json!({
            "id": 1,
            "title": "Test 0",
            "year": 2001,
            "price": 12.5,
            "published_at": "2019-03-05 14:19:06",
            "author_id": 1
        })
    );
}

#[tokio::test]
async fn test_include_shapes() {
    let books = both(
        "Book",
        &[json!({"where": {"id": {"eq": 3}}}), json!({"include": "author"})],
    )
    .await;
    assert_eq!(
        books[0].get("author"),
        Some(&json!({"id": 2, "name": "Borges", "country_id": 2}))
    );

    let authors = both("Author", &[json!({"include": ["books", "country"]}), json!({"order": "id ASC"})]).await;
    let books_of = |i: usize| authors[i].get("books").and_then(Json::as_array).map(Vec::len);
    assert_eq!(books_of(0), Some(2));
    assert_eq!(books_of(1), Some(3));
    assert_eq!(books_of(2), Some(0));
    assert_eq!(authors[2].get("country"), Some(&Json::Null));
    assert_eq!(authors[0].get("country"), Some(&json!({"id": 1, "name": "Norway"})));
}

#[tokio::test]
async fn test_nested_include_uses_external_names() {
    let authors = both(
        "Author",
        &[
            json!({"where": {"id": {"eq": 1}}}),
            json!({"include": {"books": ["reviews", "author"]}}),
        ],
    )
    .await;
    let books = authors[0].get("books").and_then(Json::as_array).unwrap();
    assert_eq!(books.len(), 2);
    assert_eq!(books[0]["reviewList"].as_array().map(Vec::len), Some(2));
    assert_eq!(books[1]["reviewList"], json!([]));
    assert_eq!(books[0]["author"]["name"], json!("Ada"));
    assert!(books[0].get("reviews").is_none());
}

async fn two_includes<S: RecordStore>(store: &S) -> ApiError {
    get_with_filters(
        store,
        SESSION,
        "Book",
        &[json!({"include": "author"}), json!({"include": "reviews"})],
    )
    .await
    .unwrap_err()
}

#[tokio::test]
async fn test_second_include_is_rejected() {
    let relational = two_includes(&relational_store().await).await;
    let catalog = two_includes(&catalog_store().await).await;
    for err in [relational, catalog] {
        assert!(matches!(err, ApiError::Filter(FilterError::MultipleIncludes)), "{err:?}");
        assert_eq!(err.status_code(), 400);
    }
}

async fn rejected<S: RecordStore>(store: &S, filters: &[Json]) -> FilterError {
    match get_with_filters(store, SESSION, "Book", filters).await {
        Err(ApiError::Filter(err)) => err,
        other => panic!("expected a filter error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_filters_fail_on_both() {
    let relational = relational_store().await;
    let catalog = catalog_store().await;
    let cases = [
        json!({"where": {"isbn": {"eq": "x"}}}),
        json!({"where": {"year": {"between": [1, 2]}}}),
        json!({"where": {"year": {"in": 2003}}}),
        json!({"where": {"year": {"eq": 1, "ne": 2}}}),
        json!({"order": "id"}),
        json!({"order": "id UP"}),
        json!({"include": "publisher"}),
        json!({"distinct": []}),
        json!({"where": {}, "order": "id ASC"}),
        json!({"page": 1}),
    ];
    for filter in cases {
        let filters = [filter];
        let a = rejected(&relational, &filters).await;
        let b = rejected(&catalog, &filters).await;
        assert_eq!(a, b, "{filters:?}");
    }
}

async fn crud<S: RecordStore>(store: &S) {
    let created = create(
        store,
        SESSION,
        "Book",
        &json!({"title": "Fresh", "year": 2024, "author_id": 3}),
    )
    .await
    .unwrap();
    assert_eq!(created.get("id"), Some(&json!(6)));
    assert_eq!(created.get("price"), Some(&Json::Null));

    let err = create(store, SESSION, "Book", &json!({"title": "Orphan", "author_id": 99}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");

    let err = create(store, SESSION, "Book", &json!({"isbn": "123"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");

    let updated = update(store, SESSION, "Book", &json!({"id": 6, "year": 2025}))
        .await
        .unwrap();
    assert_eq!(updated.get("year"), Some(&json!(2025)));
    assert_eq!(updated.get("title"), Some(&json!("Fresh")));

    let err = update(store, SESSION, "Book", &json!({"year": 2025}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");

    let err = update(store, SESSION, "Book", &json!({"id": 42, "year": 2025}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)), "{err:?}");

    let fetched = get_by_id(store, SESSION, "Book", &json!(6)).await.unwrap();
    assert_eq!(fetched, updated);

    delete_by_id(store, SESSION, "Book", &json!(6)).await.unwrap();
    let err = get_by_id(store, SESSION, "Book", &json!(6)).await.unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)), "{err:?}");
    assert_eq!(err.status_code(), 404);
    let err = delete_by_id(store, SESSION, "Book", &json!(6)).await.unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)), "{err:?}");
}

#[tokio::test]
async fn test_writes_behave_alike() {
    crud(&relational_store().await).await;
    crud(&catalog_store().await).await;
}

async fn first_match<S: RecordStore>(store: &S) {
    let book = get_one_with_filters(
        store,
        SESSION,
        "Book",
        &[json!({"where": {"year": {"eq": 2010}}}), json!({"order": "price DESC"})],
    )
    .await
    .unwrap();
    assert_eq!(book.get("id"), Some(&json!(4)));

    let err = get_one_with_filters(store, SESSION, "Book", &[json!({"where": {"year": {"eq": 1}}})])
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)), "{err:?}");
}

#[tokio::test]
async fn test_get_one_with_filters() {
    first_match(&relational_store().await).await;
    first_match(&catalog_store().await).await;
}
