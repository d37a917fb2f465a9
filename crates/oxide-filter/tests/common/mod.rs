#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;

use oxide_filter::prelude::*;

pub const SESSION: &str = "session-1";

pub fn schema() -> SchemaRegistry {
    SchemaRegistry::new()
        .register(
            EntityDef::new("Country")
                .table("countries")
                .attribute("id", AttributeType::Integer)
                .attribute("name", AttributeType::Text),
        )
        .register(
            EntityDef::new("Author")
                .table("authors")
                .attribute("id", AttributeType::Integer)
                .attribute("name", AttributeType::Text)
                .attribute("country_id", AttributeType::Integer)
                .relationship(RelationshipDef::one("country", "Country", "country_id", "id"))
                .relationship(RelationshipDef::many("books", "Book", "id", "author_id")),
        )
        .register(
            EntityDef::new("Book")
                .table("books")
                .attribute("id", AttributeType::Integer)
                .attribute("title", AttributeType::Text)
                .attribute("year", AttributeType::Integer)
                .attribute("price", AttributeType::Decimal)
                .attribute("published_at", AttributeType::Timestamp)
                .attribute("author_id", AttributeType::Integer)
                .relationship(RelationshipDef::one("author", "Author", "author_id", "id"))
                .relationship(
                    RelationshipDef::many("reviews", "Review", "id", "book_id")
                        .external_name("reviewList"),
                ),
        )
        .register(
            EntityDef::new("Review")
                .table("reviews")
                .attribute("id", AttributeType::Integer)
                .attribute("book_id", AttributeType::Integer)
                .attribute("rating", AttributeType::Integer)
                .relationship(RelationshipDef::one("book", "Book", "book_id", "id")),
        )
}

fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(h, min, s))
        .unwrap()
}

fn book(id: i64, year: i64, price: Decimal, published_at: NaiveDateTime, author_id: i64) -> Record {
    Record::new("Book")
        .with("id", id)
        .with("title", format!("Test {}", id - 1))
        .with("year", year)
        .with("price", price)
        .with("published_at", published_at)
        .with("author_id", author_id)
}

/// The shared data set, every attribute present.
pub fn records() -> Vec<Record> {
    vec![
        Record::new("Country").with("id", 1).with("name", "Norway"),
        Record::new("Country").with("id", 2).with("name", "Chile"),
        Record::new("Author")
            .with("id", 1)
            .with("name", "Ada")
            .with("country_id", 1),
        Record::new("Author")
            .with("id", 2)
            .with("name", "Borges")
            .with("country_id", 2),
        Record::new("Author")
            .with("id", 3)
            .with("name", "Clarice")
            .with("country_id", Value::Null),
        book(1, 2001, Decimal::new(1250, 2), ts(2019, 3, 5, 14, 19, 6), 1),
        book(2, 2003, Decimal::new(825, 2), ts(2019, 4, 1, 9, 0, 0), 1),
        book(3, 2003, Decimal::new(2000, 2), ts(2020, 1, 15, 12, 30, 0), 2),
        book(4, 2010, Decimal::new(1575, 2), ts(2021, 6, 30, 18, 45, 0), 2),
        book(5, 2010, Decimal::new(950, 2), ts(2022, 11, 11, 11, 11, 11), 2),
        Record::new("Review")
            .with("id", 1)
            .with("book_id", 1)
            .with("rating", 5),
        Record::new("Review")
            .with("id", 2)
            .with("book_id", 1)
            .with("rating", 3),
        Record::new("Review")
            .with("id", 3)
            .with("book_id", 3)
            .with("rating", 4),
    ]
}

const TABLES: [&str; 4] = [
    "CREATE TABLE countries (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL, country_id INTEGER)",
    "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL, year INTEGER, \
     price REAL, published_at TEXT, author_id INTEGER)",
    "CREATE TABLE reviews (id INTEGER PRIMARY KEY, book_id INTEGER, rating INTEGER)",
];

pub async fn relational_store() -> RelationalStore {
    relational_store_with(FilterConfig::default()).await
}

pub async fn relational_store_with(config: FilterConfig) -> RelationalStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.pool_acquire_timeout())
        .connect(":memory:")
        .await
        .unwrap();
    for ddl in TABLES {
        sqlx::query(ddl).execute(&pool).await.unwrap();
    }
    let store = RelationalStore::new(pool, Arc::new(schema()), config);
    for record in records() {
        store.insert("fixture", record).await.unwrap();
    }
    store
}

pub async fn seeded_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new(Arc::new(schema()));
    catalog.seed(records()).await;
    catalog
}

pub async fn catalog_store() -> CatalogStore<InMemoryCatalog> {
    catalog_store_with(FilterConfig::default(), seeded_catalog().await)
}

pub fn catalog_store_with(
    config: FilterConfig,
    catalog: InMemoryCatalog,
) -> CatalogStore<InMemoryCatalog> {
    CatalogStore::new(Arc::new(schema()), config, move || catalog.clone())
}

/// Returns the `id` of each serialized record.
pub fn ids(records: &[SerializedRecord]) -> Vec<i64> {
    records
        .iter()
        .map(|r| r.get("id").and_then(|id| id.as_i64()).unwrap())
        .collect()
}
