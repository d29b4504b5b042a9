//! Postgres access for the Savor pipeline.
//!
//! The store owns a single connection guarded by a mutex: every caller in a
//! component goes through one session, and batch ingest gets the `&mut`
//! access a transaction needs. The embedding writers touch only the
//! `embedding` column, so they never conflict with content writers.

use pgvector::Vector;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};

use savor_common::{Error, Result, Table};

use crate::models::{Category, GeoPoint, MenuItem, Restaurant, RestaurantDraft};

const SCHEMA: &str = "
CREATE EXTENSION IF NOT EXISTS vector;
CREATE EXTENSION IF NOT EXISTS postgis;

CREATE TABLE IF NOT EXISTS restaurants (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    area TEXT NOT NULL,
    rating DOUBLE PRECISION NOT NULL,
    badges TEXT[] NOT NULL DEFAULT '{}',
    location GEOMETRY(Point, 4326),
    embedding VECTOR(768)
);

CREATE TABLE IF NOT EXISTS menu_items (
    id BIGSERIAL PRIMARY KEY,
    restaurant_id BIGINT NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
    category TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    description TEXT NOT NULL,
    embedding VECTOR(768)
);

CREATE TABLE IF NOT EXISTS categories (
    id BIGSERIAL PRIMARY KEY,
    restaurant_id BIGINT NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    embedding VECTOR(768)
);
";

/// Columns fetched whenever a full restaurant row is materialised.
const RESTAURANT_COLS: &str =
    "id, name, area, rating, badges, ST_X(location) AS longitude, ST_Y(location) AS latitude";

pub(crate) fn db_err(e: tokio_postgres::Error) -> Error {
    Error::Database(e.to_string())
}

/// A Postgres-backed store over one connection.
pub struct Store {
    pub(crate) client: Mutex<Client>,
}

impl Store {
    /// Connect and spawn the connection driver task.
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(db_err)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Create the extensions and tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute(SCHEMA).await.map_err(db_err)?;
        info!("database schema ensured");
        Ok(())
    }

    pub async fn get_restaurant(&self, id: i64) -> Result<Option<Restaurant>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {RESTAURANT_COLS} FROM restaurants WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(restaurant_from_row))
    }

    pub async fn get_menu_item(&self, id: i64) -> Result<Option<MenuItem>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT id, restaurant_id, category, name, price, description \
                 FROM menu_items WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(menu_item_from_row))
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT id, restaurant_id, name FROM categories WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Category {
            id: r.get("id"),
            restaurant_id: r.get("restaurant_id"),
            name: r.get("name"),
        }))
    }

    /// Write an embedding. Returns `false` when the row no longer exists.
    pub async fn update_embedding(&self, table: Table, id: i64, embedding: &[f32]) -> Result<bool> {
        let vector = Vector::from(embedding.to_vec());
        let sql = match table {
            Table::Restaurants => "UPDATE restaurants SET embedding = $1 WHERE id = $2",
            Table::MenuItems => "UPDATE menu_items SET embedding = $1 WHERE id = $2",
            Table::Categories => "UPDATE categories SET embedding = $1 WHERE id = $2",
        };
        let client = self.client.lock().await;
        let updated = client
            .execute(sql, &[&vector, &id])
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    /// Ids of rows that have never been embedded, for the backfill utility.
    pub async fn unembedded_ids(&self, table: Table) -> Result<Vec<i64>> {
        let sql = match table {
            Table::Restaurants => "SELECT id FROM restaurants WHERE embedding IS NULL",
            Table::MenuItems => "SELECT id FROM menu_items WHERE embedding IS NULL",
            Table::Categories => "SELECT id FROM categories WHERE embedding IS NULL",
        };
        let client = self.client.lock().await;
        let rows = client.query(sql, &[]).await.map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Create a batch of restaurants with their menu items, all or nothing.
    pub async fn create_restaurants(&self, drafts: &[RestaurantDraft]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        for draft in drafts {
            let row = tx
                .query_one(
                    "INSERT INTO restaurants (name, area, rating, badges, location) \
                     VALUES ($1, $2, $3, $4, ST_SetSRID(ST_MakePoint($5, $6), 4326)) \
                     RETURNING id",
                    &[
                        &draft.name,
                        &draft.area,
                        &draft.rating,
                        &draft.badges,
                        &draft.location.long,
                        &draft.location.lat,
                    ],
                )
                .await
                .map_err(db_err)?;
            let restaurant_id: i64 = row.get(0);

            for item in &draft.menu_items {
                tx.execute(
                    "INSERT INTO menu_items (restaurant_id, category, name, price, description) \
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        &restaurant_id,
                        &item.category,
                        &item.name,
                        &item.price,
                        &item.description,
                    ],
                )
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)
    }

    pub async fn list_restaurants(&self) -> Result<Vec<Restaurant>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                format!("SELECT {RESTAURANT_COLS} FROM restaurants ORDER BY id").as_str(),
                &[],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(restaurant_from_row).collect())
    }
}

pub(crate) fn restaurant_from_row(row: Row) -> Restaurant {
    let longitude: Option<f64> = row.get("longitude");
    let latitude: Option<f64> = row.get("latitude");
    Restaurant {
        id: row.get("id"),
        name: row.get("name"),
        area: row.get("area"),
        rating: row.get("rating"),
        badges: row.get("badges"),
        location: match (latitude, longitude) {
            (Some(lat), Some(long)) => Some(GeoPoint { lat, long }),
            _ => None,
        },
    }
}

pub(crate) fn menu_item_from_row(row: Row) -> MenuItem {
    MenuItem {
        id: row.get("id"),
        restaurant_id: row.get("restaurant_id"),
        category: row.get("category"),
        name: row.get("name"),
        price: row.get("price"),
        description: row.get("description"),
    }
}
