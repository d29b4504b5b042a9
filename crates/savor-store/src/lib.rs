//! Savor Store
//!
//! The relational side of the pipeline: the data model shared by ingest,
//! embedding maintenance, and retrieval; a `tokio-postgres` store with
//! schema bootstrap; and the hybrid vector+geo+rating retrieval engine.

pub mod models;
pub mod retrieve;
pub mod store;

pub use models::{
    Category, GeoPoint, MenuItem, MenuItemDraft, RankedRestaurant, Restaurant, RestaurantDraft,
};
pub use retrieve::{
    SearchFilter, DEFAULT_MAX_DISTANCE_METERS, DEFAULT_MIN_RATING, MAX_RESULTS,
    SIMILARITY_THRESHOLD,
};
pub use store::Store;
