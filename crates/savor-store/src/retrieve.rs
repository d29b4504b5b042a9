//! The retrieval engine.
//!
//! Retrieval anchors on menu items: dish-level intent ("spicy ramen") is
//! matched against item embeddings, while the join to restaurants applies
//! the geo and rating filters. Grouping happens after ranking so the
//! first-seen order of restaurant ids is already best-similarity order.

use pgvector::Vector;
use tokio_postgres::types::ToSql;

use savor_common::Result;

use crate::models::{GeoPoint, MenuItem, RankedRestaurant, Restaurant};
use crate::store::{db_err, menu_item_from_row, restaurant_from_row, Store};

/// Minimum cosine similarity for a menu item to count as a match.
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Maximum number of restaurants returned per search.
pub const MAX_RESULTS: usize = 10;

/// Default search radius when the query does not constrain distance.
pub const DEFAULT_MAX_DISTANCE_METERS: f64 = 20_000.0;

/// Default rating floor when the query does not constrain rating.
pub const DEFAULT_MIN_RATING: f64 = 3.0;

/// Filters applied alongside the vector match.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    /// Maximum distance from `location` in meters.
    pub max_distance: f64,
    /// Minimum restaurant rating, 1-5.
    pub min_rating: f64,
    /// Search origin. Distance filtering is skipped when absent.
    pub location: Option<GeoPoint>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE_METERS,
            min_rating: DEFAULT_MIN_RATING,
            location: None,
        }
    }
}

/// One menu-item hit from the ranked query.
#[derive(Debug, Clone)]
pub(crate) struct ItemMatch {
    pub restaurant_id: i64,
    pub similarity: f64,
    pub item: MenuItem,
}

/// Matching items for one restaurant, in hit order.
#[derive(Debug)]
pub(crate) struct RestaurantMatch {
    pub restaurant_id: i64,
    pub items: Vec<MenuItem>,
    pub best_similarity: f64,
}

/// Fold ranked item hits into per-restaurant groups.
///
/// Input order is similarity-descending, so the first hit for a restaurant
/// fixes its rank. At most `cap` restaurants are kept; later hits for a
/// restaurant that already made the cut still attach their items.
pub(crate) fn group_by_restaurant(matches: Vec<ItemMatch>, cap: usize) -> Vec<RestaurantMatch> {
    let mut groups: Vec<RestaurantMatch> = Vec::new();

    for hit in matches {
        match groups.iter_mut().find(|g| g.restaurant_id == hit.restaurant_id) {
            Some(group) => {
                group.items.push(hit.item);
                if hit.similarity > group.best_similarity {
                    group.best_similarity = hit.similarity;
                }
            }
            None => groups.push(RestaurantMatch {
                restaurant_id: hit.restaurant_id,
                items: vec![hit.item],
                best_similarity: hit.similarity,
            }),
        }
    }

    groups.truncate(cap);
    groups
}

impl Store {
    /// Hybrid search: cosine similarity over menu items, geo and rating
    /// filters over the joined restaurants, grouped into at most
    /// [`MAX_RESULTS`] ranked restaurants.
    ///
    /// Rows with a NULL embedding never match: the distance operator
    /// excludes them. Zero matches is an empty result, not an error.
    pub async fn search(
        &self,
        query_vector: Vec<f32>,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedRestaurant>> {
        let vector = Vector::from(query_vector);

        let mut sql = String::from(
            "SELECT m.id, m.restaurant_id, m.category, m.name, m.price, m.description, \
             1 - (m.embedding <=> $1) AS similarity \
             FROM menu_items m \
             JOIN restaurants r ON m.restaurant_id = r.id \
             WHERE 1 - (m.embedding <=> $1) >= $2 AND r.rating >= $3",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> =
            vec![&vector, &SIMILARITY_THRESHOLD, &filter.min_rating];

        let origin = filter.location;
        if let Some(origin) = origin.as_ref() {
            sql.push_str(
                " AND ST_Distance(r.location::geography, \
                 ST_SetSRID(ST_MakePoint($4, $5), 4326)::geography) <= $6",
            );
            params.push(&origin.long);
            params.push(&origin.lat);
            params.push(&filter.max_distance);
        }
        sql.push_str(" ORDER BY similarity DESC");

        let matches = {
            let client = self.client.lock().await;
            let rows = client
                .query(sql.as_str(), &params)
                .await
                .map_err(db_err)?;
            rows.into_iter()
                .map(|row| ItemMatch {
                    restaurant_id: row.get("restaurant_id"),
                    similarity: row.get("similarity"),
                    item: menu_item_from_row(row),
                })
                .collect::<Vec<_>>()
        };

        let groups = group_by_restaurant(matches, MAX_RESULTS);
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = groups.iter().map(|g| g.restaurant_id).collect();
        let restaurants = self.restaurants_by_ids(&ids).await?;

        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(restaurant) = restaurants
                .iter()
                .find(|r| r.id == group.restaurant_id)
                .cloned()
            else {
                // Deleted between the two queries; its items go with it.
                continue;
            };
            results.push(RankedRestaurant {
                restaurant,
                menu_items: group.items,
            });
        }
        Ok(results)
    }

    async fn restaurants_by_ids(&self, ids: &[i64]) -> Result<Vec<Restaurant>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT id, name, area, rating, badges, \
                 ST_X(location) AS longitude, ST_Y(location) AS latitude \
                 FROM restaurants WHERE id = ANY($1)",
                &[&ids],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(restaurant_from_row).collect())
    }
}
