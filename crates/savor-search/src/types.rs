//! HTTP request shapes and their validation.

use serde::Deserialize;

use savor_common::{Error, Result};
use savor_store::{GeoPoint, MenuItemDraft, RestaurantDraft};

/// Body of `POST /restaurants`: a batch of restaurants with nested menu
/// items. The batch commits all-or-nothing.
#[derive(Debug, Deserialize)]
pub struct CreateRestaurantsRequest {
    #[serde(default)]
    pub restaurants: Vec<RestaurantInput>,
}

#[derive(Debug, Deserialize)]
pub struct RestaurantInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub area: String,
    pub location: GeoPoint,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub menu_items: Vec<MenuItemInput>,
}

#[derive(Debug, Deserialize)]
pub struct MenuItemInput {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub description: String,
}

impl CreateRestaurantsRequest {
    pub fn validate(&self) -> Result<()> {
        if self.restaurants.is_empty() {
            return Err(Error::InvalidInput("no restaurants provided".into()));
        }
        for restaurant in &self.restaurants {
            if restaurant.name.is_empty() || restaurant.area.is_empty() || restaurant.rating == 0.0
            {
                return Err(Error::InvalidInput(
                    "restaurant name, area, and rating are required".into(),
                ));
            }
            for item in &restaurant.menu_items {
                if item.name.is_empty() || item.description.is_empty() || item.price == 0.0 {
                    return Err(Error::InvalidInput(
                        "menu item name, description, and price are required".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn into_drafts(self) -> Vec<RestaurantDraft> {
        self.restaurants
            .into_iter()
            .map(|restaurant| RestaurantDraft {
                name: restaurant.name,
                area: restaurant.area,
                rating: restaurant.rating,
                badges: restaurant.badges,
                location: restaurant.location,
                menu_items: restaurant
                    .menu_items
                    .into_iter()
                    .map(|item| MenuItemDraft {
                        category: item.category,
                        name: item.name,
                        price: item.price,
                        description: item.description,
                    })
                    .collect(),
            })
            .collect()
    }
}
