//! Row types and their embedding fingerprints.
//!
//! A fingerprint is the canonical text rendering of a row that gets fed to
//! the embedding model. The exact format is an external contract: changing
//! it moves every row in vector space and requires a full re-embed, so the
//! strings below must stay byte-stable.

use serde::{Deserialize, Serialize};

/// A WGS84 point. Longitude first when it reaches SQL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: i64,
    pub name: String,
    pub area: String,
    pub rating: f64,
    pub badges: Vec<String>,
    pub location: Option<GeoPoint>,
}

impl Restaurant {
    /// Text rendering fed to the embedding model.
    pub fn fingerprint(&self) -> String {
        format!(
            "Restaurant: {}, Area: {}, Rating: {:.1}, Badges: {}",
            self.name,
            self.area,
            self.rating,
            self.badges.join(", ")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: i64,
    pub restaurant_id: i64,
    pub category: String,
    pub name: String,
    pub price: f64,
    pub description: String,
}

impl MenuItem {
    /// Text rendering fed to the embedding model.
    pub fn fingerprint(&self) -> String {
        format!(
            "MenuItem: {}, Category: {}, Price: {:.2}, Description: {}",
            self.name, self.category, self.price, self.description
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub restaurant_id: i64,
    pub name: String,
}

impl Category {
    /// Text rendering fed to the embedding model.
    pub fn fingerprint(&self) -> String {
        format!("Category: {}", self.name)
    }
}

/// One search result: a restaurant with the menu items that matched the
/// query, ranked by the best item similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedRestaurant {
    pub restaurant: Restaurant,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub menu_items: Vec<MenuItem>,
}

/// Input shape for a restaurant to create, with its nested menu items.
#[derive(Debug, Clone)]
pub struct RestaurantDraft {
    pub name: String,
    pub area: String,
    pub rating: f64,
    pub badges: Vec<String>,
    pub location: GeoPoint,
    pub menu_items: Vec<MenuItemDraft>,
}

/// Input shape for a menu item to create.
#[derive(Debug, Clone)]
pub struct MenuItemDraft {
    pub category: String,
    pub name: String,
    pub price: f64,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restaurant_fingerprint() {
        let restaurant = Restaurant {
            id: 1,
            name: "Ramen House".into(),
            area: "Downtown".into(),
            rating: 4.5,
            badges: vec!["family friendly".into(), "outdoor seating".into()],
            location: None,
        };
        assert_eq!(
            restaurant.fingerprint(),
            "Restaurant: Ramen House, Area: Downtown, Rating: 4.5, Badges: family friendly, outdoor seating"
        );
    }

    #[test]
    fn test_restaurant_fingerprint_no_badges() {
        let restaurant = Restaurant {
            id: 1,
            name: "Ramen House".into(),
            area: "Downtown".into(),
            rating: 4.0,
            badges: vec![],
            location: None,
        };
        assert_eq!(
            restaurant.fingerprint(),
            "Restaurant: Ramen House, Area: Downtown, Rating: 4.0, Badges: "
        );
    }

    #[test]
    fn test_menu_item_fingerprint() {
        let item = MenuItem {
            id: 7,
            restaurant_id: 1,
            category: "Mains".into(),
            name: "Tonkotsu".into(),
            price: 42.0,
            description: "Pork bone broth ramen".into(),
        };
        assert_eq!(
            item.fingerprint(),
            "MenuItem: Tonkotsu, Category: Mains, Price: 42.00, Description: Pork bone broth ramen"
        );
    }

    #[test]
    fn test_category_fingerprint() {
        let category = Category {
            id: 3,
            restaurant_id: 1,
            name: "Desserts".into(),
        };
        assert_eq!(category.fingerprint(), "Category: Desserts");
    }
}
