//! Listing source capability: navigates marketplace list and detail pages
//! and extracts structured records. No persistence side effects.

pub mod image_url;
pub mod kleinanzeigen;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use kleinanzeigen::KleinanzeigenSource;

pub const MARKETPLACE_BASE_URL: &str = "https://www.kleinanzeigen.de";

/// Search parameters for one scrape run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub location: Option<String>,
    pub radius_km: Option<u32>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub page_count: u32,
}

impl SearchQuery {
    /// Build the paginated search URL.
    ///
    /// Shape: `{base}/preis:{min}:{max}/s-seite:{page}?keywords=…&locationStr=…&radius=…`
    pub fn page_url(&self, page: u32) -> String {
        let mut path = String::new();
        if self.min_price.is_some() || self.max_price.is_some() {
            let min = self.min_price.map(|p| p.to_string()).unwrap_or_default();
            let max = self.max_price.map(|p| p.to_string()).unwrap_or_default();
            path.push_str(&format!("/preis:{min}:{max}"));
        }
        path.push_str(&format!("/s-seite:{page}"));

        let mut url = match url::Url::parse(&format!("{MARKETPLACE_BASE_URL}{path}")) {
            Ok(url) => url,
            // The base constant and path are well-formed; this cannot fire
            // for any parameter values.
            Err(_) => return format!("{MARKETPLACE_BASE_URL}{path}"),
        };
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(query) = &self.query {
                pairs.append_pair("keywords", query);
            }
            if let Some(location) = &self.location {
                pairs.append_pair("locationStr", location);
            }
            if let Some(radius) = self.radius_km {
                pairs.append_pair("radius", &radius.to_string());
            }
        }
        let mut rendered = url.to_string();
        if rendered.ends_with('?') {
            rendered.pop();
        }
        rendered
    }

    /// The parameter map persisted on listings discovered by this query.
    pub fn as_params(&self) -> serde_json::Value {
        serde_json::json!({
            "query": self.query,
            "location": self.location,
            "radius": self.radius_km,
            "min_price": self.min_price,
            "max_price": self.max_price,
            "page_count": self.page_count,
        })
    }
}

/// Card-level record from a search results page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingSummary {
    pub external_id: String,
    pub url: String,
    pub title: String,
    /// Price text with `€`, `VB` and thousands dots stripped.
    pub price_text: String,
    pub description: String,
    pub image_url: Option<String>,
}

/// Ad lifecycle state derived from the detail page badges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Reserved,
    Sold,
    Deleted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Pickup,
    Shipping,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Shipping => "shipping",
        }
    }
}

/// Raw and parsed price information from the detail page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PriceInfo {
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub negotiable: Option<bool>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocationInfo {
    pub zip: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Full record from a listing's own page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingDetail {
    pub external_id: String,
    pub categories: Vec<String>,
    pub title: String,
    pub status: ListingStatus,
    pub price: PriceInfo,
    pub delivery: Option<DeliveryMode>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub location: Option<LocationInfo>,
    /// Seller block, kept opaque.
    pub seller: Option<serde_json::Value>,
    /// Key/value attribute list from the details section.
    pub details: BTreeMap<String, String>,
    pub features: Vec<String>,
    /// Free-form extras: creation-date phrase, view counter, …
    pub extra_info: serde_json::Value,
}

/// Capability over the browser pool for fetching marketplace records.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch one search results page and extract its listing cards.
    async fn fetch_list(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> anyhow::Result<Vec<ListingSummary>>;

    /// Fetch the full detail record for one listing.
    async fn fetch_detail(&self, external_id: &str) -> anyhow::Result<ListingDetail>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_includes_price_path_and_params() {
        let query = SearchQuery {
            query: Some("Woom 3".to_string()),
            location: Some("Berlin".to_string()),
            radius_km: Some(25),
            min_price: Some(100),
            max_price: None,
            page_count: 3,
        };
        let url = query.page_url(2);
        assert!(url.starts_with("https://www.kleinanzeigen.de/preis:100:/s-seite:2?"));
        assert!(url.contains("keywords=Woom+3"));
        assert!(url.contains("locationStr=Berlin"));
        assert!(url.contains("radius=25"));
    }

    #[test]
    fn page_url_without_filters_is_bare() {
        let query = SearchQuery {
            page_count: 1,
            ..Default::default()
        };
        assert_eq!(
            query.page_url(1),
            "https://www.kleinanzeigen.de/s-seite:1"
        );
    }
}
