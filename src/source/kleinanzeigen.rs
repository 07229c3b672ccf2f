//! Marketplace implementation of [`ListingSource`] over the context pool.
//!
//! All extraction is defensive: a missing element degrades the record
//! instead of failing the fetch, except for the identity fields a record
//! cannot exist without (card ad id / href, detail page reachability).

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::browser::{ContextPool, PooledContext};

use super::image_url::{
    IMAGE_ATTRIBUTES, content_url_from_ld_json, first_srcset_entry, usable_image_url,
};
use super::{
    DeliveryMode, ListingDetail, ListingSource, ListingStatus, ListingSummary, LocationInfo,
    MARKETPLACE_BASE_URL, PriceInfo, SearchQuery,
};

/// Result cards, sponsored ("top") placements excluded.
const CARD_SELECTOR: &str =
    ".ad-listitem:not(.is-topad):not(.badge-hint-pro-small-srp) article[data-adid]";
const CARD_TITLE_SELECTOR: &str = "h2.text-module-begin a.ellipsis";
const CARD_PRICE_SELECTOR: &str = "p.aditem-main--middle--price-shipping--price";
const CARD_DESCRIPTION_SELECTOR: &str = "p.aditem-main--middle--description";
const CARD_IMAGE_SELECTORS: [&str; 3] = [
    "div.aditem-image img",
    "div.imagebox img",
    "div.aditem-main--top--left img.imagebox-thumbnail",
];

const VIEWS_SELECTOR: &str = "#viewad-cntr-num";

static PRICE_VALUE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d[\d.,]*)").expect("static regex"));
static LOCALITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{5})\s+([^-\n]+?)(?:\s*-\s*(.+))?\s*$").expect("static regex"));
static SPACES_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static NEWLINES_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("static regex"));

#[derive(Debug, Clone)]
pub struct SourceTimeouts {
    pub navigation: Duration,
    pub selector: Duration,
}

impl Default for SourceTimeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(120),
            selector: Duration::from_millis(2500),
        }
    }
}

/// Scrapes the marketplace through pooled browser contexts.
pub struct KleinanzeigenSource {
    pool: Arc<ContextPool>,
    timeouts: SourceTimeouts,
}

impl KleinanzeigenSource {
    pub fn new(pool: Arc<ContextPool>) -> Self {
        Self {
            pool,
            timeouts: SourceTimeouts::default(),
        }
    }

    pub fn with_timeouts(pool: Arc<ContextPool>, timeouts: SourceTimeouts) -> Self {
        Self { pool, timeouts }
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<()> {
        with_timeout(
            async {
                page.goto(url).await.map_err(|e| anyhow!("{e}"))?;
                Ok(())
            },
            self.timeouts.navigation,
            "Page navigation",
        )
        .await?;
        with_timeout(
            async {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| anyhow!("{e}"))?;
                Ok(())
            },
            self.timeouts.navigation,
            "Page load",
        )
        .await
    }

    /// Poll for a selector; absence degrades the record rather than failing.
    async fn wait_for_selector(&self, page: &Page, selector: &str) -> bool {
        let start = Instant::now();
        while start.elapsed() < self.timeouts.selector {
            if page.find_element(selector).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    async fn fetch_list_inner(
        &self,
        ctx: &mut PooledContext,
        url: &str,
    ) -> Result<Vec<ListingSummary>> {
        let page = self.pool.open_page(ctx).await?;
        self.navigate(&page, url).await?;

        let cards = page
            .find_elements(CARD_SELECTOR)
            .await
            .context("Failed to query listing cards")?;
        debug!(url, cards = cards.len(), "Extracting listing cards");

        let mut results = Vec::with_capacity(cards.len());
        for card in &cards {
            match extract_card(card).await {
                Ok(Some(summary)) => results.push(summary),
                Ok(None) => {}
                Err(e) => warn!(url, "Skipping malformed listing card: {e}"),
            }
        }
        Ok(results)
    }

    async fn fetch_detail_inner(
        &self,
        ctx: &mut PooledContext,
        external_id: &str,
    ) -> Result<ListingDetail> {
        let url = format!("{MARKETPLACE_BASE_URL}/s-anzeige/{external_id}");
        let page = self.pool.open_page(ctx).await?;
        self.navigate(&page, &url).await?;

        if !self.wait_for_selector(&page, VIEWS_SELECTOR).await {
            debug!(external_id, "View counter did not appear; continuing");
        }

        let title_raw = element_text(&page, "#viewad-title")
            .await
            .ok_or_else(|| anyhow!("Listing title not found for {external_id}"))?;
        let status = extract_status(&page, &title_raw).await;
        // Status-prefixed titles read "Reserviert • Title"; keep the last segment.
        let title = title_raw
            .rsplit(" • ")
            .next()
            .unwrap_or(&title_raw)
            .trim()
            .to_string();

        let categories: Vec<String> = elements_text(&page, ".breadcrump-link")
            .await
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let price = parse_price(element_text(&page, "#viewad-price").await.as_deref());

        let description = element_text(&page, "#viewad-description-text")
            .await
            .map(|text| collapse_whitespace(&text));

        let images = extract_gallery_images(&page).await;
        let delivery = element_text(&page, ".boxedarticle--details--shipping")
            .await
            .and_then(|text| parse_delivery(&text));
        let location = element_text(&page, "#viewad-locality")
            .await
            .map(|text| parse_locality(&text));
        let seller = extract_seller(&page).await;
        let details = extract_details(&page).await;
        let features = elements_text(&page, "#viewad-configuration li").await;

        let views = element_text(&page, VIEWS_SELECTOR)
            .await
            .unwrap_or_else(|| "0".to_string());
        let created_at = element_text(&page, "#viewad-extra-info div:first-child span").await;
        let extra_info = json!({
            "created_at": created_at,
            "views": views,
        });

        Ok(ListingDetail {
            external_id: external_id.to_string(),
            categories,
            title,
            status,
            price,
            delivery,
            description,
            images,
            location,
            seller,
            details,
            features,
            extra_info,
        })
    }
}

#[async_trait]
impl ListingSource for KleinanzeigenSource {
    async fn fetch_list(&self, query: &SearchQuery, page: u32) -> Result<Vec<ListingSummary>> {
        let url = query.page_url(page);
        let mut ctx = self.pool.acquire_context().await?;
        let result = self.fetch_list_inner(&mut ctx, &url).await;
        self.pool.release_context(ctx).await;
        result
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail> {
        let mut ctx = self.pool.acquire_context().await?;
        let result = self.fetch_detail_inner(&mut ctx, external_id).await;
        self.pool.release_context(ctx).await;
        result
    }
}

async fn with_timeout<F>(operation: F, timeout: Duration, name: &str) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{name} timeout after {}s", timeout.as_secs())),
    }
}

async fn element_text(page: &Page, selector: &str) -> Option<String> {
    let element = page.find_element(selector).await.ok()?;
    element
        .inner_text()
        .await
        .ok()
        .flatten()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

async fn elements_text(page: &Page, selector: &str) -> Vec<String> {
    let Ok(elements) = page.find_elements(selector).await else {
        return Vec::new();
    };
    let mut texts = Vec::with_capacity(elements.len());
    for element in &elements {
        if let Ok(Some(text)) = element.inner_text().await {
            let text = text.trim().to_string();
            if !text.is_empty() {
                texts.push(text);
            }
        }
    }
    texts
}

async fn child_text(parent: &Element, selector: &str) -> String {
    match parent.find_element(selector).await {
        Ok(element) => element
            .inner_text()
            .await
            .ok()
            .flatten()
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

async fn extract_card(article: &Element) -> Result<Option<ListingSummary>> {
    let external_id = article
        .attribute("data-adid")
        .await
        .context("Failed to read data-adid")?;
    let href = article
        .attribute("data-href")
        .await
        .context("Failed to read data-href")?;
    let (Some(external_id), Some(href)) = (external_id, href) else {
        return Ok(None);
    };

    let title = child_text(article, CARD_TITLE_SELECTOR).await;
    let price_text = child_text(article, CARD_PRICE_SELECTOR)
        .await
        .replace('€', "")
        .replace("VB", "")
        .replace('.', "")
        .trim()
        .to_string();
    let description = child_text(article, CARD_DESCRIPTION_SELECTOR).await;
    let image_url = extract_card_image(article).await;

    Ok(Some(ListingSummary {
        external_id,
        url: format!("{MARKETPLACE_BASE_URL}{href}"),
        title,
        price_text,
        description,
        image_url,
    }))
}

/// Try selector/attribute combinations for a usable thumbnail URL, falling
/// back to `srcset` and finally the card's ld+json block.
async fn extract_card_image(article: &Element) -> Option<String> {
    let mut image_element = None;
    for selector in CARD_IMAGE_SELECTORS {
        if let Ok(element) = article.find_element(selector).await {
            image_element = Some(element);
            break;
        }
    }

    if let Some(img) = &image_element {
        for attr in IMAGE_ATTRIBUTES {
            if let Ok(Some(candidate)) = img.attribute(attr).await
                && let Some(url) = usable_image_url(&candidate)
            {
                return Some(url);
            }
        }
        if let Ok(Some(srcset)) = img.attribute("srcset").await
            && let Some(url) = first_srcset_entry(&srcset)
        {
            return Some(url);
        }
    }

    if let Ok(script) = article
        .find_element("script[type='application/ld+json']")
        .await
        && let Ok(Some(raw)) = script.inner_text().await
    {
        return content_url_from_ld_json(&raw);
    }

    None
}

async fn extract_status(page: &Page, title_text: &str) -> ListingStatus {
    let mut status = ListingStatus::Active;
    if title_text.contains("Verkauft") {
        status = ListingStatus::Sold;
    } else if title_text.contains("Reserviert •") {
        status = ListingStatus::Reserved;
    } else if title_text.contains("Gelöscht •") {
        status = ListingStatus::Deleted;
    }

    if let Ok(title_element) = page.find_element("#viewad-title").await
        && let Ok(Some(classes)) = title_element.attribute("class").await
        && classes.contains("is-sold")
    {
        status = ListingStatus::Sold;
    }
    if page.find_element(".badge-sold").await.is_ok() {
        status = ListingStatus::Sold;
    }
    status
}

async fn extract_gallery_images(page: &Page) -> Vec<String> {
    let Ok(images) = page.find_elements("#viewad-image img, .galleryimage-element img").await
    else {
        return Vec::new();
    };
    let mut urls = Vec::new();
    for img in &images {
        for attr in IMAGE_ATTRIBUTES {
            if let Ok(Some(candidate)) = img.attribute(attr).await
                && let Some(url) = usable_image_url(&candidate)
            {
                if !urls.contains(&url) {
                    urls.push(url);
                }
                break;
            }
        }
    }
    urls
}

async fn extract_seller(page: &Page) -> Option<serde_json::Value> {
    let name = element_text(page, "#viewad-contact .userprofile-vip a").await;
    let since = element_text(page, "#viewad-contact .userprofile-vip-details-text").await;
    let badges = elements_text(page, "#viewad-contact .userbadges-vip span").await;
    if name.is_none() && since.is_none() && badges.is_empty() {
        return None;
    }
    Some(json!({
        "name": name,
        "active_since": since,
        "badges": badges,
    }))
}

async fn extract_details(page: &Page) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    let Ok(items) = page.find_elements("#viewad-details li.addetailslist--detail").await else {
        return details;
    };
    for item in &items {
        let Ok(Some(full)) = item.inner_text().await else {
            continue;
        };
        let value = child_text(item, ".addetailslist--detail--value").await;
        let key = full
            .strip_suffix(value.as_str())
            .unwrap_or(&full)
            .trim()
            .to_string();
        if !key.is_empty() {
            details.insert(key, value.trim().to_string());
        }
    }
    details
}

/// Parse a detail-page price label like `"1.250 € VB"`.
pub fn parse_price(raw: Option<&str>) -> PriceInfo {
    let Some(raw) = raw else {
        return PriceInfo::default();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return PriceInfo::default();
    }

    let amount = PRICE_VALUE_PATTERN
        .captures(trimmed)
        .map(|caps| caps[1].to_string());
    let currency = trimmed.contains('€').then(|| "€".to_string());
    let negotiable = Some(trimmed.contains("VB"));

    PriceInfo {
        amount,
        currency,
        negotiable,
        raw: Some(trimmed.to_string()),
    }
}

pub fn parse_delivery(raw: &str) -> Option<DeliveryMode> {
    if raw.contains("Nur Abholung") {
        Some(DeliveryMode::Pickup)
    } else if raw.contains("Versand") {
        Some(DeliveryMode::Shipping)
    } else {
        None
    }
}

/// Parse a locality line like `"10115 Berlin - Mitte"`.
pub fn parse_locality(raw: &str) -> LocationInfo {
    let trimmed = raw.trim();
    if let Some(caps) = LOCALITY_PATTERN.captures(trimmed) {
        LocationInfo {
            zip: Some(caps[1].to_string()),
            city: Some(caps[2].trim().to_string()),
            state: caps.get(3).map(|m| m.as_str().trim().to_string()),
        }
    } else {
        LocationInfo {
            zip: None,
            city: Some(trimmed.to_string()).filter(|c| !c.is_empty()),
            state: None,
        }
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    let spaced = SPACES_PATTERN.replace_all(text, " ");
    NEWLINES_PATTERN.replace_all(&spaced, "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parsing_variants() {
        let price = parse_price(Some("1.250 € VB"));
        assert_eq!(price.amount.as_deref(), Some("1.250"));
        assert_eq!(price.currency.as_deref(), Some("€"));
        assert_eq!(price.negotiable, Some(true));

        let fixed = parse_price(Some("450 €"));
        assert_eq!(fixed.amount.as_deref(), Some("450"));
        assert_eq!(fixed.negotiable, Some(false));

        let free = parse_price(Some("Zu verschenken"));
        assert_eq!(free.amount, None);
        assert_eq!(free.currency, None);

        assert_eq!(parse_price(None), PriceInfo::default());
    }

    #[test]
    fn delivery_parsing() {
        assert_eq!(parse_delivery("Nur Abholung"), Some(DeliveryMode::Pickup));
        assert_eq!(
            parse_delivery("Versand möglich"),
            Some(DeliveryMode::Shipping)
        );
        assert_eq!(parse_delivery("keine Angabe"), None);
    }

    #[test]
    fn locality_parsing() {
        let loc = parse_locality("10115 Berlin - Mitte");
        assert_eq!(loc.zip.as_deref(), Some("10115"));
        assert_eq!(loc.city.as_deref(), Some("Berlin"));
        assert_eq!(loc.state.as_deref(), Some("Mitte"));

        let bare = parse_locality("München");
        assert_eq!(bare.zip, None);
        assert_eq!(bare.city.as_deref(), Some("München"));
    }

    #[test]
    fn whitespace_collapse() {
        assert_eq!(
            collapse_whitespace("a  b\t c\n\n\nd  "),
            "a b c\nd"
        );
    }
}
