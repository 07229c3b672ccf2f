//! Listing persistence: upsert by external id, filtered listing queries,
//! and the suspicion flag lifecycle.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Europe::Berlin;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, SqliteConnection};
use tracing::debug;

use crate::source::{ListingDetail, ListingSummary};

static TIME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[:.](\d{2})").expect("static regex"));
static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{2,4})").expect("static regex"));
static DECIMAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("static regex"));

/// Canonical record for one ad.
#[derive(Debug, Clone)]
pub struct Listing {
    pub id: i64,
    pub external_id: String,
    pub query_name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price_amount: Option<String>,
    pub price_currency: Option<String>,
    pub price_negotiable: Option<bool>,
    pub price_text: Option<String>,
    pub url: Option<String>,
    pub status: Option<String>,
    pub delivery: Option<String>,
    pub thumbnail_url: Option<String>,
    pub categories: Option<Value>,
    pub location: Option<Value>,
    pub seller: Option<Value>,
    pub details: Option<Value>,
    pub features: Option<Value>,
    pub extra_info: Option<Value>,
    pub image_urls: Vec<String>,
    pub search_params: Option<Value>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub posted_at_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_suspicious: bool,
    pub suspicion_reason: Option<String>,
    pub suspicion_confidence: Option<f64>,
    pub suspicion_meta: Option<Value>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
}

/// Result metadata for one upsert.
#[derive(Debug)]
pub struct UpsertOutcome {
    pub listing: Listing,
    pub was_created: bool,
    /// True when the *set* of image URLs differs from the stored set, or the
    /// row was just created.
    pub images_changed: bool,
}

/// Filters for [`ListingStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub limit: i64,
    pub offset: i64,
    pub query_name: Option<String>,
    pub status: Option<String>,
    /// Case-insensitive substring over title and description.
    pub search_term: Option<String>,
}

pub struct ListingStore;

impl ListingStore {
    /// Create or refresh a listing by its external id.
    pub async fn upsert(
        conn: &mut SqliteConnection,
        summary: &ListingSummary,
        detail: Option<&ListingDetail>,
        query_name: Option<&str>,
        search_params: Option<&Value>,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let external_id = detail
            .map(|d| d.external_id.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or(summary.external_id.as_str());
        if external_id.is_empty() {
            anyhow::bail!("Missing external id for listing persistence");
        }

        let existing = Self::get_by_external_id(conn, external_id).await?;
        let was_created = existing.is_none();

        let title = detail
            .map(|d| d.title.clone())
            .filter(|t| !t.is_empty())
            .or_else(|| non_empty(&summary.title));
        let description = detail
            .and_then(|d| d.description.clone())
            .or_else(|| non_empty(&summary.description));
        let price_amount = detail
            .and_then(|d| d.price.amount.as_deref())
            .and_then(normalize_amount);
        let price_currency = detail.and_then(|d| d.price.currency.clone());
        let price_negotiable = detail.and_then(|d| d.price.negotiable);
        let price_text = non_empty(&summary.price_text)
            .or_else(|| detail.and_then(|d| d.price.raw.clone()));
        let status = detail.map(|d| d.status.as_str().to_string());
        let delivery = detail.and_then(|d| d.delivery.map(|m| m.as_str().to_string()));
        let categories = detail.map(|d| Value::from(d.categories.clone()));
        let location = detail
            .and_then(|d| d.location.as_ref())
            .map(|loc| serde_json::to_value(loc))
            .transpose()?;
        let seller = detail.and_then(|d| d.seller.clone());
        let details_map = detail
            .map(|d| serde_json::to_value(&d.details))
            .transpose()?;
        let features = detail.map(|d| Value::from(d.features.clone()));
        let extra_info = detail
            .map(|d| d.extra_info.clone())
            .filter(|v| !v.is_null());

        let image_urls: Vec<String> = match detail {
            Some(d) if !d.images.is_empty() => d.images.clone(),
            _ => summary.image_url.iter().cloned().collect(),
        };
        let previous_images: std::collections::HashSet<&str> = existing
            .as_ref()
            .map(|l| l.image_urls.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let new_images: std::collections::HashSet<&str> =
            image_urls.iter().map(String::as_str).collect();
        let images_changed = was_created || previous_images != new_images;

        let posted_source = detail
            .and_then(|d| d.extra_info.get("created_at"))
            .and_then(Value::as_str);
        let (parsed_at, posted_text) = match posted_source {
            Some(raw) => parse_posted_at(raw),
            None => (None, None),
        };
        let existing_posted_at = existing.as_ref().and_then(|l| l.posted_at);
        let existing_posted_text = existing.as_ref().and_then(|l| l.posted_at_text.clone());
        let posted_at = parsed_at.or(existing_posted_at);
        // Keep the raw phrase when it parsed, or when no text was stored yet.
        let posted_at_text = match posted_text {
            Some(text) if parsed_at.is_some() || existing_posted_text.is_none() => Some(text),
            _ => existing_posted_text,
        };

        let image_urls_json = serde_json::to_string(&image_urls)?;

        if let Some(existing) = &existing {
            sqlx::query(
                r#"
                UPDATE listings SET
                    query_name = ?, title = ?, description = ?,
                    price_amount = ?, price_currency = ?, price_negotiable = ?, price_text = ?,
                    url = ?, status = ?, delivery = ?, thumbnail_url = ?,
                    categories = ?, location = ?, seller = ?, details = ?, features = ?,
                    extra_info = ?, image_urls = ?, search_params = ?,
                    last_seen_at = ?, posted_at = ?, posted_at_text = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(query_name)
            .bind(&title)
            .bind(&description)
            .bind(&price_amount)
            .bind(&price_currency)
            .bind(price_negotiable)
            .bind(&price_text)
            .bind(non_empty(&summary.url))
            .bind(&status)
            .bind(&delivery)
            .bind(&summary.image_url)
            .bind(categories.map(|v| v.to_string()))
            .bind(location.map(|v| v.to_string()))
            .bind(seller.map(|v| v.to_string()))
            .bind(details_map.map(|v| v.to_string()))
            .bind(features.map(|v| v.to_string()))
            .bind(extra_info.map(|v| v.to_string()))
            .bind(&image_urls_json)
            .bind(search_params.map(|v| v.to_string()))
            .bind(now)
            .bind(posted_at)
            .bind(&posted_at_text)
            .bind(now)
            .bind(existing.id)
            .execute(&mut *conn)
            .await
            .context("Failed to update listing")?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO listings (
                    external_id, query_name, title, description,
                    price_amount, price_currency, price_negotiable, price_text,
                    url, status, delivery, thumbnail_url,
                    categories, location, seller, details, features,
                    extra_info, image_urls, search_params,
                    first_seen_at, last_seen_at, posted_at, posted_at_text,
                    created_at, updated_at, is_suspicious
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                "#,
            )
            .bind(external_id)
            .bind(query_name)
            .bind(&title)
            .bind(&description)
            .bind(&price_amount)
            .bind(&price_currency)
            .bind(price_negotiable)
            .bind(&price_text)
            .bind(non_empty(&summary.url))
            .bind(&status)
            .bind(&delivery)
            .bind(&summary.image_url)
            .bind(categories.map(|v| v.to_string()))
            .bind(location.map(|v| v.to_string()))
            .bind(seller.map(|v| v.to_string()))
            .bind(details_map.map(|v| v.to_string()))
            .bind(features.map(|v| v.to_string()))
            .bind(extra_info.map(|v| v.to_string()))
            .bind(&image_urls_json)
            .bind(search_params.map(|v| v.to_string()))
            .bind(now)
            .bind(now)
            .bind(posted_at)
            .bind(&posted_at_text)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("Failed to insert listing")?;
        }

        let listing = Self::get_by_external_id(conn, external_id)
            .await?
            .context("Listing vanished after upsert")?;

        Ok(UpsertOutcome {
            listing,
            was_created,
            images_changed,
        })
    }

    pub async fn get_by_external_id(
        conn: &mut SqliteConnection,
        external_id: &str,
    ) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to query listing by external id")?;
        row.as_ref().map(listing_from_row).transpose()
    }

    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to query listing by id")?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Filtered page of listings ordered by `last_seen_at DESC`, plus the
    /// total matching count.
    pub async fn list(
        conn: &mut SqliteConnection,
        filter: &ListingFilter,
    ) -> Result<(Vec<Listing>, i64)> {
        let mut count_builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(id) FROM listings");
        push_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .context("Failed to count listings")?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("SELECT * FROM listings");
        push_filters(&mut builder, filter);
        builder.push(" ORDER BY last_seen_at DESC LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset);

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list listings")?;
        let listings = rows
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((listings, total))
    }

    pub async fn mark_suspicion(
        conn: &mut SqliteConnection,
        listing_id: i64,
        reason: &str,
        confidence: Option<f64>,
        meta: Option<&Value>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE listings SET
                is_suspicious = 1, suspicion_reason = ?, suspicion_confidence = ?,
                suspicion_meta = ?, last_analyzed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(confidence)
        .bind(meta.map(|v| v.to_string()))
        .bind(now)
        .bind(now)
        .bind(listing_id)
        .execute(&mut *conn)
        .await
        .context("Failed to mark listing suspicious")?;
        Ok(())
    }

    pub async fn clear_suspicion(conn: &mut SqliteConnection, listing_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE listings SET
                is_suspicious = 0, suspicion_reason = NULL, suspicion_confidence = NULL,
                suspicion_meta = NULL, last_analyzed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(listing_id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear listing suspicion")?;
        Ok(())
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, filter: &ListingFilter) {
    let mut has_where = false;
    let mut push_clause = |builder: &mut QueryBuilder<'_, sqlx::Sqlite>| {
        builder.push(if has_where { " AND " } else { " WHERE " });
        has_where = true;
    };

    if let Some(query_name) = &filter.query_name {
        push_clause(builder);
        builder.push("query_name = ");
        builder.push_bind(query_name.clone());
    }
    if let Some(status) = &filter.status {
        push_clause(builder);
        builder.push("status = ");
        builder.push_bind(status.clone());
    }
    if let Some(term) = &filter.search_term {
        push_clause(builder);
        let pattern = format!("%{}%", term.to_lowercase());
        builder.push("(LOWER(COALESCE(title, '')) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(COALESCE(description, '')) LIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    Ok(Listing {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        query_name: row.try_get("query_name")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price_amount: row.try_get("price_amount")?,
        price_currency: row.try_get("price_currency")?,
        price_negotiable: row.try_get("price_negotiable")?,
        price_text: row.try_get("price_text")?,
        url: row.try_get("url")?,
        status: row.try_get("status")?,
        delivery: row.try_get("delivery")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        categories: json_column(row, "categories")?,
        location: json_column(row, "location")?,
        seller: json_column(row, "seller")?,
        details: json_column(row, "details")?,
        features: json_column(row, "features")?,
        extra_info: json_column(row, "extra_info")?,
        image_urls: json_column(row, "image_urls")?
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        search_params: json_column(row, "search_params")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        posted_at: row.try_get("posted_at")?,
        posted_at_text: row.try_get("posted_at_text")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        is_suspicious: row.try_get("is_suspicious")?,
        suspicion_reason: row.try_get("suspicion_reason")?,
        suspicion_confidence: row.try_get("suspicion_confidence")?,
        suspicion_meta: json_column(row, "suspicion_meta")?,
        last_analyzed_at: row.try_get("last_analyzed_at")?,
    })
}

fn json_column(row: &SqliteRow, column: &str) -> Result<Option<Value>> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("Malformed JSON in column {column}"))?,
        )),
        None => Ok(None),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Normalise a raw price string to a decimal string.
///
/// Thousands dots are stripped and the decimal comma becomes a dot;
/// anything that does not validate as a decimal yields `None`.
pub fn normalize_amount(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let normalized = text.replace('.', "").replace(',', ".");
    if DECIMAL_PATTERN.is_match(&normalized) {
        Some(normalized)
    } else {
        debug!(value = raw, "Failed to normalise price amount");
        None
    }
}

/// Parse the marketplace's German creation-date phrases.
///
/// Handles `"Heute HH:MM"`, `"Gestern HH:MM"`, and `"DD.MM.YY(YY)[,] HH:MM
/// [Uhr]"`, interpreted in Europe/Berlin and returned as a UTC instant.
/// Phrases like `"Vor 2 Stunden"` cannot be converted deterministically;
/// only the raw text is kept.
pub fn parse_posted_at(raw: &str) -> (Option<DateTime<Utc>>, Option<String>) {
    parse_posted_at_with_now(raw, Utc::now().with_timezone(&Berlin))
}

pub fn parse_posted_at_with_now(
    raw: &str,
    now_berlin: DateTime<Tz>,
) -> (Option<DateTime<Utc>>, Option<String>) {
    let text = raw.trim();
    if text.is_empty() {
        return (None, None);
    }

    let normalized = text.replace("Uhr", "");
    let normalized = normalized.trim();
    let lower = normalized.to_lowercase();

    let date_match = DATE_PATTERN.captures(normalized);
    let date = date_match.as_ref().and_then(|caps| {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let mut year: i32 = caps[3].parse().ok()?;
        if year < 100 {
            year += 2000;
        }
        Some((year, month, day))
    });

    // `15.01.24` would itself match the time pattern, so when a date is
    // present the time is only searched for after it.
    let time_region = match date_match
        .as_ref()
        .and_then(|caps| caps.get(0))
        .map(|m| m.end())
    {
        Some(end) => &normalized[end..],
        None => normalized,
    };
    let time = TIME_PATTERN.captures(time_region).and_then(|caps| {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        (hour < 24 && minute < 60).then_some((hour, minute))
    });

    let base_day = if lower.starts_with("heute") {
        Some((now_berlin.year(), now_berlin.month(), now_berlin.day()))
    } else if lower.starts_with("gestern") {
        let yesterday = now_berlin - chrono::Duration::days(1);
        Some((yesterday.year(), yesterday.month(), yesterday.day()))
    } else {
        date
    };

    let posted_at = base_day.and_then(|(year, month, day)| {
        let (hour, minute) = time.unwrap_or((now_berlin.hour(), now_berlin.minute()));
        let local = Berlin.with_ymd_and_hms(year, month, day, hour, minute, 0);
        // DST transitions: an ambiguous wall time takes the earlier offset,
        // a non-existent one fails the parse.
        match local {
            chrono::LocalResult::Single(dt) => Some(dt),
            chrono::LocalResult::Ambiguous(dt, _) => Some(dt),
            chrono::LocalResult::None => None,
        }
    });

    match posted_at {
        Some(dt) => (Some(dt.with_timezone(&Utc)), Some(text.to_string())),
        None => (None, Some(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn berlin_now() -> DateTime<Tz> {
        // A fixed reference inside CEST (UTC+2).
        match Berlin.with_ymd_and_hms(2024, 6, 15, 12, 0, 0) {
            chrono::LocalResult::Single(dt) => dt,
            _ => panic!("reference instant must be unambiguous"),
        }
    }

    #[test]
    fn normalize_amount_variants() {
        assert_eq!(normalize_amount("1.234,50").as_deref(), Some("1234.50"));
        assert_eq!(normalize_amount("450").as_deref(), Some("450"));
        assert_eq!(normalize_amount(""), None);
        assert_eq!(normalize_amount("abc"), None);
        assert_eq!(normalize_amount("12,5").as_deref(), Some("12.5"));
    }

    #[test]
    fn heute_resolves_to_current_day_in_berlin() {
        let (posted, text) = parse_posted_at_with_now("Heute 08:15 Uhr", berlin_now());
        let posted = posted.expect("should parse");
        // 08:15 CEST == 06:15 UTC.
        assert_eq!(posted.to_rfc3339(), "2024-06-15T06:15:00+00:00");
        assert_eq!(text.as_deref(), Some("Heute 08:15 Uhr"));
    }

    #[test]
    fn gestern_resolves_to_previous_day() {
        let (posted, _) = parse_posted_at_with_now("Gestern 23:59", berlin_now());
        let posted = posted.expect("should parse");
        assert_eq!(posted.to_rfc3339(), "2024-06-14T21:59:00+00:00");
    }

    #[test]
    fn explicit_date_with_two_digit_year() {
        let (posted, _) = parse_posted_at_with_now("15.01.24, 13:45", berlin_now());
        let posted = posted.expect("should parse");
        // January is CET (UTC+1).
        assert_eq!(posted.to_rfc3339(), "2024-01-15T12:45:00+00:00");
    }

    #[test]
    fn relative_phrases_keep_only_raw_text() {
        let (posted, text) = parse_posted_at_with_now("Vor 2 Stunden", berlin_now());
        assert_eq!(posted, None);
        assert_eq!(text.as_deref(), Some("Vor 2 Stunden"));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(parse_posted_at_with_now("  ", berlin_now()), (None, None));
    }
}
