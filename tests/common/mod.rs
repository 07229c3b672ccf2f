//! Shared fixtures: record builders and a scriptable listing source.

#![allow(dead_code)]

use adscout::source::{
    ListingDetail, ListingSource, ListingStatus, ListingSummary, PriceInfo, SearchQuery,
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

pub fn summary(external_id: &str) -> ListingSummary {
    ListingSummary {
        external_id: external_id.to_string(),
        url: format!("https://www.kleinanzeigen.de/s-anzeige/{external_id}"),
        title: format!("Anzeige {external_id}"),
        price_text: "100".to_string(),
        description: "Testbeschreibung".to_string(),
        image_url: Some(format!("https://img.example.de/{external_id}.jpg")),
    }
}

pub fn detail(external_id: &str, images: &[&str]) -> ListingDetail {
    ListingDetail {
        external_id: external_id.to_string(),
        categories: vec!["Testkategorie".to_string()],
        title: format!("Anzeige {external_id}"),
        status: ListingStatus::Active,
        price: PriceInfo {
            amount: Some("100".to_string()),
            currency: Some("€".to_string()),
            negotiable: Some(false),
            raw: Some("100 €".to_string()),
        },
        delivery: None,
        description: Some("Testbeschreibung".to_string()),
        images: images.iter().map(|s| s.to_string()).collect(),
        location: None,
        seller: None,
        details: BTreeMap::new(),
        features: vec![],
        extra_info: json!({ "created_at": "Heute 09:00", "views": "1" }),
    }
}

/// Listing source with scriptable failures and call recording.
#[derive(Default)]
pub struct MockSource {
    /// Summaries returned per successful page.
    pub summaries_per_page: usize,
    /// Pages that always fail with this error message.
    pub failing_pages: HashSet<u32>,
    pub failure_message: String,
    /// External ids whose detail fetch fails.
    pub failing_details: HashSet<String>,
    /// When set, every page returns summaries with exactly these ids.
    pub fixed_ids: Option<Vec<String>>,
    pub list_calls: Mutex<Vec<u32>>,
    pub detail_calls: Mutex<Vec<String>>,
}

impl MockSource {
    pub fn new(summaries_per_page: usize) -> Self {
        Self {
            summaries_per_page,
            failure_message: "connection reset by peer".to_string(),
            ..Default::default()
        }
    }

    pub fn list_call_count(&self, page: u32) -> usize {
        self.list_calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|&&p| p == page)
            .count()
    }

    pub fn total_list_calls(&self) -> usize {
        self.list_calls.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl ListingSource for MockSource {
    async fn fetch_list(&self, _query: &SearchQuery, page: u32) -> Result<Vec<ListingSummary>> {
        self.list_calls.lock().expect("lock poisoned").push(page);
        if self.failing_pages.contains(&page) {
            bail!("{}", self.failure_message);
        }
        if let Some(ids) = &self.fixed_ids {
            return Ok(ids.iter().map(|id| summary(id)).collect());
        }
        Ok((0..self.summaries_per_page)
            .map(|i| summary(&format!("{page}00{i}")))
            .collect())
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<ListingDetail> {
        self.detail_calls
            .lock()
            .expect("lock poisoned")
            .push(external_id.to_string());
        if self.failing_details.contains(external_id) {
            bail!("server returned 404 for ad {external_id}");
        }
        Ok(detail(
            external_id,
            &[&format!("https://img.example.de/{external_id}.jpg")],
        ))
    }
}
