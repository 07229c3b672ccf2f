//! Image URL normalisation for listing cards and galleries.
//!
//! Search cards lazy-load their thumbnails, so the usable URL may live in
//! `src`, one of several `data-*` attributes, the first `srcset` entry, or
//! the card's ld+json block. Placeholder and inline data URLs are rejected.

/// Attributes probed on `<img>` elements, in priority order.
pub const IMAGE_ATTRIBUTES: [&str; 4] = ["src", "data-src", "data-imgsrc", "data-img-src"];

const PLACEHOLDER_TOKENS: [&str; 2] = ["placeholder", "data:image"];

/// Trim, upgrade protocol-relative URLs, and drop empty values.
pub fn normalize_image_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    Some(trimmed.to_string())
}

pub fn is_placeholder(url: &str) -> bool {
    PLACEHOLDER_TOKENS.iter().any(|token| url.contains(token))
}

/// Normalise and reject placeholders in one step.
pub fn usable_image_url(raw: &str) -> Option<String> {
    let normalized = normalize_image_url(raw)?;
    if is_placeholder(&normalized) {
        return None;
    }
    Some(normalized)
}

/// First URL of a `srcset` attribute (`"url1 1x, url2 2x"`).
pub fn first_srcset_entry(srcset: &str) -> Option<String> {
    let first = srcset.split(',').next()?.trim();
    let url = first.split_whitespace().next()?;
    usable_image_url(url)
}

/// `contentUrl` from a card's `application/ld+json` script, if present.
pub fn content_url_from_ld_json(raw: &str) -> Option<String> {
    let data: serde_json::Value = serde_json::from_str(raw).ok()?;
    let candidate = data
        .get("contentUrl")
        .or_else(|| data.get("contentURL"))?;
    let url = match candidate {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    usable_image_url(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_relative_urls_get_https() {
        assert_eq!(
            normalize_image_url("//img.example.de/a.jpg").as_deref(),
            Some("https://img.example.de/a.jpg")
        );
    }

    #[test]
    fn placeholders_are_rejected() {
        assert_eq!(usable_image_url("https://cdn.example.de/placeholder.png"), None);
        assert_eq!(usable_image_url("data:image/gif;base64,R0lG"), None);
        assert!(usable_image_url("https://cdn.example.de/real.jpg").is_some());
    }

    #[test]
    fn srcset_takes_first_entry() {
        assert_eq!(
            first_srcset_entry("//cdn.example.de/a.jpg 1x, //cdn.example.de/b.jpg 2x").as_deref(),
            Some("https://cdn.example.de/a.jpg")
        );
        assert_eq!(first_srcset_entry(""), None);
    }

    #[test]
    fn ld_json_content_url() {
        let raw = r#"{"@type":"ImageObject","contentUrl":"//cdn.example.de/c.jpg"}"#;
        assert_eq!(
            content_url_from_ld_json(raw).as_deref(),
            Some("https://cdn.example.de/c.jpg")
        );
        let list = r#"{"contentUrl":["https://cdn.example.de/d.jpg"]}"#;
        assert_eq!(
            content_url_from_ld_json(list).as_deref(),
            Some("https://cdn.example.de/d.jpg")
        );
        assert_eq!(content_url_from_ld_json("not json"), None);
    }
}
