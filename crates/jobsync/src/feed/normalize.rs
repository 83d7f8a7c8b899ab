//! Per-source extraction rules.

use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use super::xml::{parse_feed, RawItem};
use super::{FeedFormat, FeedSource, JobType, NormalizedItem};
use crate::error::FeedError;
use crate::sanitize::{body_sample, redact_url};

const HIGHER_ED_COMPANY: &str = "Higher Ed Institution";
const HIGHER_ED_CATEGORY: &str = "Education";
const UNKNOWN_LOCATION: &str = "Not specified";

static RE_PAREN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([^)]*)\)").unwrap());

/// Markers of bot-protection and interstitial pages served instead of a feed.
const INTERSTITIAL_MARKERS: &[&str] = &[
    "just a moment",
    "cf-browser-verification",
    "cf-challenge",
    "attention required",
    "captcha",
    "access denied",
    "enable javascript",
];

/// Normalizes a raw payload for `source` into canonical items.
///
/// Fails with `NotAFeed` for HTML or interstitial responses, `Parse` for
/// malformed XML, and `UnsupportedSource` for unknown source names.
pub fn normalize_feed(
    body: &str,
    content_type: Option<&str>,
    source: &FeedSource,
) -> Result<Vec<NormalizedItem>, FeedError> {
    let format = FeedFormat::for_source(&source.name)?;

    detect_non_feed(body, content_type, source)?;

    let feed = parse_feed(body).map_err(|e| {
        debug!(
            "Feed '{}' failed to parse; sample: {}",
            source.name,
            body_sample(body)
        );
        e
    })?;
    debug!(
        "Feed '{}' parsed as {:?} with {} item(s)",
        source.name,
        feed.kind,
        feed.items.len()
    );

    let items = feed
        .items
        .iter()
        .map(|raw| match format {
            FeedFormat::Jobicy => normalize_jobicy(raw, format),
            FeedFormat::HigherEdJobs => normalize_higher_ed(raw, format),
        })
        .collect();

    Ok(items)
}

/// Rejects responses that are clearly not XML feeds.
pub fn detect_non_feed(
    body: &str,
    content_type: Option<&str>,
    source: &FeedSource,
) -> Result<(), FeedError> {
    let url = redact_url(&source.url);
    let trimmed = body.trim_start_matches('\u{feff}').trim_start();

    if trimmed.is_empty() {
        return Err(FeedError::NotAFeed {
            url,
            reason: "empty response body".to_string(),
        });
    }

    let head: String = trimmed.chars().take(2048).collect::<String>().to_lowercase();
    let looks_like_html = head.starts_with("<!doctype html") || head.starts_with("<html");

    if looks_like_html {
        let reason = match INTERSTITIAL_MARKERS.iter().find(|m| head.contains(*m)) {
            Some(marker) => format!("anti-bot interstitial page detected ('{}')", marker),
            None => "received an HTML page".to_string(),
        };
        return Err(FeedError::NotAFeed { url, reason });
    }

    if let Some(ct) = content_type {
        let ct = ct.to_lowercase();
        if ct.starts_with("text/html") {
            return Err(FeedError::NotAFeed {
                url,
                reason: format!("unexpected content type '{}'", ct),
            });
        }
    }

    Ok(())
}

fn field(raw: &RawItem, name: &str) -> String {
    raw.get(name).cloned().unwrap_or_default()
}

fn optional_field(raw: &RawItem, name: &str) -> Option<String> {
    raw.get(name).filter(|v| !v.is_empty()).cloned()
}

fn external_id(raw: &RawItem) -> String {
    optional_field(raw, "guid")
        .or_else(|| optional_field(raw, "id"))
        .unwrap_or_default()
}

fn normalize_jobicy(raw: &RawItem, format: FeedFormat) -> NormalizedItem {
    NormalizedItem {
        title: field(raw, "title"),
        company: field(raw, "job_listing_company"),
        description: optional_field(raw, "description")
            .or_else(|| optional_field(raw, "content_encoded"))
            .unwrap_or_default(),
        location: optional_field(raw, "job_listing_location"),
        job_type: JobType::normalize(&field(raw, "job_listing_job_type")),
        category: optional_field(raw, "job_listing_job_category"),
        url: field(raw, "link"),
        source: format.record_source().to_string(),
        external_id: external_id(raw),
    }
}

fn normalize_higher_ed(raw: &RawItem, format: FeedFormat) -> NormalizedItem {
    let title = field(raw, "title");
    NormalizedItem {
        location: Some(location_from_title(&title)),
        title,
        company: HIGHER_ED_COMPANY.to_string(),
        description: field(raw, "description"),
        job_type: JobType::FullTime,
        category: Some(HIGHER_ED_CATEGORY.to_string()),
        url: field(raw, "link"),
        source: format.record_source().to_string(),
        external_id: external_id(raw),
    }
}

/// Extracts "City, ST" from a title such as "Registrar (Boston, MA)".
fn location_from_title(title: &str) -> String {
    RE_PAREN
        .captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
}
