//! Lenient RSS/Atom reader.
//!
//! Produces one flat field map per `<item>` (RSS) or `<entry>` (Atom).
//! Tag names are lowercased and namespace colons become underscores, so
//! `<job_listing:company>` is read as `job_listing_company`. Nested markup
//! inside a field is flattened to its text, which is how attribute-bearing
//! fields such as `<guid isPermaLink="false">` end up as plain strings.

use std::collections::BTreeMap;

use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::Reader;

use crate::error::FeedError;

/// Field name → text for one feed entry.
pub type RawItem = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Rss,
    Atom,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub kind: FeedKind,
    pub items: Vec<RawItem>,
}

struct OpenItem {
    depth: usize,
    fields: RawItem,
    current: Option<OpenField>,
}

struct OpenField {
    name: String,
    depth: usize,
    text: String,
}

/// Parses a feed document into raw items.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, FeedError> {
    let cleaned = strip_control_chars(xml);
    let mut reader = Reader::from_str(&cleaned);
    reader.config_mut().check_end_names = false;

    let mut root: Option<String> = None;
    let mut depth = 0usize;
    let mut items = Vec::new();
    let mut open: Option<OpenItem> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| FeedError::Parse(format!("{} at byte {}", e, reader.buffer_position())))?;

        match event {
            Event::Start(ref e) => {
                depth += 1;
                let name = tag_name(e);
                if root.is_none() {
                    root = Some(name.clone());
                }
                handle_open(&mut open, e, name, depth, true);
            }
            Event::Empty(ref e) => {
                let name = tag_name(e);
                if root.is_none() {
                    root = Some(name.clone());
                }
                handle_open(&mut open, e, name, depth + 1, false);
            }
            Event::End(_) => {
                let mut item_closed = false;
                if let Some(item) = open.as_mut() {
                    if item.current.as_ref().is_some_and(|f| f.depth == depth) {
                        if let Some(field) = item.current.take() {
                            insert_field(&mut item.fields, field.name, &field.text);
                        }
                    }
                    item_closed = item.depth == depth;
                }
                if item_closed {
                    if let Some(done) = open.take() {
                        items.push(done.fields);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(ref e) => {
                let text = e
                    .decode()
                    .map_err(|err| FeedError::Parse(err.to_string()))?;
                push_text(&mut open, &text);
            }
            Event::CData(ref e) => {
                let text = e
                    .decode()
                    .map_err(|err| FeedError::Parse(err.to_string()))?;
                push_text(&mut open, &text);
            }
            Event::GeneralRef(ref e) => {
                let resolved = resolve_reference(e);
                push_text(&mut open, &resolved);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let kind = match root.as_deref() {
        Some("rss") | Some("rdf_rdf") => FeedKind::Rss,
        Some("feed") => FeedKind::Atom,
        Some(other) => {
            return Err(FeedError::Parse(format!(
                "Invalid RSS/Feed format: unexpected root element <{}>",
                other
            )))
        }
        None => return Err(FeedError::Parse("Invalid RSS/Feed format: empty document".into())),
    };

    Ok(ParsedFeed { kind, items })
}

fn handle_open(
    open: &mut Option<OpenItem>,
    e: &BytesStart<'_>,
    name: String,
    depth: usize,
    has_body: bool,
) {
    match open.as_mut() {
        None => {
            if has_body && (name == "item" || name == "entry") {
                *open = Some(OpenItem {
                    depth,
                    fields: RawItem::new(),
                    current: None,
                });
            }
        }
        Some(item) => {
            if item.current.is_some() {
                // Nested markup inside a field contributes text only.
                return;
            }
            if depth != item.depth + 1 {
                return;
            }
            // Atom links carry the URL in `href`.
            if name == "link" {
                if let Some(href) = attribute(e, "href") {
                    insert_field(&mut item.fields, name.clone(), &href);
                    if !has_body {
                        return;
                    }
                }
            }
            if has_body {
                item.current = Some(OpenField {
                    name,
                    depth,
                    text: String::new(),
                });
            } else {
                item.fields.entry(name).or_default();
            }
        }
    }
}

fn push_text(open: &mut Option<OpenItem>, text: &str) {
    if let Some(field) = open.as_mut().and_then(|item| item.current.as_mut()) {
        field.text.push_str(text);
    }
}

fn insert_field(fields: &mut RawItem, name: String, text: &str) {
    let value = collapse_whitespace(text);
    match fields.get_mut(&name) {
        Some(existing) if existing.is_empty() => *existing = value,
        Some(existing) => {
            if !value.is_empty() && *existing != value {
                existing.push_str(", ");
                existing.push_str(&value);
            }
        }
        None => {
            fields.insert(name, value);
        }
    }
}

fn tag_name(e: &BytesStart<'_>) -> String {
    normalize_name(&String::from_utf8_lossy(e.name().as_ref()))
}

/// Lowercases a tag or attribute name and replaces `:` with `_`.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(':', "_")
}

fn attribute(e: &BytesStart<'_>, wanted: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        let key = normalize_name(&String::from_utf8_lossy(a.key.as_ref()));
        if key != wanted {
            return None;
        }
        let value = a
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
        Some(value)
    })
}

fn resolve_reference(e: &BytesRef<'_>) -> String {
    if let Ok(Some(ch)) = e.resolve_char_ref() {
        return ch.to_string();
    }
    let name = e.decode().map(|n| n.into_owned()).unwrap_or_default();
    match name.as_str() {
        "amp" => "&".to_string(),
        "lt" => "<".to_string(),
        "gt" => ">".to_string(),
        "quot" => "\"".to_string(),
        "apos" => "'".to_string(),
        "nbsp" => " ".to_string(),
        "ndash" => "\u{2013}".to_string(),
        "mdash" => "\u{2014}".to_string(),
        _ => format!("&{};", name),
    }
}

/// Removes C0/C1 control characters except tab, newline and carriage return.
fn strip_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code <= 0x08
                || code == 0x0B
                || code == 0x0C
                || (0x0E..=0x1F).contains(&code)
                || (0x7F..=0x9F).contains(&code))
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
