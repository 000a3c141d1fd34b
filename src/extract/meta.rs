use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use scraper::{ElementRef, Html, Node as DomNode, Selector};

use crate::extract::clean::{collapse_whitespace, Node};

static TITLE_META_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:title"], meta[name="twitter:title"]"#).unwrap()
});

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

static AUTHOR_SELS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        r#"[rel="author"]"#,
        r#"[itemprop="author"]"#,
        ".byline",
        ".author",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static AUTHOR_META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="author"]"#).unwrap());

static BYLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[Bb]y ([A-Z][\w'’.-]*(?: [A-Z][\w'’.-]*){0,3})").unwrap()
});

static TIME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("time[datetime]").unwrap());

static DATE_META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="article:published_time"]"#).unwrap());

static DATE_PROP_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[itemprop="datePublished"]"#).unwrap());

static DATE_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b[A-Z][a-z]+ \d{1,2}, \d{4}\b").unwrap()
});

// How much visible leading text the pattern fallbacks get to scan. Bylines
// and dates that matter sit near the top of the page.
const LEAD_TEXT_CAP: usize = 600;

pub const UNKNOWN_TITLE: &str = "Unknown Title";

// ── Title ──

/// Best-effort title: social-card meta, then the first heading of the chosen
/// content, then the `<title>` element, then a fixed placeholder.
pub fn extract_title(doc: &Html, content: &[Node]) -> String {
    for meta in doc.select(&TITLE_META_SEL) {
        if let Some(value) = meta.value().attr("content") {
            let title = collapse_whitespace(value);
            if !title.is_empty() {
                return title;
            }
        }
    }
    if let Some(title) = first_heading_text(content) {
        return title;
    }
    if let Some(el) = doc.select(&TITLE_SEL).next() {
        let title = collapse_whitespace(&el.text().collect::<String>());
        if !title.is_empty() {
            return title;
        }
    }
    UNKNOWN_TITLE.to_string()
}

fn first_heading_text(nodes: &[Node]) -> Option<String> {
    for node in nodes {
        if let Node::Element { name, children, .. } = node {
            if name == "h1" || name == "h2" {
                let mut buf = String::new();
                node.collect_text(&mut buf);
                let text = collapse_whitespace(&buf);
                if !text.is_empty() {
                    return Some(text);
                }
            }
            if let Some(found) = first_heading_text(children) {
                return Some(found);
            }
        }
    }
    None
}

// ── Author ──

/// Byline selectors in priority order, then the author meta tag, then a
/// `by NAME` pattern over the leading page text (capped at four name tokens).
pub fn extract_author(doc: &Html) -> Option<String> {
    for sel in AUTHOR_SELS.iter() {
        for el in doc.select(sel) {
            if let Some(name) = author_from_element(el) {
                return Some(name);
            }
        }
    }
    for el in doc.select(&AUTHOR_META_SEL) {
        if let Some(name) = el.value().attr("content").and_then(tidy_author) {
            return Some(name);
        }
    }
    let lead = leading_text(doc, LEAD_TEXT_CAP);
    BYLINE_RE
        .captures(&lead)
        .and_then(|caps| tidy_author(&caps[1]))
}

fn author_from_element(el: ElementRef<'_>) -> Option<String> {
    if el.value().name() == "meta" {
        return el.value().attr("content").and_then(tidy_author);
    }
    tidy_author(&el.text().collect::<String>())
}

fn tidy_author(raw: &str) -> Option<String> {
    let collapsed = collapse_whitespace(raw);
    // Bylines often pack in publication dates or section names after a
    // separator; only the first segment is the name.
    let first = collapsed.split(['|', '•', '·']).next().unwrap_or("").trim();
    let stripped = first
        .strip_prefix("By ")
        .or_else(|| first.strip_prefix("by "))
        .unwrap_or(first);
    let name = stripped
        .trim_matches(|c: char| c.is_whitespace() || c == ',' || c == '-')
        .to_string();
    if name.is_empty() || name.len() > 80 || name.contains("http") {
        return None;
    }
    Some(name)
}

// ── Publication date ──

/// Structured date sources in priority order, then a date pattern over the
/// leading page text. `None` means the caller picks its own default.
pub fn extract_published(doc: &Html) -> Option<NaiveDate> {
    for el in doc.select(&TIME_SEL) {
        if let Some(date) = el.value().attr("datetime").and_then(parse_date_str) {
            return Some(date);
        }
    }
    for el in doc.select(&DATE_META_SEL) {
        if let Some(date) = el.value().attr("content").and_then(parse_date_str) {
            return Some(date);
        }
    }
    for el in doc.select(&DATE_PROP_SEL) {
        let candidate = el
            .value()
            .attr("datetime")
            .or_else(|| el.value().attr("content"))
            .map(str::to_string)
            .unwrap_or_else(|| el.text().collect::<String>());
        if let Some(date) = parse_date_str(&candidate) {
            return Some(date);
        }
    }
    let lead = leading_text(doc, LEAD_TEXT_CAP);
    DATE_TEXT_RE
        .find(&lead)
        .and_then(|m| parse_date_str(m.as_str()))
}

fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    let head: String = raw.chars().take(10).collect();
    if let Ok(date) = NaiveDate::parse_from_str(&head, "%Y-%m-%d") {
        return Some(date);
    }
    for fmt in ["%B %d, %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    None
}

// ── Shared ──

/// Visible text from the top of the document, scripts and styles skipped,
/// truncated once `cap` bytes are gathered.
fn leading_text(doc: &Html, cap: usize) -> String {
    let mut out = String::new();
    collect_leading(doc.root_element(), cap, &mut out);
    collapse_whitespace(&out)
}

fn collect_leading(el: ElementRef<'_>, cap: usize, out: &mut String) {
    if out.len() >= cap {
        return;
    }
    if matches!(
        el.value().name(),
        "script" | "style" | "noscript" | "template"
    ) {
        return;
    }
    for child in el.children() {
        if out.len() >= cap {
            return;
        }
        match child.value() {
            DomNode::Text(t) => {
                out.push_str(&t.text);
                out.push(' ');
            }
            DomNode::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_leading(child_el, cap, out);
                }
            }
            _ => {}
        }
    }
}

// ── Tests ──
