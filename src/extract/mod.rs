pub mod clean;
pub mod meta;
pub mod score;

use std::sync::LazyLock;

use chrono::{NaiveDate, Utc};
use scraper::{Html, Selector};
use url::Url;

pub use clean::{CleanPolicy, Node};
pub use score::{ScoreStrategy, TextDensity};

use clean::{collapse_whitespace, convert_children, remove_related_sections};
use score::{best_candidate, RETRY_CONTENT_CHARS};

// Ordered fallback selectors, most article-specific first. Tried only after
// density scoring fails to produce enough text.
static FALLBACK_SELS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "article",
        "main",
        r#"[role="main"]"#,
        "#content",
        "#main",
        ".article",
        ".post",
        ".entry-content",
        ".post-content",
        ".article-body",
        ".content",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// How the article body was obtained, in decreasing order of confidence.
/// Anything other than `Scored` is a degraded result worth a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Scored,
    Selector,
    FullBody,
    Floor,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Scored => "scored",
            ExtractionMethod::Selector => "selector",
            ExtractionMethod::FullBody => "full-body",
            ExtractionMethod::Floor => "floor",
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, ExtractionMethod::Scored)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedArticle {
    pub source_url: Url,
    pub title: String,
    pub author: Option<String>,
    pub published: NaiveDate,
    pub content: Vec<Node>,
    pub method: ExtractionMethod,
}

impl ExtractedArticle {
    /// Collapsed character count of the whole article body.
    pub fn text_chars(&self) -> usize {
        content_chars(&self.content)
    }

    pub fn image_count(&self) -> usize {
        content_images(&self.content)
    }
}

/// Extract one article from raw HTML. Total: malformed or empty input
/// degrades through the fallback chain down to placeholder content, never
/// a panic or an error.
pub fn extract(html: &str, source_url: &Url) -> ExtractedArticle {
    extract_with(
        html,
        source_url,
        &TextDensity::default(),
        &CleanPolicy::default(),
    )
}

/// [`extract`] with caller-supplied scoring strategy and cleanup policy.
pub fn extract_with(
    html: &str,
    source_url: &Url,
    strategy: &dyn ScoreStrategy,
    policy: &CleanPolicy,
) -> ExtractedArticle {
    let doc = Html::parse_document(html);

    let mut method = ExtractionMethod::Scored;
    let mut content = best_candidate(&doc, strategy)
        .map(convert_children)
        .unwrap_or_default();

    // Cleanup can shrink a winning candidate below the floor; fall back to
    // the selector chain when that happens and it finds more text.
    if content_chars(&content) < RETRY_CONTENT_CHARS {
        let (fallback, fallback_method) = fallback_content(&doc);
        if content_chars(&fallback) >= content_chars(&content) {
            content = fallback;
            method = fallback_method;
        }
    }

    remove_related_sections(&mut content, policy);

    // A page of figures with no prose is still an article; the floor is
    // only for content with neither text nor images.
    if content_chars(&content) == 0 && content_images(&content) == 0 {
        content = floor_content();
        method = ExtractionMethod::Floor;
    }

    let title = meta::extract_title(&doc, &content);
    let author = meta::extract_author(&doc);
    let published = meta::extract_published(&doc).unwrap_or_else(|| Utc::now().date_naive());

    ExtractedArticle {
        source_url: source_url.clone(),
        title,
        author,
        published,
        content,
        method,
    }
}

fn fallback_content(doc: &Html) -> (Vec<Node>, ExtractionMethod) {
    for sel in FALLBACK_SELS.iter() {
        for el in doc.select(sel) {
            if clean::is_noise_classed(el) {
                continue;
            }
            let nodes = convert_children(el);
            if !nodes.is_empty() {
                return (nodes, ExtractionMethod::Selector);
            }
        }
    }
    if let Some(body) = doc.select(&BODY_SEL).next() {
        let nodes = convert_children(body);
        if !nodes.is_empty() {
            return (nodes, ExtractionMethod::FullBody);
        }
    }
    (Vec::new(), ExtractionMethod::Floor)
}

fn floor_content() -> Vec<Node> {
    vec![Node::Element {
        name: "p".to_string(),
        attrs: Vec::new(),
        children: vec![Node::text("Content not available")],
    }]
}

fn content_chars(nodes: &[Node]) -> usize {
    let mut buf = String::new();
    for node in nodes {
        node.collect_text(&mut buf);
    }
    collapse_whitespace(&buf).chars().count()
}

fn content_images(nodes: &[Node]) -> usize {
    let mut count = 0;
    for node in nodes {
        node.walk_images(&mut |_| count += 1);
    }
    count
}

// ── Tests ──
