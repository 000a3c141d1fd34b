use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Node as DomNode};

static NOISE_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^|[^a-z])(ads?|advert\w*|banner|breadcrumbs?|comments?|cookie|share|social|sidebar|menu|footer|promo|sponsor\w*|widget|popup|newsletter|subscribe|related|recommend\w*|pagination)([^a-z]|$)",
    )
    .unwrap()
});

static RELATED_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(related|more from|read (more|next)|you might also|you may also|recommended( for you)?|see also|further reading|popular (posts|articles|stories)|trending|also on)\b",
    )
    .unwrap()
});

const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "form", "button", "nav", "header",
    "footer", "aside", "svg", "canvas", "object", "embed", "link", "meta", "input", "select",
    "textarea", "label", "dialog",
];

const KEEP_TAGS: &[&str] = &[
    "p", "br", "hr", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "dl", "dt", "dd",
    "blockquote", "pre", "code", "em", "strong", "b", "i", "u", "s", "a", "img", "figure",
    "figcaption", "table", "thead", "tbody", "tfoot", "tr", "th", "td", "caption", "sup", "sub",
    "span", "div", "section", "article", "main", "mark", "cite", "q", "abbr", "time", "small",
];

// Attributes that survive conversion; everything else (class, style, on*) is dropped.
const KEEP_ATTRS: &[&str] = &[
    "href", "src", "srcset", "alt", "title", "datetime", "colspan", "rowspan", "width", "height",
];

// Attributes with no meaning in a static document, stripped even off kept images.
const STRIP_ATTRS: &[&str] = &["onload", "onerror", "loading", "decoding"];

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];

// Container-only elements where whitespace-only text nodes carry no meaning.
const STRUCTURAL_TAGS: &[&str] = &[
    "ul", "ol", "dl", "table", "thead", "tbody", "tfoot", "tr", "figure",
];

/// One node of the owned content tree. Everything downstream of extraction
/// (image rewriting, chapter rendering) operates on this, never on raw HTML.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<Node>,
    },
    Text(String),
}

impl Node {
    pub fn text(content: impl Into<String>) -> Node {
        Node::Text(content.into())
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Element { name, .. } => Some(name),
            Node::Text(_) => None,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        match self {
            Node::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            Node::Text(_) => None,
        }
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        if let Node::Element { attrs, .. } = self {
            let value = value.into();
            match attrs.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value,
                None => attrs.push((key.to_string(), value)),
            }
        }
    }

    pub fn remove_attr(&mut self, key: &str) {
        if let Node::Element { attrs, .. } = self {
            attrs.retain(|(k, _)| k != key);
        }
    }

    /// Collect all descendant text into `buf` in document order.
    pub fn collect_text(&self, buf: &mut String) {
        match self {
            Node::Text(t) => buf.push_str(t),
            Node::Element { children, .. } => {
                for child in children {
                    child.collect_text(buf);
                }
            }
        }
    }

    /// Collapsed character count of all descendant text.
    pub fn text_len(&self) -> usize {
        let mut buf = String::new();
        self.collect_text(&mut buf);
        collapse_whitespace(&buf).chars().count()
    }

    /// Visit every `img` element depth-first in DOM order.
    pub fn walk_images<F: FnMut(&Node)>(&self, f: &mut F) {
        if let Node::Element { name, children, .. } = self {
            if name == "img" {
                f(self);
                return;
            }
            for child in children {
                child.walk_images(f);
            }
        }
    }

    /// Mutable counterpart of [`Node::walk_images`], same traversal order.
    pub fn walk_images_mut<F: FnMut(&mut Node)>(&mut self, f: &mut F) {
        let is_img = matches!(self, Node::Element { name, .. } if name == "img");
        if is_img {
            f(self);
            return;
        }
        if let Node::Element { children, .. } = self {
            for child in children {
                child.walk_images_mut(f);
            }
        }
    }
}

/// Knobs for the post-clean passes. The boundary tag set bounds the
/// related-section sibling walk so it cannot eat the rest of an article.
#[derive(Debug, Clone)]
pub struct CleanPolicy {
    pub boundary_tags: Vec<String>,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            boundary_tags: ["section", "article", "aside", "footer", "hr"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

// ── DOM → owned tree conversion ──

/// Convert the children of a chosen DOM container into cleaned owned nodes.
/// Noise tags, noise-classed subtrees, layout tables, and non-whitelisted
/// attributes are dropped here, so both extraction paths share one cleanup.
pub fn convert_children(root: ElementRef<'_>) -> Vec<Node> {
    let mut out = Vec::new();
    convert_into(root, false, &mut out);
    out
}

fn convert_into(el: ElementRef<'_>, in_pre: bool, out: &mut Vec<Node>) {
    for child in el.children() {
        match child.value() {
            DomNode::Text(t) => {
                let raw: &str = &t.text;
                let text = normalize_text(raw, in_pre);
                if !text.is_empty() {
                    out.push(Node::Text(text));
                }
            }
            DomNode::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    if let Some(node) = convert_element(child_el, in_pre) {
                        out.push(node);
                    }
                }
            }
            _ => {}
        }
    }
}

fn convert_element(el: ElementRef<'_>, in_pre: bool) -> Option<Node> {
    let name = el.value().name().to_ascii_lowercase();

    if NOISE_TAGS.contains(&name.as_str()) || is_noise_classed(el) {
        return None;
    }

    if name == "table" && !table_is_data(el) {
        return None;
    }

    let keep = KEEP_TAGS.contains(&name.as_str());
    let preformatted = in_pre || name == "pre";

    let mut children = Vec::new();
    convert_into(el, preformatted, &mut children);

    // Unknown tags dissolve into a span so inline text keeps flowing.
    if !keep {
        return if children.is_empty() {
            None
        } else {
            Some(Node::Element {
                name: "span".to_string(),
                attrs: Vec::new(),
                children,
            })
        };
    }

    let mut attrs: Vec<(String, String)> = el
        .value()
        .attrs()
        .filter(|(k, _)| KEEP_ATTRS.contains(k) && !STRIP_ATTRS.contains(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if name == "table" {
        attrs.push(("class".to_string(), "data-table".to_string()));
    }

    // Whitespace-only children inside structural containers are parse noise.
    if STRUCTURAL_TAGS.contains(&name.as_str()) {
        children.retain(|c| !matches!(c, Node::Text(t) if t.trim().is_empty()));
    }

    let node = Node::Element {
        name: name.clone(),
        attrs,
        children,
    };

    // Empty cells keep their column slot in a retained table.
    if is_void(&name) || is_cell(&name) || node.text_len() > 0 || has_media(&node) {
        Some(node)
    } else {
        None
    }
}

fn is_void(name: &str) -> bool {
    matches!(name, "img" | "br" | "hr")
}

fn is_cell(name: &str) -> bool {
    matches!(name, "td" | "th")
}

fn has_media(node: &Node) -> bool {
    match node {
        Node::Text(_) => false,
        Node::Element { name, children, .. } => {
            is_void(name.as_str()) || children.iter().any(has_media)
        }
    }
}

pub(crate) fn is_noise_classed(el: ElementRef<'_>) -> bool {
    let v = el.value();
    let class = v.attr("class").unwrap_or("");
    let id = v.attr("id").unwrap_or("");
    NOISE_CLASS_RE.is_match(class) || NOISE_CLASS_RE.is_match(id)
}

/// Data-bearing table rule: at least 2 rows and 4 combined header+data
/// cells; anything smaller is treated as layout scaffolding.
pub fn table_is_data(table: ElementRef<'_>) -> bool {
    let mut rows = 0usize;
    let mut cells = 0usize;
    for node in table.descendants() {
        if let Some(el) = ElementRef::wrap(node) {
            match el.value().name() {
                "tr" => rows += 1,
                "th" | "td" => cells += 1,
                _ => {}
            }
        }
    }
    rows >= 2 && cells >= 4
}

fn normalize_text(raw: &str, in_pre: bool) -> String {
    if in_pre {
        return raw.to_string();
    }
    if raw.trim().is_empty() {
        // Keep a single separator so "<b>a</b> <i>b</i>" doesn't fuse.
        return if raw.is_empty() {
            String::new()
        } else {
            " ".to_string()
        };
    }
    collapse_inner_whitespace(raw)
}

fn collapse_inner_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf
}

/// Collapse all whitespace runs and trim, the form used for scoring,
/// titles, and TOC text.
pub fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim_end().to_string()
}

// ── Related-content removal ──

/// Remove "related articles" blocks: a heading matching the related-content
/// pattern plus its following siblings, stopping at the next heading or a
/// boundary tag so the walk can never consume the rest of the article.
pub fn remove_related_sections(nodes: &mut Vec<Node>, policy: &CleanPolicy) {
    let mut i = 0;
    while i < nodes.len() {
        if is_related_heading(&nodes[i]) {
            let mut end = i + 1;
            while end < nodes.len() && !stops_walk(&nodes[end], policy) {
                end += 1;
            }
            nodes.drain(i..end);
            continue;
        }
        if let Node::Element { children, .. } = &mut nodes[i] {
            remove_related_sections(children, policy);
        }
        i += 1;
    }
}

fn is_related_heading(node: &Node) -> bool {
    let Node::Element { name, .. } = node else {
        return false;
    };
    if !HEADING_TAGS.contains(&name.as_str()) {
        return false;
    }
    let mut buf = String::new();
    node.collect_text(&mut buf);
    RELATED_HEADING_RE.is_match(&collapse_whitespace(&buf))
}

fn stops_walk(node: &Node, policy: &CleanPolicy) -> bool {
    match node.name() {
        Some(name) => {
            HEADING_TAGS.contains(&name) || policy.boundary_tags.iter().any(|t| t == name)
        }
        None => false,
    }
}

// ── Tests ──
