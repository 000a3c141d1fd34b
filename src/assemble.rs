use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use crate::extract::Node;
use crate::images::{EmbeddedResource, ResolvedArticle};

pub const TOC_FILENAME: &str = "toc.xhtml";
pub const STYLESHEET_FILENAME: &str = "stylesheet.css";

// Elements rendered self-closing in XHTML.
const VOID_TAGS: &[&str] = &["img", "br", "hr"];

#[derive(Debug, Clone)]
pub struct ChapterDocument {
    /// 1-based position in the book, always contiguous.
    pub sequence_index: usize,
    pub filename: String,
    pub title: String,
    /// Complete XHTML document.
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct TocEntry {
    pub sequence_index: usize,
    pub title: String,
    pub author: Option<String>,
    pub published: NaiveDate,
    pub source_url: String,
    pub chapter_filename: String,
}

#[derive(Debug, Clone)]
pub struct TocDocument {
    pub title: String,
    pub entries: Vec<TocEntry>,
    pub body: String,
}

/// Everything the container writer needs, fully ordered. The TOC page is
/// not a chapter and never takes a chapter number.
#[derive(Debug, Clone)]
pub struct DocumentSet {
    pub toc: TocDocument,
    pub chapters: Vec<ChapterDocument>,
    pub resources: Vec<Arc<EmbeddedResource>>,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("chapter sequence broken at position {position}: expected {expected}, found {found}")]
    SequenceBroken {
        position: usize,
        expected: usize,
        found: usize,
    },
    #[error("chapter filename {found:?} does not match sequence index {index}")]
    FilenameMismatch { index: usize, found: String },
    #[error("TOC entry count {entries} does not match chapter count {chapters}")]
    CountMismatch { entries: usize, chapters: usize },
    #[error("TOC entry {index} references missing chapter file {filename:?}")]
    DanglingTocEntry { index: usize, filename: String },
    #[error("duplicate resource filename {0:?}")]
    DuplicateResource(String),
}

impl DocumentSet {
    /// Structural invariants. A failure here is a defect in the assembler,
    /// not bad input, so callers abort the run instead of degrading.
    pub fn verify(&self) -> Result<(), AssemblyError> {
        for (position, chapter) in self.chapters.iter().enumerate() {
            let expected = position + 1;
            if chapter.sequence_index != expected {
                return Err(AssemblyError::SequenceBroken {
                    position,
                    expected,
                    found: chapter.sequence_index,
                });
            }
            if chapter.filename != chapter_filename(expected) {
                return Err(AssemblyError::FilenameMismatch {
                    index: expected,
                    found: chapter.filename.clone(),
                });
            }
        }
        if self.toc.entries.len() != self.chapters.len() {
            return Err(AssemblyError::CountMismatch {
                entries: self.toc.entries.len(),
                chapters: self.chapters.len(),
            });
        }
        for entry in &self.toc.entries {
            if !self
                .chapters
                .iter()
                .any(|c| c.filename == entry.chapter_filename)
            {
                return Err(AssemblyError::DanglingTocEntry {
                    index: entry.sequence_index,
                    filename: entry.chapter_filename.clone(),
                });
            }
        }
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.filename.as_str()) {
                return Err(AssemblyError::DuplicateResource(resource.filename.clone()));
            }
        }
        Ok(())
    }
}

/// Chapter filenames are a pure function of the sequence index, nothing else.
pub fn chapter_filename(index: usize) -> String {
    format!("chapter_{}.xhtml", index)
}

/// Build the complete document set for one book. Pure and deterministic:
/// identical ordered input produces byte-identical output, whatever order
/// the upstream phases completed in.
pub fn assemble(articles: &[ResolvedArticle], book_title: &str) -> DocumentSet {
    let mut chapters = Vec::with_capacity(articles.len());
    let mut entries = Vec::with_capacity(articles.len());
    let mut resources: Vec<Arc<EmbeddedResource>> = Vec::new();

    for (position, resolved) in articles.iter().enumerate() {
        let index = position + 1;
        let filename = chapter_filename(index);
        let article = &resolved.article;

        chapters.push(ChapterDocument {
            sequence_index: index,
            filename: filename.clone(),
            title: article.title.clone(),
            body: chapter_xhtml(
                &article.title,
                article.author.as_deref(),
                article.published,
                article.source_url.as_str(),
                &article.content,
            ),
        });
        entries.push(TocEntry {
            sequence_index: index,
            title: article.title.clone(),
            author: article.author.clone(),
            published: article.published,
            source_url: article.source_url.to_string(),
            chapter_filename: filename,
        });

        // The same image fetched by several chapters lands in the book once.
        for resource in &resolved.resources {
            if !resources.iter().any(|r| r.filename == resource.filename) {
                resources.push(Arc::clone(resource));
            }
        }
    }

    let body = toc_xhtml(book_title, &entries);
    DocumentSet {
        toc: TocDocument {
            title: book_title.to_string(),
            entries,
            body,
        },
        chapters,
        resources,
    }
}

// ── XHTML rendering ──

fn chapter_xhtml(
    title: &str,
    author: Option<&str>,
    published: NaiveDate,
    source_url: &str,
    content: &[Node],
) -> String {
    let mut body = String::new();
    render_nodes(content, &mut body);

    let mut byline = String::new();
    if let Some(author) = author {
        byline.push_str(&escape_text(author));
        byline.push_str(" · ");
    }
    byline.push_str(&published.format("%B %-d, %Y").to_string());
    byline.push_str(&format!(
        " · <a href=\"{}\">{}</a>",
        escape_attr(source_url),
        escape_text(source_url)
    ));

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE html>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
         <head>\n\
         <meta charset=\"utf-8\"/>\n\
         <title>{title}</title>\n\
         <link rel=\"stylesheet\" type=\"text/css\" href=\"{css}\"/>\n\
         </head>\n\
         <body>\n\
         <nav class=\"chapter-nav\"><a href=\"{toc}\">Contents</a></nav>\n\
         <h1>{title}</h1>\n\
         <p class=\"byline\">{byline}</p>\n\
         <div class=\"article-body\">\n{body}\n</div>\n\
         </body>\n\
         </html>\n",
        title = escape_text(title),
        css = STYLESHEET_FILENAME,
        toc = TOC_FILENAME,
        byline = byline,
        body = body,
    )
}

fn toc_xhtml(book_title: &str, entries: &[TocEntry]) -> String {
    let mut items = String::new();
    for entry in entries {
        let mut meta = String::new();
        if let Some(author) = &entry.author {
            meta.push_str(&escape_text(author));
            meta.push_str(" · ");
        }
        meta.push_str(&entry.published.format("%B %-d, %Y").to_string());
        meta.push_str(&format!(
            " · <a class=\"source\" href=\"{}\">{}</a>",
            escape_attr(&entry.source_url),
            escape_text(&entry.source_url)
        ));

        items.push_str(&format!(
            "<li><span class=\"num\">{index}.</span> <a href=\"{file}\">{title}</a>\
             <span class=\"meta\">{meta}</span></li>\n",
            index = entry.sequence_index,
            file = entry.chapter_filename,
            title = escape_text(&entry.title),
            meta = meta,
        ));
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE html>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
         <head>\n\
         <meta charset=\"utf-8\"/>\n\
         <title>{title}</title>\n\
         <link rel=\"stylesheet\" type=\"text/css\" href=\"{css}\"/>\n\
         </head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <ol class=\"toc\">\n{items}</ol>\n\
         </body>\n\
         </html>\n",
        title = escape_text(book_title),
        css = STYLESHEET_FILENAME,
        items = items,
    )
}

fn render_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        render_node(node, out);
    }
}

fn render_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(&escape_text(text)),
        Node::Element {
            name,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(name);
            for (key, value) in attrs {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
            if VOID_TAGS.contains(&name.as_str()) && children.is_empty() {
                out.push_str(" />");
                return;
            }
            out.push('>');
            render_nodes(children, out);
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
    }
}

fn escape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

// ── Stylesheet ──

/// Book stylesheet. Light palette at `:root`, with an explicit dark
/// override so dark-themed readers do not invert images or lose contrast.
pub const STYLESHEET_CSS: &str = "\
:root {
  color-scheme: light dark;
}
body {
  background-color: #ffffff;
  color: #1b1b1b;
  font-family: Georgia, 'Times New Roman', serif;
  line-height: 1.55;
  margin: 0 auto;
  max-width: 38em;
  padding: 0 1em;
}
a {
  color: #0a57a4;
}
h1, h2, h3, h4 {
  line-height: 1.25;
}
img {
  max-width: 100%;
  height: auto;
}
figure {
  margin: 1.5em 0;
}
figcaption {
  font-size: 0.85em;
  color: #5a5a5a;
}
pre {
  background-color: #f3f3f3;
  overflow-x: auto;
  padding: 0.75em;
}
code {
  font-family: 'DejaVu Sans Mono', monospace;
  font-size: 0.9em;
}
blockquote {
  border-left: 3px solid #dddddd;
  color: #444444;
  margin-left: 0;
  padding-left: 1em;
}
table.data-table {
  border-collapse: collapse;
  margin: 1em 0;
}
.data-table th, .data-table td {
  border: 1px solid #cccccc;
  padding: 0.3em 0.6em;
}
nav.chapter-nav {
  font-size: 0.9em;
  margin: 1em 0;
}
p.byline {
  color: #5a5a5a;
  font-size: 0.9em;
}
ol.toc {
  list-style: none;
  padding-left: 0;
}
.toc li {
  margin: 0.6em 0;
}
.toc .meta {
  color: #5a5a5a;
  display: block;
  font-size: 0.85em;
}
@media (prefers-color-scheme: dark) {
  body {
    background-color: #121212;
    color: #e4e4e4;
  }
  a {
    color: #7ab5f5;
  }
  figcaption, p.byline, .toc .meta {
    color: #a0a0a0;
  }
  pre {
    background-color: #1e1e1e;
  }
  blockquote {
    border-left-color: #3a3a3a;
    color: #b8b8b8;
  }
  .data-table th, .data-table td {
    border-color: #444444;
  }
}
";

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractedArticle, ExtractionMethod};
    use url::Url;

    fn para(text: &str) -> Node {
        Node::Element {
            name: "p".to_string(),
            attrs: Vec::new(),
            children: vec![Node::text(text)],
        }
    }

    fn resolved(
        title: &str,
        url: &str,
        content: Vec<Node>,
        resources: Vec<Arc<EmbeddedResource>>,
    ) -> ResolvedArticle {
        ResolvedArticle {
            article: ExtractedArticle {
                source_url: Url::parse(url).unwrap(),
                title: title.to_string(),
                author: Some("Jane Doe".to_string()),
                published: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
                content,
                method: ExtractionMethod::Scored,
            },
            resources,
        }
    }

    fn resource(seq: usize) -> Arc<EmbeddedResource> {
        Arc::new(EmbeddedResource {
            seq,
            filename: format!("images/img_{}.png", seq),
            mime: "image/png".to_string(),
            source_url: format!("https://cdn.example.com/{}.png", seq),
            bytes: vec![0u8; 8],
        })
    }

    #[test]
    fn chapters_named_and_ordered_by_input() {
        let articles = vec![
            resolved("Alpha", "https://a.example.com/1", vec![para("one")], vec![]),
            resolved("Beta", "https://a.example.com/2", vec![para("two")], vec![]),
            resolved("Gamma", "https://a.example.com/3", vec![para("three")], vec![]),
        ];
        let set = assemble(&articles, "My Book");
        set.verify().unwrap();

        assert_eq!(set.chapters.len(), 3);
        let names: Vec<&str> = set.chapters.iter().map(|c| c.filename.as_str()).collect();
        assert_eq!(
            names,
            vec!["chapter_1.xhtml", "chapter_2.xhtml", "chapter_3.xhtml"]
        );
        let titles: Vec<&str> = set.toc.entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "Beta", "Gamma"]);
        assert!(set.toc.body.contains("<span class=\"num\">1.</span>"));
        assert!(set.toc.body.contains("Jane Doe"));
        assert!(set.toc.body.contains("March 9, 2024"));
        assert!(set.toc.body.contains("https://a.example.com/2"));
    }

    #[test]
    fn assemble_is_deterministic() {
        let articles = vec![resolved(
            "Alpha",
            "https://a.example.com/1",
            vec![para("one"), para("two")],
            vec![resource(1)],
        )];
        let first = assemble(&articles, "Book");
        let second = assemble(&articles, "Book");
        assert_eq!(first.toc.body, second.toc.body);
        assert_eq!(first.chapters[0].body, second.chapters[0].body);
    }

    #[test]
    fn markup_escaped_and_voids_self_closed() {
        let content = vec![
            para("1 < 2 & 2 > 1"),
            Node::Element {
                name: "img".to_string(),
                attrs: vec![
                    ("src".to_string(), "images/img_1.png".to_string()),
                    ("alt".to_string(), "a \"quoted\" pic".to_string()),
                ],
                children: Vec::new(),
            },
            Node::Element {
                name: "td".to_string(),
                attrs: Vec::new(),
                children: Vec::new(),
            },
        ];
        let set = assemble(
            &[resolved("T <1> & Co", "https://a.example.com/1", content, vec![])],
            "B",
        );
        let body = &set.chapters[0].body;
        assert!(body.contains("1 &lt; 2 &amp; 2 &gt; 1"));
        assert!(body.contains("<h1>T &lt;1&gt; &amp; Co</h1>"));
        assert!(body.contains("alt=\"a &quot;quoted&quot; pic\""));
        assert!(body.contains("<img src=\"images/img_1.png\" alt=\"a &quot;quoted&quot; pic\" />"));
        assert!(body.contains("<td></td>"));
    }

    #[test]
    fn chapters_link_back_to_toc() {
        let set = assemble(
            &[resolved("A", "https://a.example.com/1", vec![para("x")], vec![])],
            "B",
        );
        assert!(set.chapters[0]
            .body
            .contains("<a href=\"toc.xhtml\">Contents</a>"));
    }

    #[test]
    fn shared_resources_land_in_the_book_once() {
        let shared = resource(1);
        let articles = vec![
            resolved(
                "A",
                "https://a.example.com/1",
                vec![para("x")],
                vec![Arc::clone(&shared)],
            ),
            resolved(
                "B",
                "https://a.example.com/2",
                vec![para("y")],
                vec![Arc::clone(&shared), resource(2)],
            ),
        ];
        let set = assemble(&articles, "Book");
        set.verify().unwrap();
        assert_eq!(set.resources.len(), 2);
    }

    #[test]
    fn verify_catches_structural_defects() {
        let base = || {
            assemble(
                &[
                    resolved("A", "https://a.example.com/1", vec![para("x")], vec![]),
                    resolved("B", "https://a.example.com/2", vec![para("y")], vec![]),
                ],
                "Book",
            )
        };

        let mut broken = base();
        broken.chapters[1].sequence_index = 5;
        assert!(matches!(
            broken.verify(),
            Err(AssemblyError::SequenceBroken { .. })
        ));

        let mut broken = base();
        broken.chapters[1].filename = "chapter_9.xhtml".to_string();
        assert!(matches!(
            broken.verify(),
            Err(AssemblyError::FilenameMismatch { .. })
        ));

        let mut broken = base();
        broken.toc.entries[0].chapter_filename = "nope.xhtml".to_string();
        assert!(matches!(
            broken.verify(),
            Err(AssemblyError::DanglingTocEntry { .. })
        ));

        let mut broken = base();
        broken.resources.push(resource(7));
        broken.resources.push(resource(7));
        assert!(matches!(
            broken.verify(),
            Err(AssemblyError::DuplicateResource(_))
        ));
    }

    #[test]
    fn stylesheet_carries_light_and_dark_palettes() {
        assert!(STYLESHEET_CSS.contains(":root"));
        assert!(STYLESHEET_CSS.contains("@media (prefers-color-scheme: dark)"));
        assert!(STYLESHEET_CSS.contains("background-color: #ffffff"));
        assert!(STYLESHEET_CSS.contains("background-color: #121212"));
    }
}
