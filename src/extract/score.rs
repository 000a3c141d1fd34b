use scraper::{ElementRef, Html};

use super::clean::{collapse_whitespace, is_noise_classed};

/// Subtree text length (chars) below which a candidate is not accepted.
pub const MIN_CONTENT_CHARS: usize = 250;
/// Relaxed threshold used for exactly one rescan when nothing qualifies.
pub const RETRY_CONTENT_CHARS: usize = 120;

const CANDIDATE_TAGS: &[&str] = &["article", "main", "section", "div", "td"];

/// Content-boundary scoring seam. Implementations rank candidate DOM
/// subtrees; the extractor picks the maximum. Swapping the heuristic never
/// touches the surrounding pipeline.
pub trait ScoreStrategy {
    fn score(&self, candidate: ElementRef<'_>) -> f32;
}

/// Default heuristic: total collapsed text volume minus weighted text that
/// lives inside links. Navigation, tag clouds, and footers are link-dense,
/// article bodies are not.
#[derive(Debug, Clone, Copy)]
pub struct TextDensity {
    pub link_penalty: f32,
}

impl Default for TextDensity {
    fn default() -> Self {
        Self { link_penalty: 2.0 }
    }
}

impl ScoreStrategy for TextDensity {
    fn score(&self, candidate: ElementRef<'_>) -> f32 {
        let text = subtree_text_chars(candidate) as f32;
        let link = link_text_chars(candidate) as f32;
        text - self.link_penalty * link
    }
}

/// Pick the highest-scoring candidate container, first with the strict
/// minimum-text threshold, then relaxed once with the retry threshold.
pub fn best_candidate<'a>(doc: &'a Html, strategy: &dyn ScoreStrategy) -> Option<ElementRef<'a>> {
    pick(doc, strategy, MIN_CONTENT_CHARS).or_else(|| pick(doc, strategy, RETRY_CONTENT_CHARS))
}

fn pick<'a>(
    doc: &'a Html,
    strategy: &dyn ScoreStrategy,
    min_chars: usize,
) -> Option<ElementRef<'a>> {
    let mut best: Option<(f32, ElementRef<'a>)> = None;
    for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        if !CANDIDATE_TAGS.contains(&el.value().name()) || is_noise_classed(el) {
            continue;
        }
        if subtree_text_chars(el) < min_chars {
            continue;
        }
        let score = strategy.score(el);
        // >= so a nested container with the same payload beats its wrapper.
        if best.map_or(true, |(s, _)| score >= s) {
            best = Some((score, el));
        }
    }
    best.map(|(_, el)| el)
}

fn subtree_text_chars(el: ElementRef<'_>) -> usize {
    let mut buf = String::new();
    for piece in el.text() {
        buf.push_str(piece);
    }
    collapse_whitespace(&buf).chars().count()
}

fn link_text_chars(el: ElementRef<'_>) -> usize {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|d| d.value().name() == "a")
        .map(subtree_text_chars)
        .sum()
}

// ── Tests ──
