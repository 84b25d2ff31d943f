//! Prompt context rendering.
//!
//! Turns ranked search results into the block of reference text the prompt
//! builder splices into a generation prompt:
//!
//! ```text
//! [History]
//! <chunk>
//!
//! <chunk>
//!
//! [Character]
//! <chunk>
//! ```
//!
//! Sections follow [`Category::ALL`] order; chunks keep their rank order
//! within a section. Chunks are added greedily in rank order until the
//! character budget is spent; a chunk that does not fit is skipped and
//! smaller ones after it may still be taken.

use crate::types::{Category, ScoredChunk};

/// Render `results` into labelled sections of at most `budget` characters.
///
/// Returns an empty string if nothing fits.
#[must_use]
pub fn render_context(results: &[ScoredChunk], budget: usize) -> String {
    let mut sections: [Vec<&str>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    let mut used = 0usize;

    for result in results {
        let category = result.chunk.category();
        let text = result.chunk.text().trim();
        if text.is_empty() {
            continue;
        }
        let section = &sections[category.index()];
        let header_cost = if section.is_empty() {
            header(category).chars().count() + 1 + separator_cost(used)
        } else {
            2
        };
        let cost = header_cost + text.chars().count();
        if used + cost > budget {
            continue;
        }
        used += cost;
        sections[category.index()].push(text);
    }

    let mut out = String::new();
    for category in Category::ALL {
        let texts = &sections[category.index()];
        if texts.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&header(category));
        out.push('\n');
        out.push_str(&texts.join("\n\n"));
    }
    out
}

fn header(category: Category) -> String {
    format!("[{}]", category.label())
}

/// Blank line between sections, if one is already open.
fn separator_cost(used: usize) -> usize {
    if used == 0 { 0 } else { 2 }
}
