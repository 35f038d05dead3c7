//! Post block extraction from a channel preview page.

use scraper::{Html, Node, Selector};

use postdigest_shared::{PostDigestError, Result};

/// Elements that start a new line inside a post.
const LINE_BREAKING: &[&str] = &["br", "p", "div", "li", "blockquote", "pre"];

/// Validate a CSS selector string.
pub fn parse_selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw)
        .map_err(|e| PostDigestError::validation(format!("invalid block selector '{raw}': {e:?}")))
}

/// Extract the text of every element matching `selector`, in document order.
///
/// Lines are trimmed and blank lines dropped; blocks left empty are discarded.
pub fn extract_blocks(html: &str, selector: &Selector) -> Vec<String> {
    let doc = Html::parse_document(html);
    doc.select(selector)
        .filter_map(|el| {
            let mut raw = String::new();
            for node in el.descendants().skip(1) {
                match node.value() {
                    Node::Text(text) => raw.push_str(text),
                    Node::Element(e) if LINE_BREAKING.contains(&e.name()) => raw.push('\n'),
                    _ => {}
                }
            }
            let block = normalize_block(&raw);
            (!block.is_empty()).then_some(block)
        })
        .collect()
}

fn normalize_block(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
