//! Main-content extraction: HTML in, `\n`-joined text blocks plus images out.

use segpipe_core::{ContentData, Error, Image, Result};

/// Tried in order; the first container with enough text wins.
const CONTENT_SELECTORS: [&str; 9] = [
    "article",
    ".content",
    ".post",
    ".article",
    ".post-content",
    ".entry-content",
    "main",
    "#content",
    "#main",
];

const MIN_CONTAINER_CHARS: usize = 50;

const BLOCK_TAGS: [&str; 10] = [
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre",
];

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_boilerplate(el: &html_scraper::ElementRef) -> bool {
    if matches!(el.value().name(), "nav" | "footer" | "aside" | "header") {
        return true;
    }
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    [
        "nav", "navbar", "menu", "sidebar", "footer", "banner", "cookie", "consent", "advert",
        "promo", "subscribe", "newsletter", "comment",
    ]
    .iter()
    .any(|bad| s.contains(bad))
}

fn text_chars(el: &html_scraper::ElementRef) -> usize {
    el.text().map(|t| t.trim().chars().count()).sum()
}

fn link_text_chars(el: &html_scraper::ElementRef) -> usize {
    let Ok(sel) = html_scraper::Selector::parse("a") else {
        return 0;
    };
    el.select(&sel).map(|a| text_chars(&a)).sum()
}

/// Densest non-boilerplate block, scoring text minus link text with tag bonuses.
fn densest_container<'a>(doc: &'a html_scraper::Html) -> Option<html_scraper::ElementRef<'a>> {
    let sel = html_scraper::Selector::parse("article, main, section, div").ok()?;
    let mut best: Option<(i64, html_scraper::ElementRef<'a>)> = None;
    for el in doc.select(&sel) {
        if is_boilerplate(&el) {
            continue;
        }
        let txt = text_chars(&el);
        if txt < MIN_CONTAINER_CHARS {
            continue;
        }
        let links = link_text_chars(&el);
        let mut score = txt as i64 - 2 * links as i64;
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ => {}
        }
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, el));
        }
    }
    best.map(|(_, el)| el)
}

fn pick_container<'a>(doc: &'a html_scraper::Html) -> Option<html_scraper::ElementRef<'a>> {
    for css in CONTENT_SELECTORS {
        let Ok(sel) = html_scraper::Selector::parse(css) else {
            continue;
        };
        if let Some(el) = doc
            .select(&sel)
            .find(|el| text_chars(el) >= MIN_CONTAINER_CHARS)
        {
            return Some(el);
        }
    }
    if let Some(el) = densest_container(doc) {
        return Some(el);
    }
    let body = html_scraper::Selector::parse("body").ok()?;
    doc.select(&body).next()
}

/// Only the outermost block is emitted; a `<p>` inside an `<li>` belongs to the `<li>`.
fn has_block_ancestor(el: &html_scraper::ElementRef, stop: &html_scraper::ElementRef) -> bool {
    for node in el.ancestors() {
        if node.id() == stop.id() {
            return false;
        }
        if let Some(e) = node.value().as_element() {
            if BLOCK_TAGS.contains(&e.name()) {
                return true;
            }
        }
    }
    false
}

fn inside_boilerplate(el: &html_scraper::ElementRef, stop: &html_scraper::ElementRef) -> bool {
    for node in el.ancestors() {
        if node.id() == stop.id() {
            return false;
        }
        if let Some(parent) = html_scraper::ElementRef::wrap(node) {
            if is_boilerplate(&parent) {
                return true;
            }
        }
    }
    false
}

fn image_src(el: &html_scraper::ElementRef) -> Option<String> {
    ["src", "data-src", "data-original"]
        .iter()
        .filter_map(|a| el.value().attr(a))
        .map(str::trim)
        .find(|s| !s.is_empty() && !s.starts_with("data:"))
        .map(str::to_string)
}

/// Extract readable text and images from an HTML document.
///
/// Each emitted block becomes one line of `text`; an image's `position` is the index of the
/// block it follows (`-1` before the first block).
pub fn extract_content(html: &str) -> Result<ContentData> {
    let doc = html_scraper::Html::parse_document(html);
    let container = pick_container(&doc)
        .ok_or_else(|| Error::Extract("document has no body".to_string()))?;

    let css = format!("{}, img", BLOCK_TAGS.join(", "));
    let sel = html_scraper::Selector::parse(&css)
        .map_err(|e| Error::Extract(format!("selector: {e}")))?;

    let mut blocks: Vec<String> = Vec::new();
    let mut images: Vec<Image> = Vec::new();
    for el in container.select(&sel) {
        if inside_boilerplate(&el, &container) {
            continue;
        }
        if el.value().name() == "img" {
            if let Some(src) = image_src(&el) {
                images.push(Image {
                    src,
                    alt: el.value().attr("alt").unwrap_or_default().trim().to_string(),
                    position: blocks.len() as i64 - 1,
                });
            }
            continue;
        }
        if has_block_ancestor(&el, &container) {
            continue;
        }
        let t = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
        if !t.is_empty() {
            blocks.push(t);
        }
    }

    // Containers with bare text and no block markup.
    if blocks.is_empty() {
        let t = norm_ws(&container.text().collect::<Vec<_>>().join(" "));
        if !t.is_empty() {
            blocks.push(t);
        }
    }
    if blocks.is_empty() {
        return Err(Error::Extract("no readable text found".to_string()));
    }

    Ok(ContentData {
        text: blocks.join("\n"),
        images,
    })
}
