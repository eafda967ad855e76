//! HTML extraction for chapter content: plain text with paragraph
//! structure, and annotated chapter HTML with inlined assets.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script>|<script\b[^>]*/>").unwrap()
});

static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*?)</body>").unwrap());

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:p|h[1-6]|li|blockquote)\b[^>]*>(.*?)</(?:p|h[1-6]|li|blockquote)>")
        .unwrap()
});

static CLOSING_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(?:p|div|h[1-6]|li|blockquote|section|article|table|tr|ul|ol)>|<br\s*/?>")
        .unwrap()
});

static HEADING_RES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?is)<h1\b[^>]*>(.*?)</h1>").unwrap(),
        Regex::new(r"(?is)<h2\b[^>]*>(.*?)</h2>").unwrap(),
        Regex::new(r"(?is)<h3\b[^>]*>(.*?)</h3>").unwrap(),
    ]
});

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*/?>").unwrap());

static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)(<style\b[^>]*>)(.*?)(</style>)").unwrap());

static IMG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*/?>").unwrap());

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap());

static SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)src\s*=\s*["']([^"']+)["']"#).unwrap());

static CSS_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap());

/// Source of archive assets, looked up by archive-relative path.
pub(crate) trait AssetSource {
    /// Bytes and MIME type for the asset at `path`, if present. Lookups
    /// fall back to a case-insensitive path comparison.
    fn asset(&mut self, path: &str) -> Option<(Vec<u8>, String)>;
}

/// Remove script elements entirely.
pub(crate) fn strip_scripts(html: &str) -> String {
    SCRIPT_RE.replace_all(html, "").into_owned()
}

/// Inner HTML of the body element, or the whole document when no body tag
/// is present (common in fragment files).
pub(crate) fn body_inner(html: &str) -> &str {
    match BODY_RE.captures(html) {
        Some(caps) => caps.get(1).map_or(html, |m| m.as_str()),
        None => html,
    }
}

/// Chapter title from the first top-level heading.
pub(crate) fn extract_title(html: &str) -> Option<String> {
    for re in HEADING_RES.iter() {
        if let Some(caps) = re.captures(html) {
            let title = decode_entities(&strip_tags(&caps[1]));
            let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
            if !title.is_empty() {
                return Some(title);
            }
        }
    }
    None
}

/// Plain text with paragraph breaks as blank lines.
///
/// Prefers the concatenation of paragraph-like block contents; falls back
/// to closing-tag replacement plus tag stripping when a document has no
/// block markup at all.
pub(crate) fn extract_plain_text(html: &str) -> String {
    let body = body_inner(html);

    let mut paragraphs: Vec<String> = Vec::new();
    for caps in BLOCK_RE.captures_iter(body) {
        let text = decode_entities(&strip_tags(&caps[1]));
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    if !paragraphs.is_empty() {
        return paragraphs.join("\n\n");
    }

    // No paragraph markup: force paragraph breaks at block boundaries,
    // then strip what's left.
    let broken = CLOSING_BLOCK_RE.replace_all(body, "\n\n");
    let stripped = decode_entities(&strip_tags(&broken));
    stripped
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Strip HTML tags from a string.
pub(crate) fn strip_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
}

/// Decode common HTML entities.
pub(crate) fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&mdash;", "\u{2014}")
        .replace("&ndash;", "\u{2013}")
        .replace("&hellip;", "...")
        .replace("&rsquo;", "\u{2019}")
        .replace("&lsquo;", "\u{2018}")
        .replace("&rdquo;", "\u{201d}")
        .replace("&ldquo;", "\u{201c}")
}

/// Resolve `href` relative to `base_dir`, folding `.` and `..` segments.
/// Fragments and queries are dropped; percent escapes are decoded.
pub(crate) fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split(['#', '?']).next().unwrap_or(href);
    let href = percent_decode(href);

    let mut segments: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Whether a reference should be left alone (already inline or external).
fn is_external(reference: &str) -> bool {
    reference.starts_with("data:")
        || reference.starts_with("http:")
        || reference.starts_with("https:")
}

/// Rewrite every `url(...)` in a stylesheet to a data URL, resolving
/// references against the stylesheet's own directory.
fn inline_css_urls(css: &str, css_dir: &str, assets: &mut dyn AssetSource) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    for caps in CSS_URL_RE.captures_iter(css) {
        let whole = caps.get(0).unwrap();
        let reference = caps[1].trim();
        out.push_str(&css[last..whole.start()]);
        if is_external(reference) {
            out.push_str(whole.as_str());
        } else {
            let path = resolve_href(css_dir, reference);
            match assets.asset(&path) {
                Some((bytes, mime)) => {
                    out.push_str(&format!("url('{}')", data_url(&mime, &bytes)));
                }
                None => {
                    log::warn!("stylesheet asset not found: {}", path);
                    out.push_str(whole.as_str());
                }
            }
        }
        last = whole.end();
    }
    out.push_str(&css[last..]);
    out
}

/// Produce standalone chapter HTML: linked stylesheets inlined as
/// `<style>` blocks, every `url(...)` and `<img src>` rewritten to a
/// base64 data URL. Missing assets are logged and left untouched.
pub(crate) fn annotate_chapter(html: &str, base_dir: &str, assets: &mut dyn AssetSource) -> String {
    let body = body_inner(html).to_string();

    // Linked stylesheets become inline style blocks.
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for m in LINK_RE.find_iter(&body) {
        out.push_str(&body[last..m.start()]);
        let tag = m.as_str();
        let is_stylesheet = tag.to_lowercase().contains("stylesheet");
        let href = HREF_RE.captures(tag).map(|c| c[1].to_string());
        match (is_stylesheet, href) {
            (true, Some(href)) if !is_external(&href) => {
                let css_path = resolve_href(base_dir, &href);
                match assets.asset(&css_path) {
                    Some((bytes, _mime)) => {
                        let css_dir = match css_path.rfind('/') {
                            Some(idx) => &css_path[..idx],
                            None => "",
                        };
                        let css = String::from_utf8_lossy(&bytes);
                        let css = inline_css_urls(&css, css_dir, assets);
                        out.push_str("<style>\n");
                        out.push_str(&css);
                        out.push_str("\n</style>");
                    }
                    None => {
                        log::warn!("linked stylesheet not found: {}", css_path);
                        out.push_str(tag);
                    }
                }
            }
            _ => out.push_str(tag),
        }
        last = m.end();
    }
    out.push_str(&body[last..]);
    let body = out;

    // url(...) references inside existing <style> blocks.
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for caps in STYLE_RE.captures_iter(&body) {
        let whole = caps.get(0).unwrap();
        out.push_str(&body[last..whole.start()]);
        out.push_str(&caps[1]);
        out.push_str(&inline_css_urls(&caps[2], base_dir, assets));
        out.push_str(&caps[3]);
        last = whole.end();
    }
    out.push_str(&body[last..]);
    let body = out;

    // Image sources become data URLs.
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for m in IMG_RE.find_iter(&body) {
        out.push_str(&body[last..m.start()]);
        let tag = m.as_str();
        let rewritten = match SRC_RE.captures(tag) {
            Some(caps) => {
                let src = caps[1].to_string();
                if is_external(&src) {
                    tag.to_string()
                } else {
                    let path = resolve_href(base_dir, &src);
                    match assets.asset(&path) {
                        Some((bytes, mime)) => {
                            tag.replace(&src, &data_url(&mime, &bytes))
                        }
                        None => {
                            log::warn!("image asset not found: {}", path);
                            tag.to_string()
                        }
                    }
                }
            }
            None => tag.to_string(),
        };
        out.push_str(&rewritten);
        last = m.end();
    }
    out.push_str(&body[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapAssets(HashMap<String, (Vec<u8>, String)>);

    impl AssetSource for MapAssets {
        fn asset(&mut self, path: &str) -> Option<(Vec<u8>, String)> {
            if let Some(found) = self.0.get(path) {
                return Some(found.clone());
            }
            let lower = path.to_lowercase();
            self.0
                .iter()
                .find(|(k, _)| k.to_lowercase() == lower)
                .map(|(_, v)| v.clone())
        }
    }

    fn assets(entries: &[(&str, &[u8], &str)]) -> MapAssets {
        MapAssets(
            entries
                .iter()
                .map(|(path, bytes, mime)| {
                    (path.to_string(), (bytes.to_vec(), mime.to_string()))
                })
                .collect(),
        )
    }

    #[test]
    fn test_strip_scripts() {
        let html = "<p>keep</p><script>alert('x')</script><p>this</p>";
        let out = strip_scripts(html);
        assert!(!out.contains("alert"));
        assert!(out.contains("keep"));
        assert!(out.contains("this"));
    }

    #[test]
    fn test_extract_title_prefers_h1() {
        let html = "<body><h2>Sub</h2><h1>Main <em>Title</em></h1></body>";
        assert_eq!(extract_title(html), Some("Main Title".to_string()));
    }

    #[test]
    fn test_extract_title_falls_through_headings() {
        let html = "<body><h3>Only Three</h3><p>text</p></body>";
        assert_eq!(extract_title(html), Some("Only Three".to_string()));
        assert_eq!(extract_title("<body><p>none</p></body>"), None);
    }

    #[test]
    fn test_plain_text_from_paragraphs() {
        let html = "<html><body>\
            <h1>Title</h1>\
            <p>First  paragraph\nwith a break.</p>\
            <p>Second &amp; final.</p>\
            </body></html>";
        let text = extract_plain_text(html);
        assert_eq!(
            text,
            "Title\n\nFirst paragraph with a break.\n\nSecond & final."
        );
    }

    #[test]
    fn test_plain_text_fallback_without_blocks() {
        let html = "<body><div>First part</div><div>Second part</div></body>";
        let text = extract_plain_text(html);
        assert_eq!(text, "First part\n\nSecond part");
    }

    #[test]
    fn test_plain_text_paragraph_boundaries_are_blank_lines() {
        let html = "<body><p>a b</p><p>c d</p><p>e</p></body>";
        let text = extract_plain_text(html);
        assert_eq!(text.matches("\n\n").count(), 2);
        assert_eq!(text.split("\n\n").count(), 3);
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS/text", "ch1.xhtml"), "OEBPS/text/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/text", "../images/a.png"), "OEBPS/images/a.png");
        assert_eq!(resolve_href("OEBPS", "./style.css"), "OEBPS/style.css");
        assert_eq!(resolve_href("", "cover.jpg"), "cover.jpg");
        assert_eq!(resolve_href("OEBPS", "a.xhtml#frag"), "OEBPS/a.xhtml");
        assert_eq!(resolve_href("OEBPS", "my%20file.css"), "OEBPS/my file.css");
        assert_eq!(resolve_href("OEBPS", "/absolute/p.png"), "absolute/p.png");
    }

    #[test]
    fn test_annotate_inlines_img_as_data_url() {
        let mut source = assets(&[("OEBPS/images/pic.png", b"PNGDATA", "image/png")]);
        let html = r#"<body><p>x</p><img src="images/pic.png" alt="p"/></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains("data:image/png;base64,"));
        assert!(!out.contains(r#"src="images/pic.png""#));
    }

    #[test]
    fn test_annotate_missing_asset_left_untouched() {
        let mut source = assets(&[]);
        let html = r#"<body><img src="images/gone.png"/></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains(r#"src="images/gone.png""#));
    }

    #[test]
    fn test_annotate_case_insensitive_asset_lookup() {
        let mut source = assets(&[("OEBPS/Images/Pic.PNG", b"PNGDATA", "image/png")]);
        let html = r#"<body><img src="images/pic.png"/></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains("data:image/png;base64,"));
    }

    #[test]
    fn test_annotate_inlines_linked_stylesheet() {
        let css = b"p { background: url(../images/bg.png); }" as &[u8];
        let mut source = assets(&[
            ("OEBPS/css/main.css", css, "text/css"),
            ("OEBPS/images/bg.png", b"BG", "image/png"),
        ]);
        let html = r#"<body><link rel="stylesheet" href="css/main.css"/><p>t</p></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains("<style>"));
        // The css url() resolved against the css file's directory.
        assert!(out.contains("url('data:image/png;base64,"));
        assert!(!out.contains("<link"));
    }

    #[test]
    fn test_annotate_rewrites_style_block_urls() {
        let mut source = assets(&[("OEBPS/fonts/f.woff", b"FONT", "font/woff")]);
        let html = r#"<body><style>@font-face { src: url("fonts/f.woff"); }</style></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains("data:font/woff;base64,"));
    }

    #[test]
    fn test_annotate_leaves_external_urls() {
        let mut source = assets(&[]);
        let html = r#"<body><img src="https://example.com/x.png"/></body>"#;
        let out = annotate_chapter(html, "OEBPS", &mut source);
        assert!(out.contains("https://example.com/x.png"));
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp; b&mdash;c"), "a & b\u{2014}c");
        assert_eq!(decode_entities("&lt;tag&gt;"), "<tag>");
    }
}
