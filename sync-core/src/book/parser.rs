//! EPUB archive parsing: spine walk, text extraction, chapter bounds.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use epub::doc::EpubDoc;

use super::html::{
    AssetSource, annotate_chapter, body_inner, extract_plain_text, extract_title, strip_scripts,
};
use super::{AnnotatedChapter, Chapter, ParsedBook};
use crate::error::{Result, SyncError};

/// Chapters shorter than this after extraction are discarded.
pub const MIN_CHAPTER_CHARS: usize = 50;

/// Asset lookup backed by the open archive, with a case-insensitive
/// fallback for hrefs whose case doesn't match the manifest.
struct DocAssets<'a> {
    doc: &'a mut EpubDoc<BufReader<File>>,
}

impl AssetSource for DocAssets<'_> {
    fn asset(&mut self, path: &str) -> Option<(Vec<u8>, String)> {
        let exact = self
            .doc
            .resources
            .iter()
            .find(|(_, item)| item.path.to_string_lossy().replace('\\', "/") == path)
            .map(|(id, item)| (id.clone(), item.mime.clone()));

        let found = exact.or_else(|| {
            let lower = path.to_lowercase();
            self.doc
                .resources
                .iter()
                .find(|(_, item)| {
                    item.path.to_string_lossy().replace('\\', "/").to_lowercase() == lower
                })
                .map(|(id, item)| (id.clone(), item.mime.clone()))
        });

        let (id, mime) = found?;
        self.doc.get_resource(&id).map(|(bytes, _)| (bytes, mime))
    }
}

fn is_content_document(path: &Path) -> bool {
    matches!(
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref(),
        Some("xhtml") | Some("html") | Some("htm")
    )
}

/// Parse an EPUB file into plain text, chapter bounds, and annotated
/// chapter HTML. Fails with `InvalidArchive` when the container has no
/// usable manifest.
pub fn parse_epub(path: &Path) -> Result<ParsedBook> {
    let mut doc = EpubDoc::new(path)
        .map_err(|e| SyncError::InvalidArchive(format!("failed to open archive: {}", e)))?;

    let title = doc
        .mdata("title")
        .map(|m| m.value.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let author = doc.mdata("creator").map(|m| m.value.clone());

    let spine = doc.spine.clone();
    let mut plain_text = String::new();
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut annotated_chapters: Vec<AnnotatedChapter> = Vec::new();

    for spine_item in spine.iter() {
        let Some(resource_path) = doc
            .resources
            .get(&spine_item.idref)
            .map(|item| item.path.clone())
        else {
            continue;
        };
        if !is_content_document(&resource_path) {
            continue;
        }
        let Some((content_bytes, _mime)) = doc.get_resource(&spine_item.idref) else {
            continue;
        };

        let raw = String::from_utf8_lossy(&content_bytes).to_string();
        let html = strip_scripts(&raw);
        let body = body_inner(&html).to_string();

        let text = extract_plain_text(&html);
        if text.len() < MIN_CHAPTER_CHARS {
            log::debug!(
                "skipping spine item {} ({} chars of text)",
                spine_item.idref,
                text.len()
            );
            continue;
        }

        let chapter_title = extract_title(&html)
            .unwrap_or_else(|| format!("Chapter {}", chapters.len() + 1));

        let base_dir = resource_path
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let annotated_html = {
            let mut assets = DocAssets { doc: &mut doc };
            annotate_chapter(&body, &base_dir, &mut assets)
        };

        if !plain_text.is_empty() {
            plain_text.push_str("\n\n");
        }
        let start_char = plain_text.len();
        plain_text.push_str(&text);
        let end_char = plain_text.len();
        let word_count = text.split_whitespace().count();

        chapters.push(Chapter {
            title: chapter_title.clone(),
            start_char,
            end_char,
            word_count,
        });
        annotated_chapters.push(AnnotatedChapter {
            title: chapter_title,
            html: annotated_html,
        });
    }

    log::info!(
        "parsed \"{}\": {} chapters, {} chars",
        title,
        chapters.len(),
        plain_text.len()
    );

    Ok(ParsedBook {
        title,
        author,
        plain_text,
        chapters,
        annotated_chapters,
    })
}
