//! DOCX text extraction for report-style evidence.
//!
//! A `.docx` is a ZIP archive whose body lives in `word/document.xml`. Text
//! runs (`<w:t>`) are concatenated, paragraphs (`</w:p>`) and breaks
//! (`<w:br/>`) become newlines and `<w:tab/>` becomes a tab.

use std::io::Read;
use std::path::Path;

use crate::error::PipelineError;

/// Maximum decompressed bytes read from `word/document.xml` (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extracts plain text from DOCX bytes.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Extract(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| PipelineError::Extract("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| PipelineError::Extract(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(PipelineError::Extract(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    document_xml_to_text(&xml)
}

fn document_xml_to_text(xml: &[u8]) -> Result<String, PipelineError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| PipelineError::Extract(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extract(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(collapse_blank_lines(&out))
}

/// Trims trailing whitespace per line and folds runs of blank lines into one.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Reads a DOCX file and returns at most `max_chars` characters of its text.
pub fn docx_excerpt(path: &Path, max_chars: usize) -> anyhow::Result<String> {
    use anyhow::Context;

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read DOCX file: {}", path.display()))?;
    let text = extract_docx_text(&bytes)
        .with_context(|| format!("Failed to extract text from {}", path.display()))?;
    Ok(truncate_chars(&text, max_chars))
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
