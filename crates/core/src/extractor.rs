use crate::chunking::SentenceChunker;
use crate::config::Settings;
use crate::error::IngestError;
use crate::models::{Chunk, ChunkKind, EncodedImage, PageImageRef};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::Regex;
use std::io::Cursor;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Encoded images smaller than this are tracking pixels or decorations.
pub const MIN_IMAGE_BYTES: usize = 1_000;

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub chunks: Vec<Chunk>,
    pub images: Vec<PageImageRef>,
}

impl Extraction {
    fn merge(&mut self, other: Extraction) {
        self.chunks.extend(other.chunks);
        self.images.extend(other.images);
    }
}

/// Splits a PDF into page batches and extracts chunked text and candidate
/// images from each batch on a bounded pool of blocking workers.
#[derive(Debug, Clone)]
pub struct PdfExtractor {
    chunker: SentenceChunker,
    page_batch_size: usize,
    max_workers: usize,
}

impl PdfExtractor {
    pub fn new(chunker: SentenceChunker, page_batch_size: usize, max_workers: usize) -> Self {
        Self {
            chunker,
            page_batch_size: page_batch_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            SentenceChunker::new(settings.into()),
            settings.page_batch_size,
            settings.max_workers,
        )
    }

    pub async fn extract(&self, path: &Path) -> Result<Extraction, IngestError> {
        let source = source_name(path)?;
        let owned = path.to_path_buf();
        let total_pages = tokio::task::spawn_blocking(move || {
            load_document(&owned).map(|document| document.get_pages().len() as u32)
        })
        .await
        .map_err(|error| IngestError::Worker(error.to_string()))??;

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::new();

        for range in page_batches(total_pages, self.page_batch_size) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|error| IngestError::Worker(error.to_string()))?;
            let path: PathBuf = path.to_path_buf();
            let source = source.clone();
            let chunker = self.chunker;

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                extract_batch(&path, &source, range, &chunker)
            }));
        }

        let mut extraction = Extraction::default();
        for handle in handles {
            let batch = handle
                .await
                .map_err(|error| IngestError::Worker(error.to_string()))??;
            extraction.merge(batch);
        }

        info!(
            source = %source,
            pages = total_pages,
            chunks = extraction.chunks.len(),
            images = extraction.images.len(),
            "extracted pdf"
        );
        Ok(extraction)
    }
}

/// Contiguous 0-based page ranges of at most `batch_size` pages.
pub fn page_batches(total_pages: u32, batch_size: usize) -> Vec<Range<u32>> {
    let step = u32::try_from(batch_size).unwrap_or(u32::MAX).max(1);
    (0..total_pages)
        .step_by(step as usize)
        .map(|start| start..start.saturating_add(step).min(total_pages))
        .collect()
}

pub fn source_name(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

pub(crate) fn load_document(path: &Path) -> Result<Document, IngestError> {
    Document::load(path).map_err(|error| {
        IngestError::PdfParse(format!("{}: {error}", path.display()))
    })
}

/// Extract one batch with its own document handle.
pub fn extract_batch(
    path: &Path,
    source: &str,
    range: Range<u32>,
    chunker: &SentenceChunker,
) -> Result<Extraction, IngestError> {
    let document = load_document(path)?;
    let pages = document.get_pages();
    let spaces = Regex::new(r"[ \t]+").map_err(|error| IngestError::Worker(error.to_string()))?;
    let chunk_size = chunker.config().chunk_size;

    let mut extraction = Extraction::default();
    let mut buffer = String::new();
    let mut page_refs: Vec<u32> = Vec::new();

    for page_index in range.clone() {
        let number = page_index + 1;
        let Some(&page_id) = pages.get(&number) else {
            warn!(page = number, "page missing from page tree");
            continue;
        };

        let page_text = page_text(&document, page_id, number, &spaces);
        if page_text.trim().is_empty() {
            warn!(page = number, "no text extracted from page");
        } else {
            info!(page = number, chars = page_text.len(), "extracted page text");
            buffer.push_str(&format!("[Text from Page {number}]:\n{page_text}\n"));
        }
        page_refs.push(number);

        let images: Vec<PageImageRef> = page_image_ids(&document, page_id)
            .into_iter()
            .filter(|object_id| {
                encode_image(&document, *object_id)
                    .map(|image| is_valid_image(&image))
                    .unwrap_or(false)
            })
            .map(|object_id| PageImageRef {
                page_index,
                object_id,
            })
            .collect();
        debug!(page = number, images = images.len(), "valid images on page");
        extraction.images.extend(images);

        if buffer.chars().count() >= chunk_size {
            let chunks = chunker.chunk(&buffer, source, &page_refs, ChunkKind::Text);
            info!(page = number, chunks = chunks.len(), "chunked text buffer");
            extraction.chunks.extend(chunks);
            buffer.clear();
            page_refs.clear();
        }
    }

    if !buffer.trim().is_empty() {
        let chunks = chunker.chunk(&buffer, source, &page_refs, ChunkKind::Text);
        info!(
            start = range.start,
            end = range.end,
            chunks = chunks.len(),
            "final text chunking for batch"
        );
        extraction.chunks.extend(chunks);
    }

    Ok(extraction)
}

/// Structured text, or lopdf's whole-page text when the structured pass only
/// recovered whitespace.
fn page_text(document: &Document, page_id: ObjectId, number: u32, spaces: &Regex) -> String {
    let structured = structured_page_text(document, page_id, spaces);
    if !structured.trim().is_empty() {
        return structured;
    }
    document
        .extract_text(&[number])
        .map(|text| strip_controls(&text))
        .unwrap_or_default()
}

fn strip_controls(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_control() || *ch == '\n')
        .collect()
}

/// Rebuild lines from the page content stream: text objects and line moves
/// end a line, show-text operators append to it.
pub fn structured_page_text(document: &Document, page_id: ObjectId, spaces: &Regex) -> String {
    let Ok(raw) = document.get_page_content(page_id) else {
        return String::new();
    };
    let Ok(content) = Content::decode(&raw) else {
        return String::new();
    };

    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();

    for operation in content.operations {
        match operation.operator.as_str() {
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operation.operands.first() {
                    line.push_str(&decode_pdf_string(bytes));
                }
            }
            "'" | "\"" => {
                flush_line(&mut lines, &mut line, spaces);
                if let Some(Object::String(bytes, _)) = operation.operands.last() {
                    line.push_str(&decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operation.operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => line.push_str(&decode_pdf_string(bytes)),
                            Object::Integer(gap) if *gap < -200 => line.push(' '),
                            Object::Real(gap) if *gap < -200.0 => line.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            "BT" | "ET" | "Td" | "TD" | "T*" | "Tm" => flush_line(&mut lines, &mut line, spaces),
            _ => {}
        }
    }
    flush_line(&mut lines, &mut line, spaces);

    lines.join("\n")
}

fn flush_line(lines: &mut Vec<String>, line: &mut String, spaces: &Regex) {
    let collapsed = spaces.replace_all(line.trim(), " ").into_owned();
    if !collapsed.is_empty() {
        lines.push(collapsed);
    }
    line.clear();
}

/// PDF strings are UTF-16BE when they carry a BOM, otherwise UTF-8 or
/// PDFDocEncoding (read as Latin-1). Control characters are dropped: they
/// come from font-specific encodings this pass cannot map.
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    let decoded = if let [0xFE, 0xFF, rest @ ..] = bytes {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => bytes.iter().map(|&byte| byte as char).collect(),
        }
    };
    decoded.chars().filter(|ch| !ch.is_control()).collect()
}

/// Image XObject ids in the page resources, following inherited resources.
pub fn page_image_ids(document: &Document, page_id: ObjectId) -> Vec<ObjectId> {
    let mut ids = Vec::new();
    let mut node = document.get_dictionary(page_id).ok();
    let mut depth = 0;

    while let Some(dictionary) = node {
        if let Some(xobjects) = dictionary
            .get(b"Resources")
            .ok()
            .and_then(|resources| resolve_dictionary(document, resources))
            .and_then(|resources| resources.get(b"XObject").ok())
            .and_then(|xobjects| resolve_dictionary(document, xobjects))
        {
            for (_, value) in xobjects.iter() {
                if let Object::Reference(id) = value {
                    if is_image_xobject(document, *id) && !ids.contains(id) {
                        ids.push(*id);
                    }
                }
            }
            break;
        }

        depth += 1;
        if depth > 32 {
            break;
        }
        node = dictionary
            .get(b"Parent")
            .ok()
            .and_then(|parent| resolve_dictionary(document, parent));
    }

    ids
}

fn resolve_dictionary<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match object {
        Object::Dictionary(dictionary) => Some(dictionary),
        Object::Reference(id) => document.get_dictionary(*id).ok(),
        _ => None,
    }
}

fn is_image_xobject(document: &Document, id: ObjectId) -> bool {
    match document.get_object(id) {
        Ok(Object::Stream(stream)) => {
            matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == b"Image")
        }
        _ => false,
    }
}

pub fn is_valid_image(image: &EncodedImage) -> bool {
    image.bytes.len() >= MIN_IMAGE_BYTES
}

/// Decode an image XObject into bytes a vision model accepts. JPEG streams
/// pass through; raw or Flate 8-bit gray/RGB pixels are re-encoded as PNG.
/// `None` when the stream cannot be decoded.
pub fn encode_image(document: &Document, id: ObjectId) -> Option<EncodedImage> {
    let Ok(Object::Stream(stream)) = document.get_object(id) else {
        return None;
    };

    let filters = stream_filters(&stream.dict);
    match filters.as_slice() {
        [filter] if filter == b"DCTDecode" => {
            image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg).ok()?;
            Some(EncodedImage {
                bytes: stream.content.clone(),
                mime_type: "image/jpeg",
            })
        }
        [] | [_] => {
            let pixels = if filters.is_empty() {
                stream.content.clone()
            } else if filters[0] == b"FlateDecode" {
                stream.decompressed_content().ok()?
            } else {
                return None;
            };
            raw_to_png(&stream.dict, pixels)
        }
        _ => None,
    }
}

fn stream_filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn raw_to_png(dict: &Dictionary, mut pixels: Vec<u8>) -> Option<EncodedImage> {
    let width = integer(dict, b"Width")?;
    let height = integer(dict, b"Height")?;
    if integer(dict, b"BitsPerComponent")? != 8 {
        return None;
    }

    let channels = match dict.get(b"ColorSpace") {
        Ok(Object::Name(name)) if name.as_slice() == b"DeviceRGB" => 3,
        Ok(Object::Name(name)) if name.as_slice() == b"DeviceGray" => 1,
        _ => return None,
    };

    let expected = (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels)?;
    if pixels.len() < expected {
        return None;
    }
    pixels.truncate(expected);

    let image = if channels == 3 {
        DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, pixels)?)
    } else {
        DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels)?)
    };

    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .ok()?;
    Some(EncodedImage {
        bytes,
        mime_type: "image/png",
    })
}

fn integer(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    match dict.get(key) {
        Ok(Object::Integer(value)) => u32::try_from(*value).ok(),
        _ => None,
    }
}
