use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use std::path::Path;

pub(crate) struct TestImage {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Deterministic pseudo-random bytes that do not compress well.
pub(crate) fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Write a PDF with one text line per page and raw DeviceGray image XObjects.
pub(crate) fn write_pdf(
    path: &Path,
    pages: &[&str],
    images: &[TestImage],
) -> Result<(), Box<dyn std::error::Error>> {
    let pages: Vec<&[u8]> = pages.iter().map(|text| text.as_bytes()).collect();
    build_pdf(path, None, &pages, images)
}

/// One page whose single string holds `bytes` under a font with `encoding`.
pub(crate) fn write_encoded_pdf(
    path: &Path,
    encoding: &str,
    bytes: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    build_pdf(path, Some(encoding), &[bytes], &[])
}

fn build_pdf(
    path: &Path,
    encoding: Option<&str>,
    pages: &[&[u8]],
    images: &[TestImage],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let mut font = dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    };
    if let Some(encoding) = encoding {
        font.set("Encoding", Object::Name(encoding.as_bytes().to_vec()));
    }
    let font_id = document.add_object(font);

    let mut kids: Vec<Object> = Vec::new();
    for (index, text) in pages.iter().enumerate() {
        let mut xobjects = Dictionary::new();
        for (slot, image) in images
            .iter()
            .filter(|image| image.page_index == index)
            .enumerate()
        {
            let stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => image.width as i64,
                    "Height" => image.height as i64,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                image.pixels.clone(),
            );
            let image_id = document.add_object(stream);
            xobjects.set(format!("Im{slot}"), image_id);
        }

        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(text.to_vec())]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = document.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => xobjects,
            },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);
    document.save(path)?;
    Ok(())
}
