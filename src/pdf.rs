//! Multi-page PDF assembly.
//!
//! One buffer is normalised in place (creator tag, optional diagram in the `Subject` field).
//! Several buffers are merged into a fresh document, page order preserved, with the diagram
//! attached as an embedded file.

use crate::error::{CoreError, Result};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

pub const DEFAULT_CREATOR: &str = "diagrams.net";
pub const ATTACHMENT_NAME: &str = "diagram.xml";
pub const ATTACHMENT_MIME: &str = "application/vnd.jgraph.mxfile";
const ATTACHMENT_DESCRIPTION: &str = "Diagram Content";
const PDF_VERSION: &str = "1.7";
/// Page attributes a page may inherit from its `Pages` ancestors.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

fn assembly(err: impl std::fmt::Display) -> CoreError {
    CoreError::Assembly(err.to_string())
}

/// Diagram source as stored in the `Subject` field: percent-encoded, parentheses included.
pub fn encode_subject(xml: &str) -> String {
    urlencoding::encode(xml).into_owned()
}

/// Merges rendered page buffers into one document, in input order.
pub fn merge_pdfs(buffers: &[Vec<u8>], xml: Option<&str>, creator: &str) -> Result<Vec<u8>> {
    match buffers {
        [] => Err(CoreError::Assembly("no pages to assemble".into())),
        [single] => normalize_single(single, xml, creator),
        _ => merge_many(buffers, xml, creator),
    }
}

fn normalize_single(buffer: &[u8], xml: Option<&str>, creator: &str) -> Result<Vec<u8>> {
    let mut doc = Document::load_mem(buffer).map_err(assembly)?;
    let info = info_dict(&mut doc)?;
    info.set("Creator", Object::string_literal(creator));
    if let Some(xml) = xml {
        info.set("Subject", Object::string_literal(encode_subject(xml)));
    }
    save(&mut doc)
}

fn info_dict(doc: &mut Document) -> Result<&mut Dictionary> {
    let info_id = match doc.trailer.get(b"Info").and_then(Object::as_reference) {
        Ok(id) => id,
        Err(_) => {
            let id = doc.add_object(Dictionary::new());
            doc.trailer.set("Info", id);
            id
        }
    };
    doc.get_object_mut(info_id)
        .and_then(Object::as_dict_mut)
        .map_err(assembly)
}

fn merge_many(buffers: &[Vec<u8>], xml: Option<&str>, creator: &str) -> Result<Vec<u8>> {
    let mut merged = Document::with_version(PDF_VERSION);
    let pages_id = merged.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    let mut next_id = merged.max_id + 1;

    for (index, buffer) in buffers.iter().enumerate() {
        let mut doc = Document::load_mem(buffer)
            .map_err(|e| CoreError::Assembly(format!("page buffer {index}: {e}")))?;
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let mut pages = Vec::with_capacity(page_ids.len());
        for page_id in &page_ids {
            pages.push((*page_id, flatten_page(&doc, *page_id)?));
        }

        for (id, object) in std::mem::take(&mut doc.objects) {
            if matches!(
                type_name(&object),
                Some(b"Catalog" | b"Pages" | b"Outlines" | b"Outline" | b"ObjStm" | b"XRef")
            ) {
                continue;
            }
            merged.objects.insert(id, object);
        }

        for (page_id, mut page) in pages {
            page.set("Parent", pages_id);
            merged.objects.insert(page_id, Object::Dictionary(page));
            kids.push(page_id.into());
        }
    }
    merged.max_id = next_id - 1;

    let page_count = kids.len() as i64;
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
        }),
    );

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    if let Some(xml) = xml {
        let filespec = attach_diagram(&mut merged, xml);
        catalog.set(
            "Names",
            dictionary! {
                "EmbeddedFiles" => dictionary! {
                    "Names" => vec![Object::string_literal(ATTACHMENT_NAME), filespec.into()],
                },
            },
        );
        catalog.set("AF", vec![Object::from(filespec)]);
    }
    let catalog_id = merged.add_object(catalog);
    merged.trailer.set("Root", catalog_id);

    let info_id = merged.add_object(dictionary! {
        "Creator" => Object::string_literal(creator),
        "Producer" => Object::string_literal(creator),
    });
    merged.trailer.set("Info", info_id);

    tracing::debug!(pages = page_count, inputs = buffers.len(), "merged PDF buffers");
    save(&mut merged)
}

/// Adds the embedded-file stream and its file specification, returning the filespec id.
fn attach_diagram(doc: &mut Document, xml: &str) -> ObjectId {
    let bytes = xml.as_bytes().to_vec();
    let size = bytes.len() as i64;
    let stream = Stream::new(
        dictionary! {
            "Type" => "EmbeddedFile",
            "Subtype" => ATTACHMENT_MIME,
            "Params" => dictionary! { "Size" => size },
        },
        bytes,
    );
    let file_id = doc.add_object(stream);
    doc.add_object(dictionary! {
        "Type" => "Filespec",
        "F" => Object::string_literal(ATTACHMENT_NAME),
        "UF" => Object::string_literal(ATTACHMENT_NAME),
        "Desc" => Object::string_literal(ATTACHMENT_DESCRIPTION),
        "AFRelationship" => "Data",
        "EF" => dictionary! { "F" => file_id },
    })
}

/// Copy of a page dictionary with inherited attributes pulled down from its ancestors.
fn flatten_page(doc: &Document, page_id: ObjectId) -> Result<Dictionary> {
    let mut page = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(assembly)?
        .clone();

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut depth = 0;
    while let Some(parent_id) = parent {
        depth += 1;
        if depth > 64 {
            return Err(CoreError::Assembly("page tree too deep".into()));
        }
        let Ok(node) = doc.get_object(parent_id).and_then(Object::as_dict) else {
            break;
        };
        for key in INHERITABLE {
            if !page.has(key) {
                if let Ok(value) = node.get(key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Ok(page)
}

fn type_name(object: &Object) -> Option<&[u8]> {
    let dict = match object {
        Object::Dictionary(dict) => dict,
        Object::Stream(stream) => &stream.dict,
        _ => return None,
    };
    dict.get(b"Type").and_then(Object::as_name).ok()
}

fn save(doc: &mut Document) -> Result<Vec<u8>> {
    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(assembly)?;
    Ok(out)
}

/// Number of pages in a PDF buffer.
pub fn page_count(buffer: &[u8]) -> Result<usize> {
    Document::load_mem(buffer)
        .map(|doc| doc.get_pages().len())
        .map_err(assembly)
}
