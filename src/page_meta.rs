//! Source-platform metadata of exported files.
//!
//! Every page file carries a `TranskribusMetadata` block inside its PAGE
//! `Metadata` element:
//!
//! ```xml
//! <TranskribusMetadata docId="1234" pageId="5678" pageNr="3" status="GT">
//!   <Property key="page_relevance" value="no"/>
//! </TranskribusMetadata>
//! ```
//!
//! [`read_page_metadata`] returns the three identifiers the reconciler keys
//! on plus every other attribute and property. [`read_document_metadata`]
//! flattens a `metadata.xml`/`mets.xml` file into its leaf fields.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Namespace prefix shared by all PAGE schema versions.
pub const PAGE_NAMESPACE_PREFIX: &str = "http://schema.primaresearch.org/PAGE/gts/pagecontent/";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("not a PAGE document (namespace missing or unknown)")]
    Namespace,

    #[error("TranskribusMetadata block not found in the file")]
    NoMetadataBlock,

    #[error("TranskribusMetadata lacks required field '{0}'")]
    MissingField(&'static str),

    #[error("page number '{0}' is not an integer")]
    InvalidPageNumber(String),
}

/// Identifiers and raw fields of one page file.
#[derive(Debug, Clone, PartialEq)]
pub struct PageMetadata {
    pub doc_id: String,
    pub page_id: String,
    pub page_nr: i64,
    /// All attributes and properties, identifiers included.
    pub fields: BTreeMap<String, String>,
}

pub fn read_page_metadata(path: &Path) -> Result<PageMetadata, MetadataError> {
    let xml = std::fs::read(path)?;
    parse_page_metadata(&xml)
}

pub fn parse_page_metadata(xml: &[u8]) -> Result<PageMetadata, MetadataError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut root_seen = false;
    let mut in_block = false;
    let mut block_found = false;
    let mut fields = BTreeMap::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if !root_seen {
                    check_namespace(&e)?;
                    root_seen = true;
                } else if e.local_name().as_ref() == b"TranskribusMetadata" {
                    block_found = true;
                    in_block = true;
                    collect_attributes(&e, &mut fields)?;
                } else if in_block && e.local_name().as_ref() == b"Property" {
                    collect_property(&e, &mut fields)?;
                }
            }
            Ok(Event::Empty(e)) => {
                if !root_seen {
                    check_namespace(&e)?;
                    root_seen = true;
                } else if e.local_name().as_ref() == b"TranskribusMetadata" {
                    block_found = true;
                    collect_attributes(&e, &mut fields)?;
                } else if in_block && e.local_name().as_ref() == b"Property" {
                    collect_property(&e, &mut fields)?;
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"TranskribusMetadata" {
                    in_block = false;
                } else if e.local_name().as_ref() == b"Metadata" && block_found {
                    // Nothing of interest follows the metadata block.
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(MetadataError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !root_seen {
        return Err(MetadataError::Namespace);
    }
    if !block_found {
        return Err(MetadataError::NoMetadataBlock);
    }

    let doc_id = required(&fields, "docId")?;
    let page_id = required(&fields, "pageId")?;
    let raw_nr = required(&fields, "pageNr")?;
    let page_nr = raw_nr
        .trim()
        .parse::<i64>()
        .map_err(|_| MetadataError::InvalidPageNumber(raw_nr.clone()))?;

    Ok(PageMetadata {
        doc_id,
        page_id,
        page_nr,
        fields,
    })
}

fn required(fields: &BTreeMap<String, String>, key: &'static str) -> Result<String, MetadataError> {
    fields
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or(MetadataError::MissingField(key))
}

fn check_namespace(root: &BytesStart<'_>) -> Result<(), MetadataError> {
    for attr in root.attributes() {
        let attr = attr.map_err(|e| MetadataError::Xml(e.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            let value = attr
                .unescape_value()
                .map_err(|e| MetadataError::Xml(e.to_string()))?;
            if value.starts_with(PAGE_NAMESPACE_PREFIX) {
                return Ok(());
            }
        }
    }
    Err(MetadataError::Namespace)
}

pub(crate) fn collect_attributes(
    e: &BytesStart<'_>,
    fields: &mut BTreeMap<String, String>,
) -> Result<(), MetadataError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| MetadataError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| MetadataError::Xml(e.to_string()))?;
        fields.insert(key, value.to_string());
    }
    Ok(())
}

pub(crate) fn collect_property(
    e: &BytesStart<'_>,
    fields: &mut BTreeMap<String, String>,
) -> Result<(), MetadataError> {
    let mut key = None;
    let mut value = String::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| MetadataError::Xml(e.to_string()))?;
        let text = attr
            .unescape_value()
            .map_err(|e| MetadataError::Xml(e.to_string()))?
            .to_string();
        match attr.key.local_name().as_ref() {
            b"key" => key = Some(text),
            b"value" => value = text,
            _ => {}
        }
    }
    if let Some(key) = key {
        fields.insert(key, value);
    }
    Ok(())
}

/// Flatten a document-level metadata file into `local name -> text` for
/// every element with text content. The first occurrence of a name wins.
pub fn read_document_metadata(path: &Path) -> Result<BTreeMap<String, String>, MetadataError> {
    let xml = std::fs::read(path)?;
    parse_document_metadata(&xml)
}

pub fn parse_document_metadata(xml: &[u8]) -> Result<BTreeMap<String, String>, MetadataError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut fields = BTreeMap::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).to_string());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| MetadataError::Xml(e.to_string()))?;
                let text = text.trim();
                if let Some(name) = stack.last() {
                    if !text.is_empty() && !fields.contains_key(name) {
                        fields.insert(name.clone(), text.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(MetadataError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(fields)
}
