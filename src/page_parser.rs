//! Page content parsing.
//!
//! A [`StructureParser`] turns one PAGE XML file into a standalone JSON
//! tree:
//!
//! ```json
//! {
//!   "file": {"docId": "1234", "pageNr": "3", "page_relevance": "no", ...},
//!   "elements": [{
//!     "id": "r1",
//!     "element_type": "TextRegion",
//!     "coordinates": "10,10 200,10 200,50 10,50",
//!     "element_data": {
//!       "text_lines": ["Wien, den 3. März"],
//!       "custom_structure": {"readingOrder": {"index": "0"}},
//!       "custom_list_structure": [
//!         {"type": "place", "text": "Wien", "offset": 0, "length": 4,
//!          "line_index": 0, "line_id": "l1", "line_text": "Wien, den 3. März"}
//!       ]
//!     }
//!   }]
//! }
//! ```
//!
//! The parse stage runs the parser for every page of a project on the
//! blocking pool, under a timeout, and stores the tree on the page.

use anyhow::{anyhow, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{json, Map, Value};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ParseSummary, ProjectConfig};
use crate::page_meta;
use crate::progress::{Stage, StageProgress};

/// Structural parser for one page file.
pub trait StructureParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Value>;
}

/// PAGE XML parser treating `line_type` elements as text-line containers.
pub struct PageXmlParser {
    line_type: String,
}

impl PageXmlParser {
    pub fn new(line_type: &str) -> Self {
        Self {
            line_type: line_type.to_string(),
        }
    }

    pub fn parse_bytes(&self, xml: &[u8]) -> Result<Value> {
        let mut reader = Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut builder = PageBuilder::default();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => builder.open(&e),
                Ok(Event::Empty(e)) => {
                    builder.open(&e);
                    builder.close(e.local_name().as_ref());
                }
                Ok(Event::End(e)) => builder.close(e.local_name().as_ref()),
                Ok(Event::Text(t)) => {
                    if builder.in_unicode {
                        let text = t.unescape().map_err(|e| anyhow!("bad text: {}", e))?;
                        builder.unicode.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if builder.in_unicode {
                        builder.unicode.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(anyhow!(
                        "malformed XML at position {}: {}",
                        reader.buffer_position(),
                        e
                    ))
                }
                _ => {}
            }
            buf.clear();
        }

        if !builder.page_seen {
            return Err(anyhow!("no Page element found"));
        }
        Ok(builder.into_json(&self.line_type))
    }
}

impl StructureParser for PageXmlParser {
    fn parse(&self, path: &Path) -> Result<Value> {
        let xml = std::fs::read(path)?;
        self.parse_bytes(&xml)
    }
}

/// Parse a Transkribus `custom` attribute such as
/// `readingOrder {index:0;} person {offset:5; length:4; continued:true;}`
/// into `(type, attributes)` pairs, in order.
pub fn parse_custom(custom: &str) -> Vec<(String, BTreeMap<String, String>)> {
    let mut out = Vec::new();
    for chunk in custom.split('}') {
        let Some((name, body)) = chunk.split_once('{') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let mut attrs = BTreeMap::new();
        for pair in body.split(';') {
            if let Some((key, value)) = pair.split_once(':') {
                attrs.insert(key.trim().to_string(), unescape_custom(value.trim()));
            }
        }
        out.push((name.to_string(), attrs));
    }
    out
}

/// Resolve `\uXXXX` escapes used for reserved characters in custom values.
fn unescape_custom(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find("\\u") {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 2..pos + 6);
        match code
            .and_then(|c| u32::from_str_radix(c, 16).ok())
            .and_then(char::from_u32)
        {
            Some(c) => {
                out.push(c);
                rest = &rest[pos + 6..];
            }
            None => {
                out.push_str("\\u");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn custom_structure(custom: &str) -> Value {
    let mut map = Map::new();
    for (name, attrs) in parse_custom(custom) {
        map.entry(name).or_insert_with(|| json!(attrs));
    }
    Value::Object(map)
}

/// Tag entries of one line's custom attribute. Entries with a usable
/// `offset`/`length` carry the tagged `text`.
fn line_tags(line: &LineBuf, line_index: usize) -> Vec<Value> {
    let line_text = line.text.as_deref().unwrap_or("");
    let mut tags = Vec::new();
    for (tag_type, attrs) in parse_custom(&line.custom) {
        let mut tag = Map::new();
        tag.insert("type".to_string(), json!(tag_type));
        for (key, value) in &attrs {
            let value = match key.as_str() {
                "offset" | "length" => match value.parse::<usize>() {
                    Ok(n) => json!(n),
                    Err(_) => json!(value),
                },
                "continued" => json!(value == "true"),
                _ => json!(value),
            };
            tag.insert(key.clone(), value);
        }

        let offset = attrs.get("offset").and_then(|v| v.parse::<usize>().ok());
        let length = attrs.get("length").and_then(|v| v.parse::<usize>().ok());
        if let (Some(offset), Some(length)) = (offset, length) {
            let text: String = line_text.chars().skip(offset).take(length).collect();
            if !text.is_empty() {
                tag.insert("text".to_string(), json!(text));
            }
        }
        tag.insert("line_index".to_string(), json!(line_index));
        tag.insert("line_id".to_string(), json!(line.id));
        tag.insert("line_text".to_string(), json!(line_text));
        tags.push(Value::Object(tag));
    }
    tags
}

#[derive(Default)]
struct LineBuf {
    id: String,
    custom: String,
    coords: Option<String>,
    text: Option<String>,
}

#[derive(Default)]
struct RegionBuf {
    ordinal: usize,
    id: String,
    custom: String,
    coords: Option<String>,
    lines: Vec<LineBuf>,
    text: Option<String>,
}

#[derive(Default)]
struct PageBuilder {
    file: BTreeMap<String, String>,
    page_seen: bool,
    in_metadata: bool,
    regions: Vec<RegionBuf>,
    finished: Vec<RegionBuf>,
    line: Option<LineBuf>,
    word_depth: usize,
    in_unicode: bool,
    unicode: String,
    next_ordinal: usize,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

impl PageBuilder {
    fn open(&mut self, e: &BytesStart<'_>) {
        match e.local_name().as_ref() {
            b"TranskribusMetadata" => {
                self.in_metadata = true;
                let _ = page_meta::collect_attributes(e, &mut self.file);
            }
            b"Property" if self.in_metadata => {
                let _ = page_meta::collect_property(e, &mut self.file);
            }
            b"Page" => {
                self.page_seen = true;
                let _ = page_meta::collect_attributes(e, &mut self.file);
                if let Some(custom) = attr(e, b"custom") {
                    for (name, attrs) in parse_custom(&custom) {
                        if let Some(value) = attrs.get("value") {
                            self.file.insert(name, value.clone());
                        }
                    }
                }
            }
            b"TextRegion" => {
                self.regions.push(RegionBuf {
                    ordinal: self.next_ordinal,
                    id: attr(e, b"id").unwrap_or_default(),
                    custom: attr(e, b"custom").unwrap_or_default(),
                    ..Default::default()
                });
                self.next_ordinal += 1;
            }
            b"TextLine" => {
                self.line = Some(LineBuf {
                    id: attr(e, b"id").unwrap_or_default(),
                    custom: attr(e, b"custom").unwrap_or_default(),
                    ..Default::default()
                });
            }
            b"Word" | b"Glyph" => self.word_depth += 1,
            b"Coords" if self.word_depth == 0 => {
                let points = attr(e, b"points");
                if let Some(line) = self.line.as_mut() {
                    if line.coords.is_none() {
                        line.coords = points;
                    }
                } else if let Some(region) = self.regions.last_mut() {
                    if region.coords.is_none() {
                        region.coords = points;
                    }
                }
            }
            b"Unicode" if self.word_depth == 0 => {
                self.in_unicode = true;
                self.unicode.clear();
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"TranskribusMetadata" => self.in_metadata = false,
            b"TextRegion" => {
                if let Some(region) = self.regions.pop() {
                    self.finished.push(region);
                }
            }
            b"TextLine" => {
                if let Some(line) = self.line.take() {
                    if let Some(region) = self.regions.last_mut() {
                        region.lines.push(line);
                    }
                }
            }
            b"Word" | b"Glyph" => self.word_depth = self.word_depth.saturating_sub(1),
            b"Unicode" if self.in_unicode => {
                self.in_unicode = false;
                let text = std::mem::take(&mut self.unicode);
                if let Some(line) = self.line.as_mut() {
                    if line.text.is_none() {
                        line.text = Some(text);
                    }
                } else if let Some(region) = self.regions.last_mut() {
                    if region.text.is_none() {
                        region.text = Some(text);
                    }
                }
            }
            _ => {}
        }
    }

    fn into_json(mut self, line_type: &str) -> Value {
        self.finished.sort_by_key(|r| r.ordinal);
        let mut elements = Vec::new();

        for region in &self.finished {
            if line_type == "TextLine" {
                for line in &region.lines {
                    elements.push(json!({
                        "id": line.id,
                        "element_type": "TextLine",
                        "coordinates": line.coords,
                        "element_data": {
                            "text_lines": [line.text.clone().unwrap_or_default()],
                            "custom_structure": custom_structure(&line.custom),
                            "custom_list_structure": line_tags(line, 0),
                        }
                    }));
                }
                continue;
            }

            let text_lines: Vec<String> = if region.lines.is_empty() {
                region
                    .text
                    .as_deref()
                    .map(|t| t.lines().map(str::to_string).collect())
                    .unwrap_or_default()
            } else {
                region
                    .lines
                    .iter()
                    .map(|l| l.text.clone().unwrap_or_default())
                    .collect()
            };
            let tags: Vec<Value> = region
                .lines
                .iter()
                .enumerate()
                .flat_map(|(i, line)| line_tags(line, i))
                .collect();

            elements.push(json!({
                "id": region.id,
                "element_type": "TextRegion",
                "coordinates": region.coords,
                "element_data": {
                    "text_lines": text_lines,
                    "custom_structure": custom_structure(&region.custom),
                    "custom_list_structure": tags,
                }
            }));
        }

        json!({ "file": self.file, "elements": elements })
    }
}

/// Whether the parsed tree declares the page not relevant.
pub fn is_irrelevant(parsed: &Value) -> bool {
    parsed
        .get("file")
        .and_then(|f| f.get("page_relevance"))
        .and_then(Value::as_str)
        .map(|v| v.trim().eq_ignore_ascii_case("no"))
        .unwrap_or(false)
}

/// Parse every page of the project, ordered by document then page number.
pub async fn parse_pages(
    config: &Config,
    pool: &SqlitePool,
    project: &ProjectConfig,
    user: &str,
    parser: Arc<dyn StructureParser>,
    progress: &dyn StageProgress,
) -> PipelineResult<ParseSummary> {
    let rows = sqlx::query(
        r#"
        SELECT p.id, p.xml_path, p.source_page_id, p.page_number, d.source_doc_id
        FROM pages p
        JOIN documents d ON d.id = p.document_id
        WHERE d.project_id = ?
        ORDER BY d.source_doc_id, p.page_number, p.id
        "#,
    )
    .bind(project.id)
    .fetch_all(pool)
    .await?;

    let total = rows.len() as u64;
    let timeout = Duration::from_secs(config.parser.timeout_secs);
    let mut summary = ParseSummary::default();

    for (i, row) in rows.iter().enumerate() {
        let done = i as u64 + 1;
        let page_id: i64 = row.get("id");
        let xml_path: String = row.get("xml_path");
        let source_page_id: String = row.get("source_page_id");
        let page_number: i64 = row.get("page_number");
        let doc_id: String = row.get("source_doc_id");
        let label = format!(
            "page {} (#{}) of document {}",
            source_page_id, page_number, doc_id
        );

        let path = config.storage.resolve(&xml_path);
        if !path.exists() {
            warn!(page_id, path = %path.display(), "page file missing, keeping previous parse");
            summary.files_missing += 1;
            progress
                .advance(Stage::Parse, done, total, &format!("missing {}", label))
                .await?;
            continue;
        }

        let parsed_at = chrono::Utc::now().timestamp();
        let task_parser = Arc::clone(&parser);
        let task_path = path.clone();
        let outcome = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || task_parser.parse(&task_path)),
        )
        .await;

        let parsed = match outcome {
            Err(_) => {
                return Err(PipelineError::ParserTimeout {
                    path: xml_path,
                    secs: config.parser.timeout_secs,
                })
            }
            Ok(Err(join)) => {
                return Err(PipelineError::Parser {
                    path: xml_path,
                    message: format!("parser task failed: {}", join),
                })
            }
            Ok(Ok(Err(e))) => {
                return Err(PipelineError::Parser {
                    path: xml_path,
                    message: format!("{:#}", e),
                })
            }
            Ok(Ok(Ok(value))) => value,
        };

        let irrelevant = is_irrelevant(&parsed);
        sqlx::query(
            r#"
            UPDATE pages SET parsed_json = ?, last_parsed_at = ?,
                             is_ignored = CASE WHEN ? THEN 1 ELSE is_ignored END,
                             modified_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(parsed.to_string())
        .bind(parsed_at)
        .bind(irrelevant)
        .bind(user)
        .bind(chrono::Utc::now().timestamp())
        .bind(page_id)
        .execute(pool)
        .await?;

        summary.pages_parsed += 1;
        if irrelevant {
            summary.pages_ignored += 1;
            debug!(page_id, "page marked not relevant");
        }

        progress
            .advance(Stage::Parse, done, total, &format!("parsed {}", label))
            .await?;
    }

    info!(
        project_id = project.id,
        parsed = summary.pages_parsed,
        ignored = summary.pages_ignored,
        missing = summary.files_missing,
        "pages parsed"
    );
    Ok(summary)
}
