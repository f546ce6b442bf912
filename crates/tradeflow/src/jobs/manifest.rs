//! Manifest ingestion.
//!
//! A manifest arrives in one of three shapes and is normalized into an ordered
//! list of [`ItemDescriptor`]s:
//! - `json`: an array of objects, or an object with an `items` array
//! - `csv`: tabular text with a header row, one item per row
//! - `zip`: an archive holding one file per item
//!
//! Records beyond `max_items` are dropped, not rejected. The caller gets the
//! count back in [`ParsedManifest`] so the truncation lands on the job record
//! and in its event trail.

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ManifestError;

pub const DEFAULT_MAX_ITEMS: usize = 200;

/// Largest uncompressed zip entry accepted as one item.
pub const MAX_ZIP_ENTRY_BYTES: u64 = 25 * 1024 * 1024;

/// Record fields checked, in order, for the item's external identifier.
const IDENTIFIER_FIELDS: [&str; 3] = ["external_id", "reference", "document_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestFormat {
    Json,
    Csv,
    Zip,
}

impl ManifestFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestFormat::Json => "json",
            ManifestFormat::Csv => "csv",
            ManifestFormat::Zip => "zip",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ManifestFormat::Json),
            "csv" => Ok(ManifestFormat::Csv),
            "zip" => Ok(ManifestFormat::Zip),
            other => Err(ManifestError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the manifest bytes come from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Inline(Vec<u8>),
    /// Resolved through a [`BlobSource`].
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub external_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub items: Vec<ItemDescriptor>,
    /// Records present in the manifest, including dropped ones.
    pub total_records: usize,
    pub truncated: usize,
}

pub fn parse(
    format: ManifestFormat,
    raw: &[u8],
    max_items: usize,
) -> Result<ParsedManifest, ManifestError> {
    let parsed = match format {
        ManifestFormat::Json => parse_json(raw, max_items)?,
        ManifestFormat::Csv => parse_csv(raw, max_items)?,
        ManifestFormat::Zip => parse_zip(raw, max_items, MAX_ZIP_ENTRY_BYTES)?,
    };

    // a cap of zero keeps nothing, which is no job either
    if parsed.items.is_empty() {
        return Err(ManifestError::Empty);
    }

    check_unique(&parsed.items)?;

    if parsed.truncated > 0 {
        tracing::warn!(
            format = %format,
            total_records = parsed.total_records,
            kept = parsed.items.len(),
            dropped = parsed.truncated,
            "manifest truncated to item cap"
        );
    }

    Ok(parsed)
}

fn parse_json(raw: &[u8], max_items: usize) -> Result<ParsedManifest, ManifestError> {
    let doc: Value =
        serde_json::from_slice(raw).map_err(|e| ManifestError::Malformed(e.to_string()))?;

    let records = match doc {
        Value::Array(records) => records,
        Value::Object(mut obj) => match obj.remove("items") {
            Some(Value::Array(records)) => records,
            _ => {
                return Err(ManifestError::Malformed(
                    "expected an array of records or an object with an `items` array".into(),
                ))
            }
        },
        _ => {
            return Err(ManifestError::Malformed(
                "expected an array of records or an object with an `items` array".into(),
            ))
        }
    };

    let total_records = records.len();
    let mut items = Vec::with_capacity(total_records.min(max_items));

    for (index, record) in records.into_iter().take(max_items).enumerate() {
        let Value::Object(fields) = record else {
            return Err(ManifestError::InvalidRecord {
                index,
                reason: "expected an object".into(),
            });
        };
        let external_id =
            external_id_of(&fields).ok_or(ManifestError::MissingIdentifier { index })?;
        items.push(ItemDescriptor {
            external_id,
            payload: Value::Object(fields),
        });
    }

    Ok(ParsedManifest {
        truncated: total_records - items.len(),
        items,
        total_records,
    })
}

fn parse_csv(raw: &[u8], max_items: usize) -> Result<ParsedManifest, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(raw);

    let headers = reader
        .headers()
        .map_err(|e| ManifestError::Malformed(e.to_string()))?
        .clone();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ManifestError::Malformed("missing header row".into()));
    }

    let mut items = Vec::new();
    let mut total_records = 0;

    for (index, row) in reader.records().enumerate() {
        total_records += 1;
        if index >= max_items {
            // dropped rows are counted, not validated
            continue;
        }

        let row = row.map_err(|e| ManifestError::InvalidRecord {
            index,
            reason: e.to_string(),
        })?;

        let fields: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();

        let external_id =
            external_id_of(&fields).ok_or(ManifestError::MissingIdentifier { index })?;
        items.push(ItemDescriptor {
            external_id,
            payload: Value::Object(fields),
        });
    }

    Ok(ParsedManifest {
        truncated: total_records - items.len(),
        items,
        total_records,
    })
}

fn parse_zip(
    raw: &[u8],
    max_items: usize,
    max_entry_bytes: u64,
) -> Result<ParsedManifest, ManifestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))
        .map_err(|e| ManifestError::Malformed(e.to_string()))?;

    let mut items = Vec::new();
    let mut total_records = 0;

    for entry in 0..archive.len() {
        let mut file = archive
            .by_index(entry)
            .map_err(|e| ManifestError::Malformed(e.to_string()))?;

        let name = file.name().to_string();
        if file.is_dir() || is_hidden_entry(&name) {
            continue;
        }

        let index = total_records;
        total_records += 1;
        if index >= max_items {
            continue;
        }

        let external_id = Path::new(&name)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(ManifestError::MissingIdentifier { index })?;

        let oversized = || ManifestError::InvalidRecord {
            index,
            reason: format!("entry {name} exceeds {max_entry_bytes} bytes"),
        };
        if file.size() > max_entry_bytes {
            return Err(oversized());
        }

        // the declared size can lie; never read past the limit
        let mut content = Vec::new();
        (&mut file)
            .take(max_entry_bytes + 1)
            .read_to_end(&mut content)
            .map_err(|e| ManifestError::InvalidRecord {
                index,
                reason: format!("unreadable entry {name}: {e}"),
            })?;
        if content.len() as u64 > max_entry_bytes {
            return Err(oversized());
        }

        items.push(ItemDescriptor {
            external_id,
            payload: json!({
                "file_name": name,
                "size_bytes": content.len(),
                "content_base64": base64::engine::general_purpose::STANDARD.encode(&content),
            }),
        });
    }

    Ok(ParsedManifest {
        truncated: total_records - items.len(),
        items,
        total_records,
    })
}

fn is_hidden_entry(name: &str) -> bool {
    name.split('/')
        .any(|part| part.starts_with('.') || part == "__MACOSX")
}

fn external_id_of(fields: &Map<String, Value>) -> Option<String> {
    IDENTIFIER_FIELDS
        .iter()
        .find_map(|field| match fields.get(*field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn check_unique(items: &[ItemDescriptor]) -> Result<(), ManifestError> {
    let mut seen = HashSet::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if !seen.insert(item.external_id.as_str()) {
            return Err(ManifestError::DuplicateIdentifier {
                index,
                external_id: item.external_id.clone(),
            });
        }
    }
    Ok(())
}

/// Remote manifest storage, used when a manifest is submitted by reference.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>>;
}

/// Resolves references as paths relative to a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobSource {
    root: PathBuf,
}

impl FsBlobSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSource for FsBlobSource {
    async fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
        let rel = Path::new(reference);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            anyhow::bail!("manifest reference must be a relative path inside the manifest root");
        }
        let path = self.root.join(rel);
        let bytes = tokio::fs::read(&path).await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn json_accepts_bare_array_and_items_object() {
        let bare = br#"[{"external_id": "BL-1"}, {"reference": "BL-2", "port": "SGSIN"}]"#;
        let parsed = parse(ManifestFormat::Json, bare, 200).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].external_id, "BL-2");
        assert_eq!(parsed.items[1].payload["port"], "SGSIN");

        let wrapped = br#"{"items": [{"document_id": 42}]}"#;
        let parsed = parse(ManifestFormat::Json, wrapped, 200).unwrap();
        assert_eq!(parsed.items[0].external_id, "42");
    }

    #[test]
    fn json_missing_identifier_names_the_record() {
        let raw = br#"[{"external_id": "A"}, {"external_id": "  "}]"#;
        let err = parse(ManifestFormat::Json, raw, 200).unwrap_err();
        assert_eq!(err, ManifestError::MissingIdentifier { index: 1 });
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn json_rejects_non_object_records() {
        let err = parse(ManifestFormat::Json, br#"[{"external_id": "A"}, 7]"#, 200).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidRecord { index: 1, .. }));
    }

    #[test]
    fn csv_uses_header_row_for_payload_keys() {
        let raw = b"reference,consignee,value\nINV-1, Acme ,100\nINV-2,Globex,250\n";
        let parsed = parse(ManifestFormat::Csv, raw, 200).unwrap();
        assert_eq!(parsed.total_records, 2);
        assert_eq!(parsed.items[0].external_id, "INV-1");
        assert_eq!(parsed.items[0].payload["consignee"], "Acme");
        assert_eq!(parsed.items[1].payload["value"], "250");
    }

    #[test]
    fn csv_row_without_identifier_fails() {
        let raw = b"external_id,note\nA,x\n,y\n";
        let err = parse(ManifestFormat::Csv, raw, 200).unwrap_err();
        assert_eq!(err, ManifestError::MissingIdentifier { index: 1 });
    }

    #[test]
    fn zip_yields_one_item_per_file() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        writer.add_directory("docs/", opts).unwrap();
        writer.start_file("docs/CO-100.pdf", opts).unwrap();
        writer.write_all(b"%PDF-1.4").unwrap();
        writer.start_file("docs/.DS_Store", opts).unwrap();
        writer.write_all(b"junk").unwrap();
        writer.start_file("CO-200.xml", opts).unwrap();
        writer.write_all(b"<co/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let parsed = parse(ManifestFormat::Zip, &bytes, 200).unwrap();
        let ids: Vec<_> = parsed.items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["CO-100", "CO-200"]);
        assert_eq!(parsed.items[0].payload["size_bytes"], 8);
        assert_eq!(parsed.items[0].payload["file_name"], "docs/CO-100.pdf");
    }

    #[test]
    fn records_past_the_cap_are_dropped_not_rejected() {
        let records: Vec<Value> = (0..250)
            .map(|i| json!({ "external_id": format!("DOC-{i}") }))
            .collect();
        let raw = serde_json::to_vec(&records).unwrap();

        let parsed = parse(ManifestFormat::Json, &raw, 200).unwrap();
        assert_eq!(parsed.items.len(), 200);
        assert_eq!(parsed.total_records, 250);
        assert_eq!(parsed.truncated, 50);
        assert_eq!(parsed.items.last().unwrap().external_id, "DOC-199");
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let raw = br#"[{"external_id": "A"}, {"external_id": "B"}, {"reference": "A"}]"#;
        let err = parse(ManifestFormat::Json, raw, 200).unwrap_err();
        assert_eq!(
            err,
            ManifestError::DuplicateIdentifier {
                index: 2,
                external_id: "A".into()
            }
        );
    }

    #[test]
    fn empty_and_garbage_manifests_fail() {
        assert_eq!(
            parse(ManifestFormat::Json, b"[]", 200).unwrap_err(),
            ManifestError::Empty
        );
        assert!(matches!(
            parse(ManifestFormat::Json, b"{not json", 200).unwrap_err(),
            ManifestError::Malformed(_)
        ));
        assert!(matches!(
            parse(ManifestFormat::Zip, b"not a zip", 200).unwrap_err(),
            ManifestError::Malformed(_)
        ));
        assert!(ManifestFormat::parse("xlsx").is_err());
    }

    #[test]
    fn zero_item_cap_leaves_nothing_to_run() {
        let raw = br#"[{"external_id": "A"}, {"external_id": "B"}]"#;
        assert_eq!(
            parse(ManifestFormat::Json, raw, 0).unwrap_err(),
            ManifestError::Empty
        );
    }

    #[test]
    fn oversized_zip_entries_are_rejected() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        writer.start_file("CO-1.pdf", opts).unwrap();
        writer.write_all(&[b'x'; 64]).unwrap();
        writer.start_file("CO-2.pdf", opts).unwrap();
        writer.write_all(&[b'y'; 512]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let err = parse_zip(&bytes, 200, 128).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidRecord { index: 1, .. }));
        assert!(err.to_string().contains("CO-2.pdf"));

        let parsed = parse_zip(&bytes, 200, 512).unwrap();
        assert_eq!(parsed.items[1].payload["size_bytes"], 512);
    }
}
