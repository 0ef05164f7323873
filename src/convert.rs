//! Plain-text conversion for office and e-book formats.
//!
//! Supported: `.docx` (paragraphs, one per line), `.xlsx` (one row per line,
//! cells separated by spaces), `.csv` (rows re-joined with commas), and
//! `.epub` (content documents in spine order with markup stripped).
//!
//! Conversion never panics on malformed input; every failure is a
//! [`ConvertError`]. Anything outside the supported set is
//! [`ConvertError::Unsupported`].

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A format the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Docx,
    Xlsx,
    Csv,
    Epub,
}

impl Format {
    /// Resolve a declared format. Accepts `docx`, `.docx`, `DOCX`, etc.
    pub fn from_extension(ext: &str) -> Result<Self, ConvertError> {
        let normalized = ext.trim_start_matches('.').to_ascii_lowercase();
        match normalized.as_str() {
            "docx" => Ok(Format::Docx),
            "xlsx" => Ok(Format::Xlsx),
            "csv" => Ok(Format::Csv),
            "epub" => Ok(Format::Epub),
            _ => Err(ConvertError::Unsupported(ext.to_string())),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConvertError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| ConvertError::Unsupported(path.display().to_string()))?;
        Self::from_extension(ext)
    }
}

/// Extract plain text from `bytes` in the given format.
pub fn extract_text(bytes: &[u8], format: Format) -> Result<String, ConvertError> {
    match format {
        Format::Docx => extract_docx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        Format::Csv => extract_csv(bytes),
        Format::Epub => extract_epub(bytes),
    }
}

/// Convert one file into `<converted_dir>/<stem>.txt` and return the written path.
pub fn convert_file(
    path: &Path,
    format: Format,
    converted_dir: &Path,
) -> Result<PathBuf, ConvertError> {
    let bytes = std::fs::read(path)?;
    let content = extract_text(&bytes, format)?;

    std::fs::create_dir_all(converted_dir)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("converted");
    let out = converted_dir.join(format!("{}.txt", stem));
    std::fs::write(&out, content)?;
    Ok(out)
}

/// Counts reported by [`convert_existing_files`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvertSummary {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Convert every supported file under `data_dir`. Unsupported files are
/// skipped and failures are logged; neither stops the sweep.
pub fn convert_existing_files(data_dir: &Path, converted_dir: &Path) -> anyhow::Result<ConvertSummary> {
    std::fs::create_dir_all(converted_dir)?;
    let mut summary = ConvertSummary::default();

    if !data_dir.exists() {
        return Ok(summary);
    }

    for entry in WalkDir::new(data_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        let format = match Format::from_path(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping conversion");
                summary.skipped += 1;
                continue;
            }
        };

        match convert_file(path, format, converted_dir) {
            Ok(out) => {
                debug!(path = %path.display(), out = %out.display(), "converted");
                summary.converted += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "conversion failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        converted = summary.converted,
        skipped = summary.skipped,
        failed = summary.failed,
        "startup conversion finished"
    );
    Ok(summary)
}

// ============ ZIP helpers ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ConvertError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ConvertError::Zip(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ConvertError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ConvertError::Zip(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ConvertError::Zip(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn xml_reader(xml: &[u8]) -> quick_xml::Reader<&[u8]> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().check_end_names = false;
    reader
}

fn text_of(te: &quick_xml::events::BytesText<'_>) -> String {
    match te.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(te).into_owned(),
    }
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.local_name().as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

// ============ DOCX ============

fn extract_docx(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut out = String::new();
    let mut reader = xml_reader(&xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => out.push_str(&text_of(&te)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"p" => out.push('\n'),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ XLSX ============

fn extract_xlsx(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name)?;
        out.push_str(&extract_sheet_rows(&sheet_xml, &shared_strings)?);
    }
    Ok(out)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ConvertError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = xml_reader(&xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&text_of(&te));
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ConvertError> {
    let mut out = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut kind = CellKind::Value;
    let mut in_value = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    kind = match attr_value(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Value,
                    };
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = text_of(&te);
                let value = raw.trim();
                let cell = match kind {
                    CellKind::Shared => value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned()),
                    _ => Some(value.to_string()),
                };
                if let Some(cell) = cell.filter(|c| !c.is_empty()) {
                    row.push(cell);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => kind = CellKind::Value,
                b"row" => {
                    if !row.is_empty() {
                        out.push_str(&row.join(" "));
                        out.push('\n');
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    Ok(out)
}

// ============ CSV ============

fn extract_csv(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut out = String::new();
    for record in reader.records() {
        let record = record?;
        let row: Vec<&str> = record.iter().collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    Ok(out)
}

// ============ EPUB ============

const XHTML_MEDIA_TYPES: [&str; 2] = ["application/xhtml+xml", "text/html"];

fn extract_epub(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let documents = epub_document_paths(&mut archive)?;

    let mut out = String::new();
    for path in documents {
        let xml = read_zip_entry_bounded(&mut archive, &path)?;
        let text = strip_markup(&xml)?;
        let text = text.trim();
        if !text.is_empty() {
            out.push_str(text);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Content document paths in reading order.
///
/// Follows `META-INF/container.xml` to the package document and reads its
/// spine; falls back to every `.xhtml`/`.html` entry in name order when the
/// package metadata is missing.
fn epub_document_paths(archive: &mut Archive<'_>) -> Result<Vec<String>, ConvertError> {
    let opf_path = if archive.file_names().any(|n| n == "META-INF/container.xml") {
        let container = read_zip_entry_bounded(archive, "META-INF/container.xml")?;
        find_rootfile(&container)?
    } else {
        None
    };

    if let Some(opf_path) = opf_path {
        let opf = read_zip_entry_bounded(archive, &opf_path)?;
        let base = match opf_path.rfind('/') {
            Some(pos) => &opf_path[..=pos],
            None => "",
        };
        let docs: Vec<String> = parse_package(&opf)?
            .into_iter()
            .map(|href| format!("{}{}", base, href))
            .filter(|p| archive.file_names().any(|n| n == p))
            .collect();
        if !docs.is_empty() {
            return Ok(docs);
        }
    }

    let mut docs: Vec<String> = archive
        .file_names()
        .filter(|n| n.ends_with(".xhtml") || n.ends_with(".html") || n.ends_with(".htm"))
        .map(|s| s.to_string())
        .collect();
    docs.sort();
    Ok(docs)
}

fn find_rootfile(container: &[u8]) -> Result<Option<String>, ConvertError> {
    let mut reader = xml_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"rootfile" => {
                return Ok(attr_value(&e, b"full-path"));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

/// Hrefs of XHTML documents, in spine order when a spine exists.
fn parse_package(opf: &[u8]) -> Result<Vec<String>, ConvertError> {
    let mut manifest: Vec<(String, String)> = Vec::new();
    let mut media: HashMap<String, String> = HashMap::new();
    let mut spine: Vec<String> = Vec::new();

    let mut reader = xml_reader(opf);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attr_value(&e, b"id"), attr_value(&e, b"href")) {
                        let media_type = attr_value(&e, b"media-type").unwrap_or_default();
                        media.insert(id.clone(), media_type);
                        manifest.push((id, href));
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr_value(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let is_document = |id: &str| {
        media
            .get(id)
            .map(|m| XHTML_MEDIA_TYPES.contains(&m.as_str()))
            .unwrap_or(false)
    };
    let href_of: HashMap<&str, &str> = manifest
        .iter()
        .map(|(id, href)| (id.as_str(), href.as_str()))
        .collect();

    let ordered: Vec<String> = if spine.is_empty() {
        manifest
            .iter()
            .filter(|(id, _)| is_document(id))
            .map(|(_, href)| href.clone())
            .collect()
    } else {
        spine
            .iter()
            .filter(|id| is_document(id))
            .filter_map(|id| href_of.get(id.as_str()).map(|h| h.to_string()))
            .collect()
    };

    Ok(ordered
        .into_iter()
        .map(|href| {
            percent_encoding::percent_decode_str(&href)
                .decode_utf8_lossy()
                .into_owned()
        })
        .collect())
}

const BLOCK_TAGS: [&[u8]; 12] = [
    b"p", b"div", b"br", b"li", b"tr", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"section",
];

/// Visible text of an (X)HTML document; `script` and `style` are dropped and
/// block elements end a line.
fn strip_markup(xml: &[u8]) -> Result<String, ConvertError> {
    let mut out = String::new();
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if matches!(e.local_name().as_ref(), b"script" | b"style" | b"head") {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style" | b"head") {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if BLOCK_TAGS.contains(&name.as_ref()) && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"br" {
                    out.push('\n');
                }
            }
            Ok(Event::Text(te)) if skip_depth == 0 => {
                let text = text_of(&te);
                if !text.trim().is_empty() {
                    out.push_str(&text);
                }
            }
            Ok(Event::CData(cd)) if skip_depth == 0 => {
                out.push_str(&String::from_utf8_lossy(&cd));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal documents shared by conversion, loader, and ingestion tests.

    use std::io::Write;

    pub fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        zip_with(&[("word/document.xml", &xml)])
    }

    pub fn xlsx() -> Vec<u8> {
        let shared = "<?xml version=\"1.0\"?><sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><si><t>region</t></si><si><t>revenue</t></si><si><t>north</t></si></sst>";
        let sheet = "<?xml version=\"1.0\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>\
            <row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"s\"><v>1</v></c></row>\
            <row r=\"2\"><c r=\"A2\" t=\"s\"><v>2</v></c><c r=\"B2\"><v>1200</v></c></row>\
            </sheetData></worksheet>";
        zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ])
    }

    pub fn epub() -> Vec<u8> {
        let container = "<?xml version=\"1.0\"?><container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\"><rootfiles><rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/></rootfiles></container>";
        let opf = "<?xml version=\"1.0\"?><package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\"><manifest>\
            <item id=\"c2\" href=\"chapter2.xhtml\" media-type=\"application/xhtml+xml\"/>\
            <item id=\"c1\" href=\"chapter1.xhtml\" media-type=\"application/xhtml+xml\"/>\
            <item id=\"css\" href=\"style.css\" media-type=\"text/css\"/>\
            </manifest><spine><itemref idref=\"c1\"/><itemref idref=\"c2\"/></spine></package>";
        let ch1 = "<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>Colophon</title><style>p { color: red; }</style></head><body><h1>Chapter One</h1><p>The lighthouse keeper woke early.</p></body></html>";
        let ch2 = "<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>Chapter two begins<br/>at dawn.</p></body></html>";
        zip_with(&[
            ("mimetype", "application/epub+zip"),
            ("META-INF/container.xml", container),
            ("OEBPS/content.opf", opf),
            ("OEBPS/chapter1.xhtml", ch1),
            ("OEBPS/chapter2.xhtml", ch2),
            ("OEBPS/style.css", "p { color: red; }"),
        ])
    }
}
