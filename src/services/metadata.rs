use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use std::io::Read;
use utoipa::ToSchema;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    Txt,
    Epub,
    Pdf,
}

impl BookFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_lowercase().as_str() {
            "txt" => Some(BookFormat::Txt),
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            BookFormat::Txt => "text/plain",
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct BookMetadata {
    pub mime_type: String,
    pub size_bytes: u64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<u32>,
    pub line_count: Option<u32>,
    pub word_count: Option<u32>,
    pub is_encrypted: bool,
}

pub struct MetadataService;

impl MetadataService {
    /// Checks that the content really is the format its extension claims.
    pub fn detect_format(bytes: &[u8], filename: &str) -> Result<BookFormat, String> {
        let extension = filename.rsplit('.').next().unwrap_or("");
        let claimed = BookFormat::from_extension(extension)
            .ok_or_else(|| format!("unsupported extension '{}'", extension))?;

        if bytes.is_empty() {
            return Err("file is empty".to_string());
        }

        let detected = infer::get(bytes).map(|k| k.mime_type());
        let ok = match claimed {
            BookFormat::Pdf => detected == Some("application/pdf"),
            // Some packagers omit the leading mimetype entry
            BookFormat::Epub => matches!(
                detected,
                Some("application/epub+zip") | Some("application/zip")
            ),
            BookFormat::Txt => std::str::from_utf8(bytes).is_ok(),
        };

        if ok {
            Ok(claimed)
        } else {
            Err(format!(
                "content does not match .{} (detected {})",
                extension,
                detected.unwrap_or("unknown binary")
            ))
        }
    }

    pub fn analyze(bytes: &[u8], format: BookFormat) -> BookMetadata {
        let mut meta = BookMetadata {
            mime_type: format.mime_type().to_string(),
            size_bytes: bytes.len() as u64,
            ..Default::default()
        };

        match format {
            BookFormat::Pdf => Self::analyze_pdf(bytes, &mut meta),
            BookFormat::Epub => Self::analyze_epub(bytes, &mut meta),
            BookFormat::Txt => Self::analyze_text(bytes, &mut meta),
        }
        meta
    }

    fn analyze_pdf(bytes: &[u8], meta: &mut BookMetadata) {
        match lopdf::Document::load_mem(bytes) {
            Ok(doc) => {
                meta.page_count = Some(doc.get_pages().len() as u32);

                if let Ok(info_dict) = doc
                    .trailer
                    .get(b"Info")
                    .and_then(|info| info.as_reference())
                    .and_then(|id| doc.get_object(id))
                    .and_then(|obj| obj.as_dict())
                {
                    for (key, val) in info_dict.iter() {
                        let Ok(s) = val.as_str() else { continue };
                        let value = String::from_utf8_lossy(s).trim().to_string();
                        if value.is_empty() {
                            continue;
                        }
                        match key.as_slice() {
                            b"Title" => meta.title = Some(value),
                            b"Author" => meta.author = Some(value),
                            _ => {}
                        }
                    }
                }
            }
            Err(e) => {
                let err_msg = e.to_string().to_lowercase();
                if err_msg.contains("password") || err_msg.contains("encrypted") {
                    meta.is_encrypted = true;
                }
            }
        }
    }

    fn analyze_epub(bytes: &[u8], meta: &mut BookMetadata) {
        let Ok(mut archive) = ZipArchive::new(std::io::Cursor::new(bytes)) else {
            return;
        };

        let opf_path = read_entry(&mut archive, "META-INF/container.xml")
            .and_then(|xml| rootfile_path(&xml))
            .unwrap_or_else(|| "OEBPS/content.opf".to_string());

        let Some(opf) = read_entry(&mut archive, &opf_path) else {
            return;
        };

        let mut reader = Reader::from_str(&opf);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut current_tag = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                }
                Ok(Event::End(_)) => current_tag.clear(),
                Ok(Event::Text(e)) => {
                    let txt = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                    if txt.is_empty() {
                        continue;
                    }
                    if current_tag.ends_with(":title") && meta.title.is_none() {
                        meta.title = Some(txt);
                    } else if current_tag.ends_with(":creator") && meta.author.is_none() {
                        meta.author = Some(txt);
                    } else if current_tag.ends_with(":language") && meta.language.is_none() {
                        meta.language = Some(txt);
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => (),
            }
            buf.clear();
        }

        meta.page_count = Some(
            archive
                .file_names()
                .filter(|n| n.ends_with(".xhtml") || n.ends_with(".html"))
                .count() as u32,
        );
    }

    fn analyze_text(bytes: &[u8], meta: &mut BookMetadata) {
        let text = String::from_utf8_lossy(bytes);
        meta.line_count = Some(text.lines().count() as u32);
        meta.word_count = Some(text.split_whitespace().count() as u32);
        meta.title = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.chars().take(120).collect());
    }

    /// Plain text of an EPUB's content documents, in archive order.
    pub fn epub_text(bytes: &[u8]) -> Result<String, String> {
        let mut archive =
            ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
        let mut names: Vec<String> = archive
            .file_names()
            .filter(|n| n.ends_with(".xhtml") || n.ends_with(".html") || n.ends_with(".htm"))
            .map(str::to_string)
            .collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            if let Some(xml) = read_entry(&mut archive, &name) {
                out.push_str(&markup_text(&xml));
                out.push('\n');
            }
        }
        Ok(out)
    }
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<String> {
    let mut file = archive.by_name(name).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    Some(content)
}

fn rootfile_path(container_xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(container_xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"rootfile" => {
                return e
                    .attributes()
                    .filter_map(|a| a.ok())
                    .find(|a| a.key.as_ref() == b"full-path")
                    .map(|a| String::from_utf8_lossy(&a.value).to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => (),
        }
        buf.clear();
    }
}

fn markup_text(xml: &str) -> String {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut parts = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => {
                let txt = String::from_utf8_lossy(e.as_ref()).to_string();
                if !txt.is_empty() {
                    parts.push(txt);
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => (),
        }
        buf.clear();
    }
    parts.join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn sample_epub() -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let stored = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file("mimetype", stored).unwrap();
            zip.write_all(b"application/epub+zip").unwrap();
            zip.start_file("META-INF/container.xml", stored).unwrap();
            zip.write_all(
                br#"<?xml version="1.0"?><container><rootfiles><rootfile full-path="OEBPS/book.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#,
            )
            .unwrap();
            zip.start_file("OEBPS/book.opf", stored).unwrap();
            zip.write_all(
                br#"<package><metadata><dc:title>Moby Dick</dc:title><dc:creator>Herman Melville</dc:creator><dc:language>en</dc:language></metadata></package>"#,
            )
            .unwrap();
            zip.start_file("OEBPS/ch1.xhtml", stored).unwrap();
            zip.write_all(b"<html><body><p>Call me Ishmael.</p></body></html>")
                .unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(
            MetadataService::detect_format(b"hello world", "a.txt").unwrap(),
            BookFormat::Txt
        );
        assert_eq!(
            MetadataService::detect_format(&sample_epub(), "a.epub").unwrap(),
            BookFormat::Epub
        );
        assert!(MetadataService::detect_format(&[0xff, 0xfe, 0x00, 0xd8], "a.txt").is_err());
        assert!(MetadataService::detect_format(b"plain text", "a.pdf").is_err());
        assert!(MetadataService::detect_format(b"", "a.txt").is_err());
        assert!(MetadataService::detect_format(b"x", "a.exe").is_err());
    }

    #[test]
    fn test_analyze_text() {
        let meta = MetadataService::analyze(b"\n  The Title  \nsecond line here\n", BookFormat::Txt);
        assert_eq!(meta.title.as_deref(), Some("The Title"));
        assert_eq!(meta.word_count, Some(5));
        assert_eq!(meta.line_count, Some(3));
        assert_eq!(meta.mime_type, "text/plain");
    }

    #[test]
    fn test_analyze_epub() {
        let meta = MetadataService::analyze(&sample_epub(), BookFormat::Epub);
        assert_eq!(meta.title.as_deref(), Some("Moby Dick"));
        assert_eq!(meta.author.as_deref(), Some("Herman Melville"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.page_count, Some(1));
    }

    #[test]
    fn test_epub_text() {
        let text = MetadataService::epub_text(&sample_epub()).unwrap();
        assert!(text.contains("Call me Ishmael."));
    }

    #[test]
    fn test_broken_pdf_yields_basic_metadata() {
        let meta = MetadataService::analyze(b"%PDF-1.4 truncated", BookFormat::Pdf);
        assert_eq!(meta.mime_type, "application/pdf");
        assert_eq!(meta.page_count, None);
    }
}
