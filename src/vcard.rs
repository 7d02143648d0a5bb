//! vCard 3.0 export used where the address-book API path is not taken.
//!
//! Lines are folded the legacy way: the photo payload fills the first physical
//! line up to 75 characters and every continuation line is a single space
//! followed by 74 payload characters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::model::{ContactRecord, SocialEntry};
use crate::photo::{decode_data_uri, PhotoError, PhotoSource};

pub const VCARD_MIME: &str = "text/vcard";
const LINE_WIDTH: usize = 75;
const CONTINUATION_WIDTH: usize = LINE_WIDTH - 1;

/// `(platform key, label, profile url prefix)`
const SOCIAL_PLATFORMS: &[(&str, &str, &str)] = &[
    ("instagram", "Instagram", "https://instagram.com/"),
    ("twitter", "Twitter", "https://x.com/"),
    ("x", "Twitter", "https://x.com/"),
    ("linkedin", "LinkedIn", "https://www.linkedin.com/in/"),
    ("facebook", "Facebook", "https://facebook.com/"),
    ("tiktok", "TikTok", "https://www.tiktok.com/@"),
    ("snapchat", "Snapchat", "https://www.snapchat.com/add/"),
    ("github", "GitHub", "https://github.com/"),
    ("youtube", "YouTube", "https://www.youtube.com/@"),
    ("threads", "Threads", "https://www.threads.net/@"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoEmbedding {
    Absent,
    Inline,
    InlineFromDataUri,
    UriReference,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortableContactDocument {
    lines: Vec<String>,
    photo: PhotoEmbedding,
}

impl PortableContactDocument {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn photo(&self) -> PhotoEmbedding {
        self.photo
    }

    pub fn to_text(&self) -> String {
        let mut text = self.lines.join("\r\n");
        text.push_str("\r\n");
        text
    }
}

/// Receives an exported document, standing in for the platform share sheet.
pub trait DocumentOpener: Send + Sync {
    /// Returns where the document ended up.
    fn open_document(&self, file_name: &str, mime: &str, contents: &str) -> AppResult<String>;
}

pub struct FileDocumentOpener {
    directory: PathBuf,
}

impl FileDocumentOpener {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }
}

impl DocumentOpener for FileDocumentOpener {
    fn open_document(&self, file_name: &str, mime: &str, contents: &str) -> AppResult<String> {
        fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(file_name);
        fs::write(&path, contents)?;
        debug!(target: "vcard", path = %path.display(), mime, "document written");
        Ok(path.to_string_lossy().to_string())
    }
}

#[derive(Clone)]
pub struct PortableDocumentGenerator {
    photos: Arc<dyn PhotoSource>,
    soft_limit: usize,
    hard_limit: usize,
}

impl PortableDocumentGenerator {
    pub fn new(config: &AppConfig, photos: Arc<dyn PhotoSource>) -> Self {
        Self {
            photos,
            soft_limit: config.photo_soft_limit_bytes,
            hard_limit: config.photo_hard_limit_bytes,
        }
    }

    /// Always produces a document; photo problems only degrade the photo block.
    pub async fn generate(&self, record: &ContactRecord) -> PortableContactDocument {
        let (family, given) = record.name_parts();
        let mut lines = vec![
            "BEGIN:VCARD".to_string(),
            "VERSION:3.0".to_string(),
            format!("FN:{}", escape_text(&record.display_name)),
            format!("N:{};{};;;", escape_text(&family), escape_text(&given)),
        ];
        if let Some(phone) = non_empty(record.phone.as_deref()) {
            lines.push(format!("TEL;TYPE=CELL:{}", escape_text(phone)));
        }
        if let Some(email) = non_empty(record.email.as_deref()) {
            lines.push(format!("EMAIL;TYPE=INTERNET:{}", escape_text(email)));
        }

        let photo = match non_empty(record.photo_url.as_deref()) {
            Some(url) => self.photo_block(url, &mut lines).await,
            None => PhotoEmbedding::Absent,
        };

        for entry in &record.socials {
            if entry.handle.trim().is_empty() {
                continue;
            }
            lines.push(format!(
                "X-SOCIALPROFILE;TYPE={}:{}",
                social_label(&entry.platform),
                strip_breaks(&social_profile_url(entry))
            ));
        }
        if let Some(bio) = non_empty(record.bio.as_deref()) {
            lines.push(format!("NOTE:{}", escape_text(bio)));
        }
        lines.push("END:VCARD".to_string());

        PortableContactDocument { lines, photo }
    }

    async fn photo_block(&self, url: &str, lines: &mut Vec<String>) -> PhotoEmbedding {
        let direct = self
            .photos
            .fetch_bytes(url)
            .await
            .and_then(|bytes| self.inline_lines(&bytes));
        match direct {
            Ok(block) => {
                lines.extend(block);
                return PhotoEmbedding::Inline;
            }
            Err(err @ PhotoError::TooLarge { .. }) => return self.skip(err),
            Err(err) => {
                warn!(target: "vcard", error = %err, "photo fetch failed; retrying as data uri")
            }
        }

        let from_data_uri = match self.photos.fetch_data_uri(url).await {
            Ok(uri) => decode_data_uri(&uri).and_then(|(_, bytes)| self.inline_lines(&bytes)),
            Err(err) => Err(err),
        };
        match from_data_uri {
            Ok(block) => {
                lines.extend(block);
                return PhotoEmbedding::InlineFromDataUri;
            }
            Err(err @ PhotoError::TooLarge { .. }) => return self.skip(err),
            Err(err) => {
                warn!(target: "vcard", error = %err, "data uri photo failed; referencing url")
            }
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            lines.push(format!("PHOTO;VALUE=URI:{}", strip_breaks(url)));
            PhotoEmbedding::UriReference
        } else {
            PhotoEmbedding::Skipped
        }
    }

    fn inline_lines(&self, bytes: &[u8]) -> Result<Vec<String>, PhotoError> {
        if bytes.is_empty() {
            return Err(PhotoError::Empty);
        }
        if bytes.len() > self.hard_limit {
            return Err(PhotoError::TooLarge {
                bytes: bytes.len(),
                limit: self.hard_limit,
            });
        }
        if bytes.len() > self.soft_limit {
            warn!(
                target: "vcard",
                bytes = bytes.len(),
                soft_limit = self.soft_limit,
                "embedding large photo; some readers may truncate it"
            );
        }
        let prefix = format!("PHOTO;ENCODING=b;TYPE={}:", image_type(bytes));
        Ok(fold_photo_line(&prefix, &STANDARD.encode(bytes)))
    }

    fn skip(&self, err: PhotoError) -> PhotoEmbedding {
        warn!(target: "vcard", error = %err, "leaving photo out of document");
        PhotoEmbedding::Skipped
    }
}

/// Folds `prefix + payload` into physical lines of at most 75 characters.
/// `payload` must be ASCII, which base64 always is.
pub fn fold_photo_line(prefix: &str, payload: &str) -> Vec<String> {
    let first_len = LINE_WIDTH.saturating_sub(prefix.len()).min(payload.len());
    let (head, mut rest) = payload.split_at(first_len);
    let mut lines = vec![format!("{prefix}{head}")];
    while !rest.is_empty() {
        let take = CONTINUATION_WIDTH.min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        lines.push(format!(" {chunk}"));
        rest = tail;
    }
    lines
}

pub fn social_profile_url(entry: &SocialEntry) -> String {
    let handle = entry.handle.trim();
    if handle.starts_with("http://") || handle.starts_with("https://") {
        return handle.to_string();
    }
    let handle = handle.trim_start_matches('@');
    let key = entry.platform.trim().to_lowercase();
    SOCIAL_PLATFORMS
        .iter()
        .find(|(platform, _, _)| *platform == key)
        .map(|(_, _, base)| format!("{base}{handle}"))
        .unwrap_or_else(|| handle.to_string())
}

fn social_label(platform: &str) -> String {
    let key = platform.trim().to_lowercase();
    SOCIAL_PLATFORMS
        .iter()
        .find(|(candidate, _, _)| *candidate == key)
        .map(|(_, label, _)| label.to_string())
        .unwrap_or_else(|| {
            key.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect()
        })
}

pub fn file_name_for(record: &ContactRecord) -> String {
    let slug: String = record
        .display_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "contact.vcf".to_string()
    } else {
        format!("{slug}.vcf")
    }
}

fn image_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "PNG"
    } else if bytes.starts_with(b"GIF8") {
        "GIF"
    } else {
        "JPEG"
    }
}

fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ',' => escaped.push_str("\\,"),
            ';' => escaped.push_str("\\;"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                escaped.push_str("\\n");
            }
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn strip_breaks(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPhotos;

    fn record(photo_url: Option<&str>) -> ContactRecord {
        ContactRecord {
            subject_id: "subject-1".into(),
            display_name: "Ada Lovelace".into(),
            phone: Some("+44 20 7946 0000".into()),
            email: Some("ada@example.com".into()),
            socials: vec![
                SocialEntry {
                    platform: "Instagram".into(),
                    handle: "@ada".into(),
                },
                SocialEntry {
                    platform: "mastodon".into(),
                    handle: "https://hachyderm.io/@ada".into(),
                },
            ],
            bio: Some("Analyst; poet, engineer\nLondon".into()),
            photo_url: photo_url.map(str::to_string),
        }
    }

    fn generator(photos: ScriptedPhotos) -> PortableDocumentGenerator {
        let config = AppConfig::for_origin("https://app.example");
        PortableDocumentGenerator::new(&config, Arc::new(photos))
    }

    #[test]
    fn folds_photo_payload_at_legacy_widths() {
        let prefix = "PHOTO;ENCODING=b;TYPE=JPEG:";
        assert_eq!(prefix.len(), 27);
        let payload = "A".repeat(300);
        let lines = fold_photo_line(prefix, &payload);

        assert_eq!(lines[0].len(), 75);
        let (last, middle) = lines[1..].split_last().unwrap();
        for line in middle {
            assert_eq!(line.len(), 75);
            assert!(line.starts_with(' '));
        }
        assert!(last.len() <= 75 && last.starts_with(' '));
        let rejoined: String = lines
            .iter()
            .enumerate()
            .map(|(i, line)| if i == 0 { &line[prefix.len()..] } else { &line[1..] })
            .collect();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn png_prefix_keeps_the_same_line_width() {
        let prefix = "PHOTO;ENCODING=b;TYPE=PNG:";
        let lines = fold_photo_line(prefix, &"B".repeat(200));
        assert_eq!(lines[0].len(), 75);
        assert_eq!(lines[0].len() - prefix.len(), 49);
        assert_eq!(lines[1].len(), 75);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], format!(" {}", "B".repeat(3)));
    }

    #[test]
    fn short_payload_stays_on_one_line() {
        assert_eq!(fold_photo_line("PHOTO:", "abc"), vec!["PHOTO:abc".to_string()]);
    }

    #[tokio::test]
    async fn builds_document_without_photo() {
        let document = generator(ScriptedPhotos::default()).generate(&record(None)).await;
        let lines = document.lines();
        assert_eq!(lines.first().map(String::as_str), Some("BEGIN:VCARD"));
        assert_eq!(lines.last().map(String::as_str), Some("END:VCARD"));
        assert!(lines.contains(&"N:Lovelace;Ada;;;".to_string()));
        assert!(lines.contains(&"X-SOCIALPROFILE;TYPE=Instagram:https://instagram.com/ada".to_string()));
        assert!(lines.contains(&"X-SOCIALPROFILE;TYPE=mastodon:https://hachyderm.io/@ada".to_string()));
        assert!(lines.contains(&"NOTE:Analyst\\; poet\\, engineer\\nLondon".to_string()));
        assert_eq!(document.photo(), PhotoEmbedding::Absent);
        assert!(document.to_text().ends_with("END:VCARD\r\n"));
    }

    #[tokio::test]
    async fn embeds_photo_bytes() {
        let photos = ScriptedPhotos::with_bytes(Ok(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]));
        let document = generator(photos)
            .generate(&record(Some("https://cdn.example/ada.jpg")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::Inline);
        assert!(document
            .lines()
            .iter()
            .any(|line| line.starts_with("PHOTO;ENCODING=b;TYPE=JPEG:/9j/4AECAw")));
    }

    #[tokio::test]
    async fn oversized_photo_is_left_out() {
        let photos = ScriptedPhotos::with_bytes(Err(PhotoError::TooLarge {
            bytes: 2 * 1024 * 1024,
            limit: 1024 * 1024,
        }));
        let document = generator(photos.clone())
            .generate(&record(Some("https://cdn.example/huge.jpg")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::Skipped);
        assert!(!document.lines().iter().any(|line| line.starts_with("PHOTO")));
        assert_eq!(photos.data_uri_calls(), 0);
    }

    #[tokio::test]
    async fn oversized_bytes_from_source_are_left_out() {
        let photos = ScriptedPhotos::with_bytes(Ok(vec![7_u8; 1024 * 1024 + 1]));
        let document = generator(photos)
            .generate(&record(Some("https://cdn.example/huge.jpg")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::Skipped);
        assert!(!document.to_text().contains("PHOTO"));
    }

    #[tokio::test]
    async fn photo_between_soft_and_hard_limits_is_embedded() {
        let photos = ScriptedPhotos::with_bytes(Ok(vec![0xFF; 300 * 1024]));
        let document = generator(photos.clone())
            .generate(&record(Some("https://cdn.example/large.jpg")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::Inline);
        let photo_lines = document
            .lines()
            .iter()
            .skip_while(|line| !line.starts_with("PHOTO;ENCODING=b;TYPE=JPEG:"))
            .take_while(|line| line.starts_with("PHOTO") || line.starts_with(' '))
            .count();
        assert!(photo_lines > 1);
        assert_eq!(photos.data_uri_calls(), 0);
    }

    #[tokio::test]
    async fn empty_photo_bytes_fall_through_to_later_tiers() {
        let photos = ScriptedPhotos::with_bytes(Ok(Vec::new()))
            .and_data_uri(Ok("data:image/gif;base64,R0lGODlh".into()));
        let document = generator(photos.clone())
            .generate(&record(Some("https://cdn.example/ada.gif")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::InlineFromDataUri);
        assert_eq!(photos.data_uri_calls(), 1);

        let photos = ScriptedPhotos::with_bytes(Ok(Vec::new()));
        let document = generator(photos)
            .generate(&record(Some("https://cdn.example/ada.gif")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::UriReference);
    }

    #[tokio::test]
    async fn falls_back_to_data_uri_then_url_reference() {
        let photos = ScriptedPhotos::with_bytes(Err(PhotoError::Timeout))
            .and_data_uri(Ok("data:image/png;base64,iVBORw0KGgo=".into()));
        let document = generator(photos)
            .generate(&record(Some("https://cdn.example/ada.png")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::InlineFromDataUri);
        assert!(document
            .lines()
            .iter()
            .any(|line| line.starts_with("PHOTO;ENCODING=b;TYPE=PNG:")));

        let photos = ScriptedPhotos::with_bytes(Err(PhotoError::Http("502".into())))
            .and_data_uri(Err(PhotoError::Http("502".into())));
        let document = generator(photos)
            .generate(&record(Some("https://cdn.example/ada.png")))
            .await;
        assert_eq!(document.photo(), PhotoEmbedding::UriReference);
        assert!(document
            .lines()
            .contains(&"PHOTO;VALUE=URI:https://cdn.example/ada.png".to_string()));
    }

    #[test]
    fn file_names_are_slugged() {
        assert_eq!(file_name_for(&record(None)), "ada-lovelace.vcf");
        let mut unnamed = record(None);
        unnamed.display_name = "  ??? ".into();
        assert_eq!(file_name_for(&unnamed), "contact.vcf");
    }

    #[test]
    fn file_opener_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FileDocumentOpener::new(dir.path().join("exports"));
        let location = opener
            .open_document("ada.vcf", VCARD_MIME, "BEGIN:VCARD\r\nEND:VCARD\r\n")
            .unwrap();
        let written = fs::read_to_string(location).unwrap();
        assert!(written.starts_with("BEGIN:VCARD"));
    }
}
