//! Attachment download into a scratch directory.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::slack::api::ChatApi;

/// Largest attachment accepted, in bytes.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// A file attached to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundFile {
    /// Name as uploaded.
    pub name: String,
    /// MIME type reported by the platform.
    pub mimetype: Option<String>,
    /// Private download URL.
    pub url: Option<String>,
}

/// A file written to the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Name as uploaded.
    pub original_name: String,
    /// Where it was written.
    pub path: PathBuf,
    /// MIME type reported by the platform.
    pub mimetype: String,
}

impl SavedFile {
    /// Whether the file is an image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.mimetype.starts_with("image/")
    }
}

/// Reduce an uploaded name to a bare file name.
///
/// Directory components are dropped, so `../../etc/passwd` becomes
/// `passwd`. Names that end up empty or made only of dots become
/// `attachment`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let unified = name.replace('\\', "/");
    let base = unified.rsplit('/').next().unwrap_or_default().trim();
    if base.is_empty() || base.chars().all(|c| c == '.') {
        "attachment".to_owned()
    } else {
        base.to_owned()
    }
}

async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let mut counter = 1_u32;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{ext}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}

/// Download every usable attachment into `target_dir`.
///
/// Files without a URL, over [`MAX_FILE_SIZE`], answered with an HTML page,
/// or failing to download are skipped with a warning.
pub async fn download_all(
    chat: &dyn ChatApi,
    files: &[InboundFile],
    target_dir: &Path,
) -> Vec<SavedFile> {
    if files.is_empty() {
        return Vec::new();
    }
    if let Err(err) = tokio::fs::create_dir_all(target_dir).await {
        warn!(%err, dir = %target_dir.display(), "could not create attachment dir");
        return Vec::new();
    }

    let mut saved = Vec::new();
    for file in files {
        let Some(url) = file.url.as_deref() else {
            warn!(name = %file.name, "attachment has no download url; skipped");
            continue;
        };
        let download = match chat.download_file(url, MAX_FILE_SIZE).await {
            Ok(download) => download,
            Err(err) => {
                warn!(%err, name = %file.name, "attachment download failed");
                continue;
            }
        };
        if download
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/html"))
        {
            warn!(name = %file.name, "attachment returned html instead of file data; skipped");
            continue;
        }
        let path = unique_path(target_dir, &sanitize_filename(&file.name)).await;
        if let Err(err) = tokio::fs::write(&path, &download.bytes).await {
            warn!(%err, path = %path.display(), "could not write attachment");
            continue;
        }
        info!(name = %file.name, bytes = download.bytes.len(), path = %path.display(), "attachment saved");
        saved.push(SavedFile {
            original_name: file.name.clone(),
            path,
            mimetype: file
                .mimetype
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_owned()),
        });
    }
    saved
}

/// Prompt note pointing the agent at saved attachments.
#[must_use]
pub fn attachment_note(files: &[SavedFile]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let lines: Vec<String> = files
        .iter()
        .map(|file| {
            let kind = if file.is_image() { "Image" } else { "File" };
            format!(
                "- {kind}: {} (original name: {})",
                file.path.display(),
                file.original_name
            )
        })
        .collect();
    Some(format!(
        "The user attached files. Use the Read tool to inspect them:\n{}",
        lines.join("\n")
    ))
}

/// Append the attachment note to a prompt.
#[must_use]
pub fn with_attachments(prompt: &str, files: &[SavedFile]) -> String {
    match attachment_note(files) {
        Some(note) if prompt.is_empty() => note,
        Some(note) => format!("{prompt}\n\n{note}"),
        None => prompt.to_owned(),
    }
}
