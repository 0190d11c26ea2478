//! Attachment download. Text files are read so the model can see them;
//! everything else is described by name and type only.

use serenity::model::channel::Attachment;
use tracing::{debug, warn};

use crate::model::{AttachmentBody, AttachmentInfo};

/// Content types that are never worth downloading.
fn is_binary_type(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or("").trim();
    ct.starts_with("image/")
        || ct.starts_with("audio/")
        || ct.starts_with("video/")
        || ct.starts_with("font/")
        || matches!(
            ct,
            "application/octet-stream"
                | "application/pdf"
                | "application/zip"
                | "application/gzip"
                | "application/x-tar"
                | "application/x-7z-compressed"
        )
}

/// Fetch every attachment of a message. Never fails: a file that cannot be
/// read becomes [`AttachmentBody::Unavailable`].
pub async fn fetch_all(
    client: &reqwest::Client,
    attachments: &[Attachment],
    max_bytes: u64,
) -> Vec<AttachmentInfo> {
    let mut out = Vec::with_capacity(attachments.len());
    for att in attachments {
        let body = fetch_body(client, att, max_bytes).await;
        out.push(AttachmentInfo {
            filename: att.filename.clone(),
            content_type: att.content_type.clone(),
            size: att.size,
            body,
        });
    }
    out
}

async fn fetch_body(client: &reqwest::Client, att: &Attachment, max_bytes: u64) -> AttachmentBody {
    if att.content_type.as_deref().is_some_and(is_binary_type) {
        return AttachmentBody::Binary;
    }
    if u64::from(att.size) > max_bytes {
        debug!(filename = %att.filename, size = att.size, "attachment over size limit");
        return AttachmentBody::Unavailable;
    }

    match download(client, &att.url).await {
        Ok(bytes) => decode(bytes),
        Err(e) => {
            warn!(filename = %att.filename, error = %e, "failed to download attachment");
            AttachmentBody::Unavailable
        }
    }
}

/// Download a small file (session cards, text attachments).
pub async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, reqwest::Error> {
    let resp = client.get(url).send().await?.error_for_status()?;
    resp.bytes().await.map(|b| b.to_vec())
}

fn decode(bytes: Vec<u8>) -> AttachmentBody {
    match String::from_utf8(bytes) {
        Ok(text) => AttachmentBody::Text(text),
        Err(_) => AttachmentBody::Binary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_types() {
        assert!(is_binary_type("image/png"));
        assert!(is_binary_type("application/pdf"));
        assert!(!is_binary_type("text/plain; charset=utf-8"));
        assert!(!is_binary_type("application/json"));
    }

    #[test]
    fn utf8_decides_text_or_binary() {
        assert_eq!(decode(b"fn main() {}".to_vec()), AttachmentBody::Text("fn main() {}".into()));
        assert_eq!(decode(vec![0xff, 0xfe, 0x00]), AttachmentBody::Binary);
    }
}
