//! Message text sent alongside delivered files.
//!
//! The layout matches what downstream reassembly tooling already parses;
//! change it only together with that tooling. Text is Telegram HTML.

use crate::{
    errors::{RelayError, RelayResult},
    models::object::ObjectIdentity,
    services::ledger::LedgerStats,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

/// Caption ceiling of the delivery endpoint, in characters.
pub const CAPTION_LIMIT: usize = 1024;

const TRUNCATION_MARKER: &str = "...";
const ETAG_PREVIEW_CHARS: usize = 16;
const SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// Human-readable size with up to two decimals: `0 Bytes`, `1.5 KB`, `120 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut index = 0;
    let mut scale = 1u64;
    while index < SIZE_UNITS.len() - 1 && bytes >= scale * 1024 {
        scale *= 1024;
        index += 1;
    }

    let rendered = format!("{:.2}", bytes as f64 / scale as f64);
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SIZE_UNITS[index])
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Caption for an object delivered as a single message.
pub fn file_caption(identity: &ObjectIdentity) -> String {
    let bucket = escape_html(&identity.bucket);
    let file_name = escape_html(identity.file_name());
    let etag_preview: String = identity.etag.chars().take(ETAG_PREVIEW_CHARS).collect();

    let caption = format!(
        "📦 Bucket: <code>{bucket}</code>\n\
         📄 File: <code>{file_name}</code>\n\
         💾 Size: {size}\n\
         🕐 Uploaded: {uploaded}\n\
         🔐 ETag: <code>{etag}...</code>",
        size = format_bytes(identity.size),
        uploaded = format_timestamp(&identity.last_modified),
        etag = escape_html(&etag_preview),
    );

    truncate_caption(caption)
}

/// Caption for part `current` of `total`, including reassembly commands.
pub fn chunk_caption(
    identity: &ObjectIdentity,
    current: u32,
    total: u32,
    chunk_size: u64,
) -> RelayResult<String> {
    if current < 1 || total < 1 || current > total || chunk_size < 1 {
        return Err(RelayError::validation(format!(
            "invalid chunk information: part {}/{} of {} bytes",
            current, total, chunk_size
        )));
    }

    let bucket = escape_html(&identity.bucket);
    let file_name = escape_html(identity.file_name());

    let caption = format!(
        "[Part {current}/{total}] <b>{bucket}/{file_name}</b>\n\
         \n\
         📦 Bucket: <code>{bucket}</code>\n\
         📄 Original File: <code>{file_name}</code>\n\
         💾 Part Size: {part_size}\n\
         📊 Total Size: {total_size}\n\
         🕐 Uploaded: {uploaded}\n\
         \n\
         🔧 Reassembly (Linux/Mac):\n\
         <code>cat {file_name}.part* &gt; {file_name}</code>\n\
         \n\
         🔧 Reassembly (Windows):\n\
         <code>copy /b {file_name}.part* {file_name}</code>",
        part_size = format_bytes(chunk_size),
        total_size = format_bytes(identity.size),
        uploaded = format_timestamp(&identity.last_modified),
    );

    Ok(truncate_caption(caption))
}

/// Cap `caption` at `CAPTION_LIMIT` characters, marking the cut.
///
/// The cut never lands inside a tag or an `&...;` entity, and tags still
/// open at the cut are closed after the marker so the result stays valid
/// HTML.
pub fn truncate_caption(caption: String) -> String {
    let length = caption.chars().count();
    if length <= CAPTION_LIMIT {
        return caption;
    }

    let marker_chars = TRUNCATION_MARKER.chars().count();
    let mut kept = String::with_capacity(caption.len());
    let mut kept_chars = 0;
    let mut open: Vec<&str> = Vec::new();

    for token in markup_tokens(&caption) {
        let token_chars = token.chars().count();
        let mut after = open.clone();
        match tag_name(token) {
            Some((name, true)) => {
                if let Some(pos) = after.iter().rposition(|tag| *tag == name) {
                    after.remove(pos);
                }
            }
            Some((name, false)) => after.push(name),
            None => {}
        }

        let needed = kept_chars + token_chars + marker_chars + closing_chars(&after);
        if needed > CAPTION_LIMIT {
            break;
        }
        kept.push_str(token);
        kept_chars += token_chars;
        open = after;
    }

    kept.push_str(TRUNCATION_MARKER);
    for name in open.iter().rev() {
        kept.push_str("</");
        kept.push_str(name);
        kept.push('>');
    }

    warn!(
        "Caption truncated from {} to {} chars",
        length,
        kept.chars().count()
    );
    kept
}

/// Splits HTML text into tags, entities and single characters.
fn markup_tokens(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;

    while let Some(first) = rest.chars().next() {
        let end = match first {
            '<' => rest.find('>').map(|i| i + 1),
            '&' => rest.find(';').filter(|&i| {
                i > 1 && rest[1..i].chars().all(|c| c.is_ascii_alphanumeric() || c == '#')
            }).map(|i| i + 1),
            _ => None,
        }
        .unwrap_or(first.len_utf8());

        let (token, tail) = rest.split_at(end);
        tokens.push(token);
        rest = tail;
    }

    tokens
}

/// `Some((name, is_closing))` when `token` is a tag.
fn tag_name(token: &str) -> Option<(&str, bool)> {
    let inner = token.strip_prefix('<')?.strip_suffix('>')?;
    let (inner, closing) = match inner.strip_prefix('/') {
        Some(name) => (name, true),
        None => (inner, false),
    };
    let name = inner.split_whitespace().next()?;
    Some((name, closing))
}

fn closing_chars(open: &[&str]) -> usize {
    open.iter().map(|name| name.chars().count() + 3).sum()
}

pub fn admin_alert(message: &str) -> String {
    format!("⚠️ <b>Admin Alert</b>\n\n{}", escape_html(message))
}

/// Periodic status report.
pub fn heartbeat(stats: &LedgerStats, window_hours: u64, next_heartbeat: &DateTime<Utc>) -> String {
    let retry_queue = if stats.retry_queue_depth > 0 {
        format!("{} pending", stats.retry_queue_depth)
    } else {
        "Empty".to_string()
    };
    let last_backup = stats
        .last_sent_at
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| "None".to_string());

    format!(
        "✅ <b>Bucket Relay Operational</b>\n\
         \n\
         📊 Last {window_hours} Hours:\n\
         • Backups Sent: {sent} files ({bytes})\n\
         • Buckets Active: {active}/{total}\n\
         • Failed Uploads: {failed}\n\
         • Retry Queue: {retry_queue}\n\
         \n\
         🔍 Last Backup: {last_backup}\n\
         \n\
         ⏰ Next heartbeat: {next}",
        sent = stats.sent_count,
        bytes = format_bytes(u64::try_from(stats.sent_bytes).unwrap_or(0)),
        active = stats.buckets_active,
        total = stats.buckets_total,
        failed = stats.failed_uploads,
        next = format_timestamp(next_heartbeat),
    )
}
