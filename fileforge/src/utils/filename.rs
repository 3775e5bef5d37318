//! File name handling for client-supplied names and generated outputs.
//!
//! Client file names only ever reach the filesystem as part of generated
//! output names and the `Content-Disposition` header; artifacts themselves are
//! stored under server-chosen identifiers.

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Upper bound for a sanitized name, in characters.
const MAX_NAME_CHARS: usize = 180;

/// Sanitize a client-supplied file name.
///
/// Control characters and path separators collapse into a single `_`,
/// leading/trailing spaces and dots are trimmed, Windows reserved names get a
/// `_` prefix and an empty result becomes `"unnamed"`.
///
/// ```
/// use fileforge::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
/// assert_eq!(sanitize_filename("report?.pdf"), "report_.pdf");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars().take(MAX_NAME_CHARS) {
        if c.is_control() || WINDOWS_INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let stem_upper = trimmed
        .split('.')
        .next()
        .unwrap_or(trimmed)
        .to_uppercase();
    if WINDOWS_RESERVED_NAMES.contains(&stem_upper.as_str()) {
        return format!("_{}", trimmed);
    }

    trimmed.to_string()
}

/// Lowercased extension of a file name, without the dot.
pub fn file_extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains(['/', '\\']) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File name without its extension.
pub fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Name presented to the client for the `index`-th of `total` outputs.
///
/// `report.txt` converted to `gz` becomes `report.gz`; multi-output
/// conversions number their parts from 1 (`report-part1.txt`).
pub fn output_file_name(original: &str, extension: &str, index: usize, total: usize) -> String {
    let stem = file_stem(&sanitize_filename(original)).to_string();
    let name = if total > 1 {
        format!("{}-part{}", stem, index + 1)
    } else {
        stem
    };

    if extension.is_empty() {
        name
    } else {
        format!("{}.{}", name, extension.trim_start_matches('.'))
    }
}

/// Build a `Content-Disposition: attachment` header value.
///
/// Non-ASCII names get an ASCII fallback plus an RFC 5987 `filename*`.
pub fn content_disposition(name: &str) -> String {
    let sanitized = sanitize_filename(name);
    let ascii: String = sanitized
        .chars()
        .map(|c| if c.is_ascii() && c != '"' { c } else { '_' })
        .collect();

    if ascii == sanitized {
        format!("attachment; filename=\"{}\"", ascii)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            ascii,
            urlencoding::encode(&sanitized)
        )
    }
}
