//! Decoder for `multipart/form-data` request bodies.
//!
//! Feedback submissions that carry attachments arrive as a single multipart
//! body. The decoder splits it on the boundary, reads each part's headers and
//! yields text fields and binary file parts. Any malformed part fails the
//! whole body; callers never see a partially decoded form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("missing Content-Type header")]
    MissingContentType,

    #[error("expected a multipart content type, got {0:?}")]
    NotMultipart(String),

    #[error("Content-Type has no boundary parameter")]
    MissingBoundary,

    #[error("body contains no boundary marker")]
    NoBoundaryMarker,

    #[error("part {0} has no blank line after its headers")]
    MalformedPart(usize),

    #[error("field {0:?} is not valid UTF-8")]
    InvalidFieldEncoding(String),
}

/// A file uploaded as one part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    /// Form field name.
    pub name: String,
    /// Client-supplied file name.
    pub filename: String,
    /// Declared content type, if any.
    pub content_type: Option<String>,
    /// Raw file bytes.
    pub data: Vec<u8>,
}

/// Decoded multipart body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    /// Text fields by name. A repeated name keeps the last value.
    pub fields: BTreeMap<String, String>,
    /// File parts in body order.
    pub files: Vec<FilePart>,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Decode a body given the request's `Content-Type` header.
pub fn parse_request(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<MultipartForm, MultipartError> {
    let boundary = boundary_from_content_type(content_type)?;
    parse(body, &boundary)
}

/// Extract the boundary token from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: Option<&str>) -> Result<String, MultipartError> {
    let content_type = content_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(MultipartError::MissingContentType)?;

    let mut sections = content_type.splitn(2, ';');
    let mime = sections.next().unwrap_or_default().trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return Err(MultipartError::NotMultipart(mime.to_string()));
    }

    let params = sections.next().unwrap_or_default();
    parse_params(params)
        .into_iter()
        .find(|(key, value)| key == "boundary" && !value.is_empty())
        .map(|(_, value)| value)
        .ok_or(MultipartError::MissingBoundary)
}

/// Decode a multipart body split on `boundary`.
pub fn parse(body: &[u8], boundary: &str) -> Result<MultipartForm, MultipartError> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let markers = delimiter_positions(body, &delimiter);
    if markers.is_empty() {
        return Err(MultipartError::NoBoundaryMarker);
    }

    let mut form = MultipartForm::default();

    for (index, &marker) in markers.iter().enumerate() {
        let start = marker + delimiter.len();
        let end = markers.get(index + 1).copied().unwrap_or(body.len());
        let segment = &body[start..end];

        // "--boundary--" closes the body; anything after is epilogue.
        if segment.starts_with(b"--") {
            break;
        }

        let segment = strip_trailing_newline(strip_leading_newline(segment));
        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let part_number = index + 1;
        let (head, content) =
            split_head(segment).ok_or(MultipartError::MalformedPart(part_number))?;
        let headers = PartHeaders::parse(&String::from_utf8_lossy(head));

        let Some(name) = headers.name else {
            continue;
        };

        match headers.filename {
            Some(filename) => {
                if filename.is_empty() && content.is_empty() {
                    // Browsers send an empty part for an untouched file input.
                    continue;
                }
                form.files.push(FilePart {
                    name,
                    filename,
                    content_type: headers.content_type,
                    data: content.to_vec(),
                });
            }
            None => {
                let value = String::from_utf8(content.to_vec())
                    .map_err(|_| MultipartError::InvalidFieldEncoding(name.clone()))?;
                form.fields.insert(name, value);
            }
        }
    }

    Ok(form)
}

/// Headers of one part relevant to decoding.
#[derive(Debug, Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

impl PartHeaders {
    fn parse(head: &str) -> Self {
        let mut headers = Self::default();

        for line in head.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "content-disposition" => {
                    let mut sections = value.splitn(2, ';');
                    let _disposition = sections.next();
                    for (param, param_value) in parse_params(sections.next().unwrap_or_default()) {
                        match param.as_str() {
                            "name" => headers.name = Some(param_value),
                            "filename" => headers.filename = Some(param_value),
                            _ => {}
                        }
                    }
                }
                "content-type" if !value.is_empty() => {
                    headers.content_type = Some(value.to_string());
                }
                _ => {}
            }
        }

        headers.name = headers.name.filter(|name| !name.is_empty());
        headers
    }
}

/// Parse `key=value; key="quoted; value"` parameter lists.
///
/// Keys are lowercased; quoted values keep embedded separators and
/// backslash escapes are resolved.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ';' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        _ => value.push(c),
                    }
                }
                // Skip to the next separator.
                while chars.peek().is_some_and(|c| *c != ';') {
                    chars.next();
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim_end().to_string();
            }
        }

        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            params.push((key, value));
        }
    }

    params
}

/// Split a part into its header block and content at the first blank line.
fn split_head(segment: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = find(segment, b"\r\n\r\n", 0) {
        return Some((&segment[..pos], &segment[pos + 4..]));
    }
    find(segment, b"\n\n", 0).map(|pos| (&segment[..pos], &segment[pos + 2..]))
}

fn strip_leading_newline(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_prefix(b"\r\n")
        .or_else(|| bytes.strip_prefix(b"\n"))
        .unwrap_or(bytes)
}

fn strip_trailing_newline(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len()
    {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Positions of `delimiter` that start a line.
///
/// A delimiter in the middle of a line is part content, not a boundary.
fn delimiter_positions(body: &[u8], delimiter: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut from = 0;
    while let Some(pos) = find(body, delimiter, from) {
        if pos == 0 || body[pos - 1] == b'\n' {
            positions.push(pos);
            from = pos + delimiter.len();
        } else {
            from = pos + 1;
        }
    }
    positions
}
