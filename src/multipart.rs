//! `multipart/mixed` codec for the Gmail batch endpoint
//!
//! Each sub-request becomes one `application/http` part tagged
//! `Content-ID: <item-N>`. Google answers with `response-item-N` parts in
//! arbitrary order; [`parse_batch_response`] maps every part back to its
//! request position by Content-ID and falls back to part order when the
//! header is missing.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{GmailError, Result};
use crate::models::{SubRequest, SubResponse};

/// Status used for sub-requests that got no part in the response
pub const MISSING_PART_STATUS: u16 = 0;

pub fn new_boundary() -> String {
    format!("batch_{}", uuid::Uuid::new_v4().simple())
}

pub fn content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={}", boundary)
}

/// Encode sub-requests as a multipart/mixed body
pub fn encode_batch(requests: &[SubRequest], boundary: &str) -> String {
    let mut body = String::new();
    for (index, request) in requests.iter().enumerate() {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item-{}>\r\n", index));
        body.push_str("\r\n");
        body.push_str(&format!("{} {}\r\n", request.method, request.path));
        match &request.body {
            Some(json) => {
                let payload = json.to_string();
                body.push_str("Content-Type: application/json\r\n");
                body.push_str(&format!("Content-Length: {}\r\n", payload.len()));
                body.push_str("\r\n");
                body.push_str(&payload);
                body.push_str("\r\n");
            }
            None => body.push_str("\r\n"),
        }
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

/// Pull `boundary=` out of a Content-Type header value
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("boundary=")
            .map(|value| value.trim_matches('"').to_string())
    })
}

/// Index encoded in a `Content-ID` of the form `<response-item-N>` or `<item-N>`
fn content_id_index(value: &str) -> Option<usize> {
    let trimmed = value.trim().trim_start_matches('<').trim_end_matches('>');
    let (_, index) = trimmed.rsplit_once("item-")?;
    index.parse().ok()
}

fn split_head(text: &str) -> (&str, &str) {
    match text.find("\n\n") {
        Some(pos) => (&text[..pos], &text[pos + 2..]),
        None => (text, ""),
    }
}

struct ParsedPart {
    content_index: Option<usize>,
    response: SubResponse,
}

fn parse_part(part: &str) -> Option<ParsedPart> {
    let normalized = part.replace("\r\n", "\n");
    let (outer_headers, http) = split_head(normalized.trim_start_matches('\n'));

    let content_index = outer_headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-id") {
            content_id_index(value)
        } else {
            None
        }
    });

    let http = http.trim_start_matches('\n');
    let status_line = http.lines().next()?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())?;

    let (_, body) = split_head(http);

    Some(ParsedPart {
        content_index,
        response: SubResponse {
            status,
            body: body.trim().to_string(),
        },
    })
}

/// Parse a batch response into one [`SubResponse`] per request, in request order.
///
/// Requests with no matching part get status [`MISSING_PART_STATUS`].
pub fn parse_batch_response(
    body: &str,
    content_type: &str,
    expected: usize,
) -> Result<Vec<SubResponse>> {
    let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
        GmailError::InvalidMessageFormat(format!(
            "Batch response has no boundary in content type '{}'",
            content_type
        ))
    })?;
    let separator = format!("--{}", boundary);

    let mut by_index: HashMap<usize, SubResponse> = HashMap::new();
    let mut positional: Vec<SubResponse> = Vec::new();

    for part in body.split(separator.as_str()) {
        if part.trim().is_empty() || part.starts_with("--") {
            continue;
        }
        let Some(parsed) = parse_part(part) else {
            warn!("Skipping unparsable batch response part");
            continue;
        };
        match parsed.content_index {
            Some(index) if index < expected && !by_index.contains_key(&index) => {
                by_index.insert(index, parsed.response);
            }
            _ => positional.push(parsed.response),
        }
    }

    let mut positional = positional.into_iter();
    let responses: Vec<SubResponse> = (0..expected)
        .map(|index| {
            by_index
                .remove(&index)
                .or_else(|| positional.next())
                .unwrap_or_else(|| SubResponse {
                    status: MISSING_PART_STATUS,
                    body: "No response part for this request".to_string(),
                })
        })
        .collect();

    debug!("Parsed {} batch response parts", responses.len());
    Ok(responses)
}
