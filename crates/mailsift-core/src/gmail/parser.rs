use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use crate::gmail::types::{Message, MessagePart};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParsedMessage {
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<Recipient>,
    pub subject: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
}

impl ParsedMessage {
    /// Best-effort text content: the plain body when present, otherwise the
    /// HTML body rendered to text.
    pub fn content_text(&self) -> Option<String> {
        if let Some(plain) = &self.body_plain {
            let trimmed = plain.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }

        let html = self.body_html.as_deref()?;
        match html2text::from_read(html.as_bytes(), 100) {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(_) => None,
        }
    }
}

pub fn parse_message(message: &Message) -> ParsedMessage {
    let payload = message.payload.as_ref();

    let from = header_value(message, "From").and_then(|v| parse_recipient(v.trim()));
    let to = header_value(message, "To")
        .map(|v| parse_recipient_list(&v))
        .unwrap_or_default();
    let subject = header_value(message, "Subject");

    let mut body_plain = None;
    let mut body_html = None;
    if let Some(part) = payload {
        extract_bodies(part, &mut body_plain, &mut body_html, 0);
    }

    ParsedMessage {
        from_email: from.as_ref().map(|r| r.email.clone()),
        from_name: from.and_then(|r| r.name),
        to,
        subject,
        body_plain,
        body_html,
    }
}

/// First value of the named top-level header, case-insensitive.
pub fn header_value(message: &Message, name: &str) -> Option<String> {
    message.payload.as_ref().and_then(|p| {
        p.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    })
}

/// All values of the named top-level header, in payload order. Gmail keeps
/// Received headers topmost-first, so index 0 is the final delivery hop.
pub fn header_values(message: &Message, name: &str) -> Vec<String> {
    message
        .payload
        .as_ref()
        .map(|p| {
            p.headers
                .iter()
                .filter(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_recipient_list(value: &str) -> Vec<Recipient> {
    split_addresses(value)
        .into_iter()
        .filter_map(|s| parse_recipient(s.trim()))
        .collect()
}

fn parse_recipient(input: &str) -> Option<Recipient> {
    if input.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (input.find('<'), input.rfind('>')) {
        let email = input[start + 1..end].trim();
        if email.is_empty() {
            return None;
        }
        let name_raw = input[..start].trim();
        let name = if name_raw.is_empty() {
            None
        } else {
            Some(strip_quotes(name_raw))
        };
        return Some(Recipient {
            email: email.to_string(),
            name,
        });
    }

    let trimmed = input.trim().trim_matches('<').trim_matches('>');
    if trimmed.is_empty() {
        None
    } else {
        Some(Recipient {
            email: trimmed.to_string(),
            name: None,
        })
    }
}

fn strip_quotes(input: &str) -> String {
    let stripped = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    stripped.replace("\\\"", "\"")
}

fn split_addresses(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut prev_char: Option<char> = None;

    for ch in input.chars() {
        match ch {
            '"' => {
                let is_escaped = prev_char == Some('\\');
                if !is_escaped {
                    in_quotes = !in_quotes;
                }
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
        prev_char = Some(ch);
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

/// Maximum depth for MIME tree traversal to prevent stack overflow from malicious emails
const MAX_MIME_DEPTH: usize = 50;

fn extract_bodies(
    part: &MessagePart,
    body_plain: &mut Option<String>,
    body_html: &mut Option<String>,
    depth: usize,
) {
    if depth > MAX_MIME_DEPTH {
        return;
    }

    if let Some(mime) = part.mime_type.as_deref() {
        if let Some(body) = part.body.as_ref() {
            if let Some(data) = body.data.as_ref() {
                let decoded = decode_body(data);
                match mime {
                    m if m.eq_ignore_ascii_case("text/plain") => {
                        if body_plain.is_none() {
                            *body_plain = decoded;
                        }
                    }
                    m if m.eq_ignore_ascii_case("text/html") => {
                        if body_html.is_none() {
                            *body_html = decoded;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    for child in &part.parts {
        extract_bodies(child, body_plain, body_html, depth + 1);
    }
}

fn decode_body(data: &str) -> Option<String> {
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(data) {
        return Some(String::from_utf8_lossy(&bytes).into_owned());
    }

    if let Ok(bytes) = STANDARD.decode(data) {
        return Some(String::from_utf8_lossy(&bytes).into_owned());
    }

    None
}
