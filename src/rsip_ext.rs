use crate::{Error, Result};

pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

/// Extract the URI out of a Contact-style value, tolerating display
/// names, angle brackets and trailing header parameters.
///
/// `"Bob" <sip:bob@example.com;transport=ws>;expires=600` yields
/// `sip:bob@example.com;transport=ws`.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let (Some(start), Some(end)) = (line.find('<'), line.rfind('>')) {
        if start < end {
            return rsip::Uri::try_from(&line[start + 1..end]).map_err(Into::into);
        }
    }
    let bare = line.split(';').next().unwrap_or(line).trim();
    rsip::Uri::try_from(bare)
        .map_err(|_| Error::InvalidTarget(format!("malformed contact: {}", line)))
}

/// Look up a `;name=value` header parameter outside the angle brackets
/// of a Contact-style value. Quoted values are returned unquoted;
/// a `;` inside quotes (GRUUs carry them) does not split.
pub fn contact_param(line: &str, name: &str) -> Option<String> {
    let tail = match line.rfind('>') {
        Some(pos) => &line[pos + 1..],
        None => line,
    };
    let mut params = vec![];
    let mut current = String::new();
    let mut in_quotes = false;
    for c in tail.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => {
                params.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    params.push(current);

    for param in params {
        let mut kv = param.splitn(2, '=');
        let key = kv.next()?.trim();
        if key.eq_ignore_ascii_case(name) {
            let value = kv.next().unwrap_or("").trim();
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// True when a comma-separated header (Supported, Require, Allow...)
/// carries the given token, case-insensitively.
pub fn header_contains_token(headers: &rsip::Headers, name: &str, token: &str) -> bool {
    header_value(headers, name)
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Fetch the first header with the given name as a raw string.
///
/// Matches on the serialized form so extension headers are found
/// whether rsip parsed them into a typed variant or `Header::Other`.
pub fn header_value(headers: &rsip::Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let line = h.to_string();
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

#[macro_export]
macro_rules! header_pop {
    ($iter:expr, $header:path) => {
        let mut first = true;
        $iter.retain(|h| {
            if first && matches!(h, $header(_)) {
                first = false;
                false
            } else {
                true
            }
        });
    };
}
