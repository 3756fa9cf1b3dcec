use crate::MailError;
use ferry_core::MinimalHeaders;
use mailparse::{addrparse, dateparse, parse_headers, MailAddr, MailHeaderMap};

/// Normalize a Message-Id for stable comparisons: angle brackets stripped,
/// lowercased, anything after the first whitespace dropped.
pub fn normalize_message_id(value: Option<&str>) -> Option<String> {
    let mut v = value?.trim();
    if v.is_empty() {
        return None;
    }
    if let Some((first, _)) = v.split_once(char::is_whitespace) {
        v = first;
    }
    let v = v
        .strip_prefix('<')
        .and_then(|inner| inner.strip_suffix('>'))
        .unwrap_or(v)
        .trim();
    if v.is_empty() {
        return None;
    }
    Some(v.to_ascii_lowercase())
}

/// Parse the header fields used for fingerprinting and address filtering
/// out of raw RFC 5322 bytes. The body is not touched.
pub fn parse_minimal_headers(raw: &[u8]) -> Result<MinimalHeaders, MailError> {
    let (headers, _) = parse_headers(raw)?;

    let date_raw = headers.get_first_value("Date");
    let date_epoch = date_raw.as_deref().and_then(|d| dateparse(d).ok());

    Ok(MinimalHeaders {
        message_id_norm: normalize_message_id(headers.get_first_value("Message-ID").as_deref()),
        date_raw,
        date_epoch,
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        cc: headers.get_first_value("Cc"),
        bcc: headers.get_first_value("Bcc"),
        delivered_to: headers.get_first_value("Delivered-To"),
        x_original_to: headers.get_first_value("X-Original-To"),
        envelope_to: headers.get_first_value("Envelope-To"),
        subject: headers.get_first_value("Subject"),
    })
}

/// Extract lowercased addr-specs from a header value. Display names and
/// group syntax are handled by the address parser, not string splitting.
pub fn extract_addresses(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let Ok(parsed) = addrparse(value) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => push_addr(&mut out, &info.addr),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    push_addr(&mut out, &info.addr);
                }
            }
        }
    }
    out
}

fn push_addr(out: &mut Vec<String>, addr: &str) {
    let normalized = addr.trim().to_ascii_lowercase();
    if !normalized.is_empty() && !out.contains(&normalized) {
        out.push(normalized);
    }
}

/// First `max_bytes` of the message body, located after the blank line that
/// terminates the header block. Returns the raw prefix if no split exists.
pub fn body_prefix(raw: &[u8], max_bytes: usize) -> &[u8] {
    if max_bytes == 0 {
        return &[];
    }
    let start = body_start(raw).unwrap_or(0);
    let end = raw.len().min(start + max_bytes);
    &raw[start..end]
}

fn body_start(raw: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            let mut j = i + 1;
            if j < raw.len() && raw[j] == b'\r' {
                j += 1;
            }
            if j < raw.len() && raw[j] == b'\n' {
                return Some(j + 1);
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_message_ids() {
        assert_eq!(normalize_message_id(None), None);
        assert_eq!(normalize_message_id(Some("")), None);
        assert_eq!(
            normalize_message_id(Some(" <ABC@Example.COM> ")),
            Some("abc@example.com".to_string())
        );
        assert_eq!(
            normalize_message_id(Some("<a@b> trailing garbage")),
            Some("a@b".to_string())
        );
        assert_eq!(normalize_message_id(Some("<>")), None);
    }

    #[test]
    fn parses_minimal_headers() {
        let raw = b"Message-ID: <X@d.com>\r\n\
                    Date: Mon, 01 Jan 2024 00:00:00 +0000\r\n\
                    From: Alice <a@d.com>\r\n\
                    To: b@d.com\r\n\
                    Subject: hi\r\n\
                    \r\n\
                    body";
        let headers = parse_minimal_headers(raw).unwrap();
        assert_eq!(headers.message_id_norm.as_deref(), Some("x@d.com"));
        assert_eq!(headers.date_epoch, Some(1_704_067_200));
        assert_eq!(headers.subject.as_deref(), Some("hi"));
        assert_eq!(headers.from.as_deref(), Some("Alice <a@d.com>"));
    }

    #[test]
    fn extracts_addresses_with_display_names() {
        let got = extract_addresses(Some("Alice <ALICE@example.com>, bob@example.com"));
        assert_eq!(got, vec!["alice@example.com", "bob@example.com"]);
    }

    #[test]
    fn extract_addresses_handles_missing_header() {
        assert!(extract_addresses(None).is_empty());
    }

    #[test]
    fn body_prefix_splits_after_headers() {
        assert_eq!(body_prefix(b"H: v\r\n\r\nBodyContent", 4), b"Body");
        assert_eq!(body_prefix(b"H: v\n\nBodyContent", 4), b"Body");
        assert_eq!(body_prefix(b"no blank line here", 5), b"no bl");
        assert_eq!(body_prefix(b"H: v\r\n\r\nBody", 0), b"");
    }
}
