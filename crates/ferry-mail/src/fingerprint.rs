use crate::headers::{body_prefix, extract_addresses, parse_minimal_headers};
use crate::MailError;
use ferry_core::MinimalHeaders;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

#[derive(Debug, Clone)]
pub struct FingerprintResult {
    pub fingerprint: String,
    pub headers: MinimalHeaders,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

/// Streamed SHA-256 of a file on disk.
pub fn sha256_file_hex(path: &Path) -> Result<String, MailError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// Stable dedupe key over normalized header fields plus an optional body
/// prefix. Fields are joined with a single 0x1f unit separator:
/// message-id, date epoch seconds (0 when unparseable), first From
/// addr-spec, whitespace-collapsed subject, byte size, body prefix.
pub fn compute_fingerprint(headers: &MinimalHeaders, size: usize, body: &[u8]) -> String {
    let from = extract_addresses(headers.from.as_deref())
        .into_iter()
        .next()
        .unwrap_or_default();
    let subject = collapse_whitespace(headers.subject.as_deref().unwrap_or(""));

    let mut hasher = Sha256::new();
    hasher.update(headers.message_id_norm.as_deref().unwrap_or("").as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(headers.date_epoch.unwrap_or(0).to_string().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(from.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(subject.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(size.to_string().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(body);
    hex(&hasher.finalize())
}

/// Parse headers out of a raw message and fingerprint it in one step.
pub fn fingerprint_message(raw: &[u8], body_bytes: usize) -> Result<FingerprintResult, MailError> {
    let headers = parse_minimal_headers(raw)?;
    let body = body_prefix(raw, body_bytes);
    let fingerprint = compute_fingerprint(&headers, raw.len(), body);
    Ok(FingerprintResult {
        fingerprint,
        headers,
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <abc@d.com>\r\n\
        Date: Mon, 01 Jan 2024 00:00:00 +0000\r\n\
        From: a@d.com\r\n\
        Subject: hi\r\n\
        \r\n\
        body text";

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint_message(RAW, 4096).unwrap();
        let b = fingerprint_message(RAW, 4096).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
        assert!(a.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn any_field_change_alters_fingerprint() {
        let base = fingerprint_message(RAW, 4096).unwrap().fingerprint;

        let changed_subject =
            b"Message-ID: <abc@d.com>\r\nDate: Mon, 01 Jan 2024 00:00:00 +0000\r\nFrom: a@d.com\r\nSubject: hello\r\n\r\nbody text";
        let changed_body =
            b"Message-ID: <abc@d.com>\r\nDate: Mon, 01 Jan 2024 00:00:00 +0000\r\nFrom: a@d.com\r\nSubject: hi\r\n\r\nbody texx";

        assert_ne!(base, fingerprint_message(changed_subject, 4096).unwrap().fingerprint);
        assert_ne!(base, fingerprint_message(changed_body, 4096).unwrap().fingerprint);
    }

    #[test]
    fn missing_message_id_still_fingerprints() {
        let raw = b"From: a@d.com\r\nSubject: hi\r\n\r\nbody";
        let result = fingerprint_message(raw, 4096).unwrap();
        assert!(result.headers.message_id_norm.is_none());
        assert_eq!(result.fingerprint.len(), 64);
    }

    #[test]
    fn zero_body_bytes_disables_body_tail() {
        let a = fingerprint_message(b"Subject: s\r\n\r\nbody one", 0).unwrap();
        let b = fingerprint_message(b"Subject: s\r\n\r\nbody two", 0).unwrap();
        // Identical headers and size, differing bodies: equal with N = 0.
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn sha256_helpers_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(sha256_file_hex(&path).unwrap(), sha256_hex(b"hello"));
    }
}
