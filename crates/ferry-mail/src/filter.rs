use crate::headers::extract_addresses;
use ferry_core::MinimalHeaders;
use std::collections::BTreeSet;

/// Address-based include filter. An empty target set matches everything.
#[derive(Debug, Clone)]
pub struct AddressFilter {
    targets: BTreeSet<String>,
    include_sender: bool,
    include_recipients: bool,
}

impl AddressFilter {
    pub fn new(
        targets: impl IntoIterator<Item = String>,
        include_sender: bool,
        include_recipients: bool,
    ) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|addr| addr.trim().to_ascii_lowercase())
                .filter(|addr| !addr.is_empty())
                .collect(),
            include_sender,
            include_recipients,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// True when the message references one of the target addresses in the
    /// sender or any recipient-bearing header, including the delivery
    /// headers (`Delivered-To`, `X-Original-To`, `Envelope-To`).
    pub fn matches(&self, headers: &MinimalHeaders) -> bool {
        if self.targets.is_empty() {
            return true;
        }

        if self.include_sender && self.any_target(headers.from.as_deref()) {
            return true;
        }

        if self.include_recipients {
            let recipient_headers = [
                headers.to.as_deref(),
                headers.cc.as_deref(),
                headers.bcc.as_deref(),
                headers.delivered_to.as_deref(),
                headers.x_original_to.as_deref(),
                headers.envelope_to.as_deref(),
            ];
            if recipient_headers.iter().any(|value| self.any_target(*value)) {
                return true;
            }
        }

        false
    }

    fn any_target(&self, value: Option<&str>) -> bool {
        extract_addresses(value)
            .iter()
            .any(|addr| self.targets.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::parse_minimal_headers;

    fn headers(raw: &[u8]) -> MinimalHeaders {
        parse_minimal_headers(raw).unwrap()
    }

    #[test]
    fn matches_recipient_in_to() {
        let filter = AddressFilter::new(["x@d.com".to_string()], true, true);
        let h = headers(b"From: a@d.com\r\nTo: Someone <x@d.com>\r\n\r\nbody");
        assert!(filter.matches(&h));
    }

    #[test]
    fn matches_sender_only_when_enabled() {
        let h = headers(b"From: x@d.com\r\nTo: other@d.com\r\n\r\nbody");
        let with_sender = AddressFilter::new(["x@d.com".to_string()], true, true);
        let without_sender = AddressFilter::new(["x@d.com".to_string()], false, true);
        assert!(with_sender.matches(&h));
        assert!(!without_sender.matches(&h));
    }

    #[test]
    fn matches_delivery_headers() {
        let filter = AddressFilter::new(["alias@custom.com".to_string()], true, true);
        let h = headers(b"From: a@d.com\r\nTo: b@d.com\r\nDelivered-To: alias@custom.com\r\n\r\nbody");
        assert!(filter.matches(&h));
        let h = headers(b"From: a@d.com\r\nX-Original-To: alias@custom.com\r\n\r\nbody");
        assert!(filter.matches(&h));
    }

    #[test]
    fn rejects_unrelated_message() {
        let filter = AddressFilter::new(["alias@custom.com".to_string()], true, true);
        let h = headers(b"From: a@d.com\r\nTo: b@d.com\r\n\r\nbody");
        assert!(!filter.matches(&h));
    }

    #[test]
    fn empty_targets_match_everything() {
        let filter = AddressFilter::new(Vec::new(), true, true);
        let h = headers(b"From: a@d.com\r\n\r\nbody");
        assert!(filter.matches(&h));
    }
}
