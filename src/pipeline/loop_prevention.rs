/// System-generated subject prefixes: an inbound email whose
/// subject starts with one of these is something the pipeline itself sent
/// (the unknown-vendor registration prompt, e.g.) and must never be
/// re-ingested.
pub const SYSTEM_SUBJECT_PREFIXES: &[&str] = &["[Invoice Agent]", "Unknown Vendor —"];

/// Whether an inbound email should be discarded before attachment download
///. Any one of the three conditions is sufficient.
pub fn should_discard(
    sender: &str,
    subject: &str,
    has_attachment: bool,
    monitored_mailbox: &str,
    ap_address: &str,
) -> bool {
    let sender = sender.trim().to_lowercase();
    if sender == monitored_mailbox.trim().to_lowercase() || sender == ap_address.trim().to_lowercase() {
        return true;
    }
    if SYSTEM_SUBJECT_PREFIXES.iter().any(|prefix| subject.starts_with(prefix)) {
        return true;
    }
    !has_attachment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discards_mail_from_the_monitored_mailbox() {
        assert!(should_discard("Invoices@Example.com", "hi", true, "invoices@example.com", "ap@example.com"));
    }

    #[test]
    fn discards_mail_from_the_ap_address() {
        assert!(should_discard("ap@example.com", "hi", true, "invoices@example.com", "ap@example.com"));
    }

    #[test]
    fn discards_system_generated_subjects() {
        assert!(should_discard(
            "someone@example.com",
            "Unknown Vendor — requires registration (TxID abcd1234)",
            true,
            "invoices@example.com",
            "ap@example.com"
        ));
    }

    #[test]
    fn discards_mail_with_no_attachment() {
        assert!(should_discard("vendor@example.com", "Invoice 123", false, "invoices@example.com", "ap@example.com"));
    }

    #[test]
    fn keeps_genuine_vendor_mail() {
        assert!(!should_discard(
            "billing@adobe.com",
            "Invoice 12345",
            true,
            "invoices@example.com",
            "ap@example.com"
        ));
    }
}
