use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

static GL_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

/// A validated 4-digit general-ledger code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GlCode(String);

impl GlCode {
    pub fn parse(code: String) -> Result<Self, String> {
        if GL_CODE_RE.is_match(&code) {
            Ok(Self(code))
        } else {
            Err(format!("GL code must be exactly 4 digits, got {code:?}"))
        }
    }

    /// The sentinel code for unmatched/inactive/reseller vendors.
    pub fn unknown() -> Self { Self("0000".to_string()) }
}

impl AsRef<str> for GlCode {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for GlCode {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for GlCode {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::parse(value) }
}

impl From<GlCode> for String {
    fn from(value: GlCode) -> Self { value.0 }
}

/// Canonical vendor lookup key: lowercase, non-alphanumeric runs collapsed to
/// `_`, trailing `_` trimmed. A pure
/// function of the display name it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    pub fn normalize(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        let mut out = String::with_capacity(lower.len());
        let mut last_was_sep = false;
        for c in lower.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
        let trimmed = out.trim_end_matches('_').to_string();
        Self(trimmed)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for NormalizedKey {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const RESELLER_CATEGORY: &str = "Reseller";

/// A long-lived, hand-curated vendor row. Created and updated by
/// VendorAdmin; never hard-deleted, only soft-deleted via `active = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub normalized_key: NormalizedKey,
    pub display_name: String,
    pub expense_dept: String,
    pub gl_code: GlCode,
    pub allocation_schedule: String,
    pub billing_party: String,
    pub product_category: Option<String>,
    pub active: bool,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_schema_version() -> String { "1.0".to_string() }

impl Vendor {
    /// Whether this vendor's GL is invoice-specific and must always be
    /// routed to the `unknown` path regardless of an otherwise-successful
    /// lookup.
    pub fn is_reseller(&self) -> bool {
        self.product_category.as_deref() == Some(RESELLER_CATEGORY)
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use claims::assert_ok;

    use super::*;

    #[test]
    fn gl_code_accepts_four_digits() {
        assert_ok!(GlCode::parse("6100".to_string()));
    }

    #[test]
    fn gl_code_rejects_wrong_length() {
        assert_err!(GlCode::parse("610".to_string()));
        assert_err!(GlCode::parse("61000".to_string()));
    }

    #[test]
    fn gl_code_rejects_non_digits() {
        assert_err!(GlCode::parse("61a0".to_string()));
    }

    #[test]
    fn normalize_lowercases_and_collapses_runs() {
        assert_eq!(NormalizedKey::normalize("Adobe Inc.").as_ref(), "adobe_inc");
        assert_eq!(NormalizedKey::normalize("  Foo---Bar!!").as_ref(), "foo_bar");
        assert_eq!(NormalizedKey::normalize("Trailing Punct...").as_ref(), "trailing_punct");
    }

    #[test]
    fn normalize_is_deterministic() {
        assert_eq!(
            NormalizedKey::normalize("Adobe Inc"),
            NormalizedKey::normalize("ADOBE INC")
        );
    }

    #[test]
    fn reseller_flag_detected() {
        let vendor = Vendor {
            normalized_key: NormalizedKey::normalize("reseller co"),
            display_name: "Reseller Co".into(),
            expense_dept: "IT".into(),
            gl_code: GlCode::parse("1234".to_string()).unwrap(),
            allocation_schedule: "MONTHLY".into(),
            billing_party: "HQ".into(),
            product_category: Some(RESELLER_CATEGORY.to_string()),
            active: true,
            schema_version: "1.0".into(),
        };
        assert!(vendor.is_reseller());
    }
}
