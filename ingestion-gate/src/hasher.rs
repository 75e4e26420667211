//! # Canonical hasher
//!
//! Computes the identity of a record from its semantic fields only. Import
//! metadata, timestamps and geometry never take part, so re-exports of the same
//! data hash identically.
//!
//! Digests are computed over `"<version>:<kind>:<canonical json>"`. Digests from
//! different versions are never comparable; changing a rule below requires a new
//! `HASH_VERSION` and a rehash of stored records, not an in-place compare.
use std::fmt::Display;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    error::NormalizeError,
    types::{Fields, SourceKind},
};

pub const HASH_VERSION: &str = "v1";

/// How a single identity field is normalized before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed and uppercased.
    Text,
    /// Rendered as a fixed-precision decimal with this many fractional digits.
    Decimal(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityField {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> IdentityField {
    IdentityField {
        name,
        kind: FieldKind::Text,
    }
}

const fn decimal(name: &'static str, scale: u8) -> IdentityField {
    IdentityField {
        name,
        kind: FieldKind::Decimal(scale),
    }
}

// Assessment year and value are part of parcel identity, so a re-assessment is a
// new record rather than an update of the old one.
const PARCEL_FIELDS: &[IdentityField] = &[
    text("STATEID"),
    text("PARCELID"),
    text("TAXPARCELID"),
    text("ADDNUMPREFIX"),
    text("ADDNUM"),
    text("ADDNUMSUFFIX"),
    text("PREFIX"),
    text("STREETNAME"),
    text("STREETTYPE"),
    text("SUFFIX"),
    text("LANDMARKNAME"),
    text("UNITTYPE"),
    text("UNITID"),
    text("PLACENAME"),
    text("ZIPCODE"),
    text("ZIP4"),
    text("CONAME"),
    text("OWNERNME1"),
    text("OWNERNME2"),
    text("ASSESSYEAR"),
    decimal("CNTASSDVALUE", 2),
    text("PROPCLASS"),
];

const TRANSFER_RETURN_FIELDS: &[IdentityField] = &[
    text("DOC_NUMBER"),
    text("PARCEL_ID"),
    text("TRANSFER_DATE"),
    text("RECORDING_DATE"),
    text("GRANTOR"),
    text("GRANTEE"),
    decimal("SALE_AMOUNT", 2),
    decimal("CONVEYANCE_FEE", 2),
    text("PROPERTY_TYPE"),
    text("TRANSFER_TYPE"),
    text("MUNICIPALITY"),
    text("COUNTY"),
    decimal("NUM_PARCELS", 0),
];

const CORPORATE_ENTITY_FIELDS: &[IdentityField] = &[
    text("ENTITY_ID"),
    text("ENTITY_NAME"),
    text("ENTITY_TYPE"),
    text("STATUS"),
    text("FORMATION_DATE"),
    text("EFFECTIVE_DATE"),
    text("EXPIRATION_DATE"),
    text("AGENT_NAME"),
    text("AGENT_ADDRESS"),
    text("AGENT_CITY"),
    text("AGENT_STATE"),
    text("AGENT_ZIP"),
    text("PRINCIPAL_ADDRESS"),
    text("PRINCIPAL_CITY"),
    text("PRINCIPAL_STATE"),
    text("PRINCIPAL_ZIP"),
];

pub fn identity_fields(kind: SourceKind) -> &'static [IdentityField] {
    match kind {
        SourceKind::Parcel => PARCEL_FIELDS,
        SourceKind::TransferReturn => TRANSFER_RETURN_FIELDS,
        SourceKind::CorporateEntity => CORPORATE_ENTITY_FIELDS,
    }
}

/// Hex-encoded SHA-256 digest identifying a logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn content_hash(kind: SourceKind, fields: &Fields) -> Result<ContentHash, NormalizeError> {
    let canonical = canonical_string(kind, fields)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(ContentHash(hex::encode(digest)))
}

/// The exact byte string that gets hashed. Fields appear in the declared order
/// of the kind's rule, never in input order, and absent values are JSON null.
pub fn canonical_string(kind: SourceKind, fields: &Fields) -> Result<String, NormalizeError> {
    let rule = identity_fields(kind);
    let mut pairs = Vec::with_capacity(rule.len());
    let mut present = 0;

    for field in rule {
        let normalized = normalize(field, lookup(fields, field.name))?;
        if normalized.is_some() {
            present += 1;
        }
        pairs.push((field.name, normalized));
    }

    // A row without a single identity value would collapse into every other such
    // row, which in practice means the file has the wrong columns
    if present == 0 {
        return Err(NormalizeError::malformed(
            "*",
            format!("has none of the {kind} identity fields"),
        ));
    }

    let body = serde_json::to_string(&pairs)
        .map_err(|e| NormalizeError::malformed("*", e.to_string()))?;
    Ok(format!("{HASH_VERSION}:{kind}:{body}"))
}

// Exact key first, then a case-insensitive match, since upstream exports are
// inconsistent about header case
fn lookup<'a>(fields: &'a Fields, name: &str) -> Option<&'a Value> {
    fields.get(name).or_else(|| {
        fields
            .iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn normalize(field: &IdentityField, value: Option<&Value>) -> Result<Option<String>, NormalizeError> {
    let Some(value) = value else {
        return Ok(None);
    };

    match field.kind {
        FieldKind::Text => normalize_text(field.name, value),
        FieldKind::Decimal(scale) => normalize_decimal(field.name, value, scale),
    }
}

fn normalize_text(name: &str, value: &Value) -> Result<Option<String>, NormalizeError> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.trim().to_uppercase(),
        Value::Number(n) => number_text(n),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Array(_) | Value::Object(_) => {
            return Err(NormalizeError::malformed(name, "is not a scalar value"))
        }
    };

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

// Float exports render integral codes as 53703.0, which must match "53703"
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f == 0.0 => "0".to_owned(),
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
        _ => n.to_string(),
    }
}

fn normalize_decimal(name: &str, value: &Value, scale: u8) -> Result<Option<String>, NormalizeError> {
    let number = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| NormalizeError::malformed(name, "is out of range"))?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .replace(',', "")
                .parse::<f64>()
                .map_err(|_| NormalizeError::malformed(name, format!("{trimmed:?} is not numeric")))?
        }
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => {
            return Err(NormalizeError::malformed(name, "is not numeric"))
        }
    };

    if !number.is_finite() {
        return Err(NormalizeError::malformed(name, "is not a finite number"));
    }

    Ok(Some(format_decimal(number, scale)))
}

fn format_decimal(number: f64, scale: u8) -> String {
    let rendered = format!("{:.*}", scale as usize, number);
    // -0.001 renders as "-0.00", which must equal "0.00"
    match rendered.strip_prefix('-') {
        Some(unsigned) if unsigned.chars().all(|c| c == '0' || c == '.') => unsigned.to_owned(),
        _ => rendered,
    }
}
