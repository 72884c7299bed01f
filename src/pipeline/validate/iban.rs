//! IBAN validation (MOD-97 with diagnostics) and the two repair
//! strategies: fuzzy matching against MOD-97-valid candidates mined from
//! the OCR text, and a targeted model re-verification pass over the
//! original page images.
//!
//! The diagnostics matter as much as the verdict: the repair prompt tells
//! the model exactly what is wrong with each row ("TOO SHORT: missing 1
//! digit"), which is what makes the second pass converge.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backends::{BackendError, CallOptions, ContentPart, ModelBackend};
use crate::schema::DocType;

/// Expected IBAN length for the Slovak/Czech market.
const SK_CZ_LENGTH: usize = 24;

/// Diagnosed IBAN defect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbanIssue {
    Missing,
    /// Fails the structural shape entirely.
    Invalid,
    TooShort { expected: usize, actual: usize },
    TooLong { expected: usize, actual: usize },
    ChecksumFailed,
}

impl IbanIssue {
    /// Stable machine-readable code for `_validationIssue`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::TooShort { .. } => "too_short",
            Self::TooLong { .. } => "too_long",
            Self::ChecksumFailed => "checksum_failed",
        }
    }

    /// Human-readable diagnostic, also fed into the repair prompt.
    pub fn describe(&self) -> String {
        match self {
            Self::Missing => "MISSING: no IBAN present".to_string(),
            Self::Invalid => "INVALID FORMAT: not an IBAN shape".to_string(),
            Self::TooShort { expected, actual } => format!(
                "TOO SHORT: missing {} digits (expected {expected}, got {actual})",
                expected - actual
            ),
            Self::TooLong { expected, actual } => format!(
                "TOO LONG: {} extra characters (expected {expected}, got {actual})",
                actual - expected
            ),
            Self::ChecksumFailed => "CHECKSUM FAILED: MOD-97 check does not equal 1".to_string(),
        }
    }
}

/// Strip all whitespace and upper-case. Idempotent.
pub fn normalize_iban(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn structural_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z0-9]{11,30}$").expect("static regex"))
}

/// Validate a candidate IBAN; returns the normalised form or a diagnosis.
pub fn validate_iban(raw: &str) -> Result<String, IbanIssue> {
    let normalized = normalize_iban(raw);
    if normalized.is_empty() {
        return Err(IbanIssue::Missing);
    }
    if !structural_regex().is_match(&normalized) {
        return Err(IbanIssue::Invalid);
    }

    if normalized.starts_with("SK") || normalized.starts_with("CZ") {
        let actual = normalized.len();
        if actual < SK_CZ_LENGTH {
            return Err(IbanIssue::TooShort {
                expected: SK_CZ_LENGTH,
                actual,
            });
        }
        if actual > SK_CZ_LENGTH {
            return Err(IbanIssue::TooLong {
                expected: SK_CZ_LENGTH,
                actual,
            });
        }
    }

    if mod97(&normalized) != 1 {
        return Err(IbanIssue::ChecksumFailed);
    }

    Ok(normalized)
}

/// MOD-97 over the rotated, letter-substituted number, reduced
/// incrementally so the value never leaves `u32`.
fn mod97(normalized: &str) -> u32 {
    let rotated = normalized
        .chars()
        .skip(4)
        .chain(normalized.chars().take(4));

    let mut acc: u32 = 0;
    for c in rotated {
        if let Some(d) = c.to_digit(10) {
            acc = (acc * 10 + d) % 97;
        } else {
            // A=10 .. Z=35 contributes two decimal digits at once.
            let v = c as u32 - 'A' as u32 + 10;
            acc = (acc * 100 + v) % 97;
        }
    }
    acc
}

/// Classic two-row Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Position-wise character similarity over the account bodies (everything
/// past the country+check prefix) of two normalised IBANs.
pub fn account_body_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_iban(a);
    let b = normalize_iban(b);
    if a.len() <= 4 || b.len() <= 4 {
        return 0.0;
    }
    let body_a: Vec<char> = a.chars().skip(4).collect();
    let body_b: Vec<char> = b.chars().skip(4).collect();

    let longest = body_a.len().max(body_b.len());
    let matches = body_a
        .iter()
        .zip(body_b.iter())
        .filter(|(x, y)| x == y)
        .count();
    matches as f64 / longest as f64
}

fn candidate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Z]{2}\s*\d{2}[\s\d]{18,26}\b").expect("static regex")
    })
}

/// Mine the OCR text for MOD-97-valid IBAN candidates, in order of first
/// appearance, deduplicated.
pub fn scan_ocr_candidates(ocr_text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for m in candidate_regex().find_iter(ocr_text) {
        let normalized = normalize_iban(m.as_str());
        if validate_iban(&normalized).is_ok() && seen.insert(normalized.clone()) {
            candidates.push(normalized);
        }
    }
    candidates
}

/// Pick the closest candidate sharing the country code, when it is within
/// editing distance 3 of the broken IBAN.
pub fn closest_candidate(broken: &str, candidates: &[String]) -> Option<String> {
    let normalized = normalize_iban(broken);
    if normalized.len() < 2 {
        return None;
    }
    let country = &normalized[..2];

    candidates
        .iter()
        .filter(|c| c.starts_with(country))
        .map(|c| (levenshtein(&normalized, c), c))
        .min_by_key(|(distance, _)| *distance)
        .filter(|(distance, _)| *distance <= 3)
        .map(|(_, c)| c.clone())
}

// ── Model re-verification ─────────────────────────────────

const REVERIFY_INSTRUCTIONS: &str = "\
You are correcting rows of a drawdown schedule whose IBANs failed \
validation. Re-read the attached document pages carefully, character by \
character. Return ONLY the corrected versions of the listed invalid rows \
as JSON in the form {\"rows\": [{\"invoiceNumber\": ..., \
\"variableSymbol\": ..., \"amount\": ..., \"iban\": ...}]}. Do not return \
rows that were not listed as invalid.";

/// Build the targeted repair prompt: the valid rows anchor context, the
/// invalid rows carry their specific diagnostics.
pub fn build_reverify_prompt(valid_rows: &[Value], invalid_rows: &[Value]) -> String {
    let mut prompt = String::new();

    if !valid_rows.is_empty() {
        prompt.push_str("These rows were extracted and verified already (context only):\n");
        prompt.push_str(&Value::Array(valid_rows.to_vec()).to_string());
        prompt.push_str("\n\n");
    }

    prompt.push_str("These rows have invalid IBANs and must be corrected:\n");
    for row in invalid_rows {
        let invoice = row
            .get("invoiceNumber")
            .and_then(Value::as_str)
            .unwrap_or("(unknown)");
        let iban = row.get("iban").and_then(Value::as_str).unwrap_or("");
        let diagnosis = match validate_iban(iban) {
            Ok(_) => "unexpectedly valid".to_string(),
            Err(issue) => issue.describe(),
        };
        prompt.push_str(&format!(
            "- invoiceNumber {invoice}: iban \"{iban}\" -> {diagnosis}\n"
        ));
    }

    prompt
}

/// Outcome of the model pass: only rows that were requested and now carry
/// a MOD-97-valid IBAN are accepted.
pub async fn reverify_rows(
    backend: &Arc<dyn ModelBackend>,
    doc_type: DocType,
    valid_rows: &[Value],
    invalid_rows: &[Value],
    images: &[Vec<u8>],
) -> Result<Vec<Value>, BackendError> {
    let prompt = build_reverify_prompt(valid_rows, invalid_rows);

    let mut parts = Vec::with_capacity(images.len() + 1);
    parts.push(ContentPart::Text(prompt));
    parts.extend(images.iter().map(|image| ContentPart::jpeg(image.clone())));

    let reply = backend
        .extract(
            &parts,
            REVERIFY_INSTRUCTIONS,
            doc_type,
            None,
            false,
            &CallOptions {
                use_tile_timeout: false,
            },
        )
        .await?;

    let requested: HashSet<String> = invalid_rows
        .iter()
        .filter_map(|row| row.get("invoiceNumber").and_then(Value::as_str))
        .map(normalize_key)
        .collect();

    let returned = reply
        .data
        .get("rows")
        .or_else(|| doc_type.array_field().and_then(|f| reply.data.get(f)))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut accepted = Vec::new();
    for mut row in returned {
        let invoice = row
            .get("invoiceNumber")
            .and_then(Value::as_str)
            .map(normalize_key);
        let Some(invoice) = invoice else { continue };
        if !requested.contains(&invoice) {
            debug!(invoice = %invoice, "re-verification returned an unrequested row; dropped");
            continue;
        }

        let iban = row.get("iban").and_then(Value::as_str).unwrap_or("");
        match validate_iban(iban) {
            Ok(normalized) => {
                if let Some(obj) = row.as_object_mut() {
                    obj.insert("iban".into(), json!(normalized));
                }
                accepted.push(row);
            }
            Err(issue) => {
                debug!(invoice = %invoice, issue = issue.code(), "re-verified IBAN still invalid");
            }
        }
    }

    info!(
        requested = requested.len(),
        accepted = accepted.len(),
        "model re-verification pass done"
    );
    Ok(accepted)
}

/// Key normalisation used whenever rows are matched by invoice number.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Valid fixtures: SK/CZ test IBANs with correct MOD-97 checksums.
    const VALID_SK: &str = "SK3112000000198742637541";
    const VALID_CZ: &str = "CZ6508000000192000145399";
    const VALID_DE: &str = "DE89370400440532013000";

    #[test]
    fn valid_ibans_pass() {
        assert_eq!(validate_iban(VALID_SK).unwrap(), VALID_SK);
        assert_eq!(validate_iban(VALID_CZ).unwrap(), VALID_CZ);
        assert_eq!(validate_iban(VALID_DE).unwrap(), VALID_DE);
    }

    #[test]
    fn normalization_is_stable_under_whitespace_and_case() {
        let spaced = "sk31 1200 0000 1987 4263 7541";
        assert_eq!(validate_iban(spaced).unwrap(), VALID_SK);
        assert_eq!(normalize_iban(&normalize_iban(spaced)), VALID_SK);
    }

    #[test]
    fn missing_and_invalid_shapes() {
        assert_eq!(validate_iban("").unwrap_err(), IbanIssue::Missing);
        assert_eq!(validate_iban("   ").unwrap_err(), IbanIssue::Missing);
        assert_eq!(validate_iban("12345678").unwrap_err(), IbanIssue::Invalid);
        assert_eq!(
            validate_iban("S1231200000019874263754").unwrap_err(),
            IbanIssue::Invalid
        );
    }

    #[test]
    fn sk_length_diagnostics() {
        // One digit dropped
        let short = &VALID_SK[..23];
        assert_eq!(
            validate_iban(short).unwrap_err(),
            IbanIssue::TooShort {
                expected: 24,
                actual: 23
            }
        );

        let long = format!("{VALID_SK}9");
        assert_eq!(
            validate_iban(&long).unwrap_err(),
            IbanIssue::TooLong {
                expected: 24,
                actual: 25
            }
        );
    }

    #[test]
    fn checksum_diagnostics() {
        // Flip a digit in the body
        let mut flipped: Vec<char> = VALID_SK.chars().collect();
        flipped[10] = if flipped[10] == '0' { '1' } else { '0' };
        let flipped: String = flipped.into_iter().collect();
        assert_eq!(
            validate_iban(&flipped).unwrap_err(),
            IbanIssue::ChecksumFailed
        );
    }

    #[test]
    fn issue_codes_are_stable() {
        assert_eq!(IbanIssue::Missing.code(), "missing");
        assert_eq!(IbanIssue::Invalid.code(), "invalid");
        assert_eq!(
            IbanIssue::TooShort {
                expected: 24,
                actual: 23
            }
            .code(),
            "too_short"
        );
        assert_eq!(
            IbanIssue::TooLong {
                expected: 24,
                actual: 25
            }
            .code(),
            "too_long"
        );
        assert_eq!(IbanIssue::ChecksumFailed.code(), "checksum_failed");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", "abd"), 1);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn similarity_over_account_bodies() {
        // Same IBAN → 1.0
        assert!((account_body_similarity(VALID_SK, VALID_SK) - 1.0).abs() < 1e-9);

        // Single flipped character late in the body stays well above 0.8
        let mut flipped: Vec<char> = VALID_SK.chars().collect();
        flipped[20] = '9';
        let flipped: String = flipped.into_iter().collect();
        assert!(account_body_similarity(VALID_SK, &flipped) > 0.8);

        // Different accounts fall below the promotion threshold
        assert!(account_body_similarity(VALID_SK, VALID_CZ) < 0.8);
    }

    #[test]
    fn ocr_scan_finds_spaced_candidates() {
        let ocr = "Úhrada faktúry FV-2024\nIBAN: SK31 1200 0000 1987 4263 7541\n\
                   Protiúčet CZ65 0800 0000 1920 0014 5399\nSuma: 1 200,50 EUR";
        let candidates = scan_ocr_candidates(ocr);
        assert_eq!(candidates, vec![VALID_SK.to_string(), VALID_CZ.to_string()]);
    }

    #[test]
    fn ocr_scan_drops_checksum_failures_and_duplicates() {
        let ocr = format!(
            "SK31 1200 0000 1987 4263 7542\n{VALID_SK}\nSK31 1200 0000 1987 4263 7541"
        );
        let candidates = scan_ocr_candidates(&ocr);
        assert_eq!(candidates, vec![VALID_SK.to_string()]);
    }

    #[test]
    fn closest_candidate_respects_distance_and_country() {
        let candidates = vec![VALID_SK.to_string(), VALID_CZ.to_string()];

        // One dropped digit → distance 1
        let broken = &VALID_SK[..23];
        assert_eq!(
            closest_candidate(broken, &candidates),
            Some(VALID_SK.to_string())
        );

        // Country mismatch: a broken DE IBAN never matches SK/CZ candidates
        assert_eq!(closest_candidate("DE8937040044053201300", &candidates), None);

        // Too far: a mostly different SK IBAN
        assert_eq!(
            closest_candidate("SK0000000000000000000000", &candidates),
            None
        );
    }

    #[test]
    fn reverify_prompt_lists_diagnostics() {
        let valid = vec![serde_json::json!({"invoiceNumber": "FV1", "iban": VALID_SK})];
        let invalid = vec![
            serde_json::json!({"invoiceNumber": "FV2", "iban": &VALID_SK[..23]}),
            serde_json::json!({"invoiceNumber": "FV3", "iban": "garbage"}),
        ];
        let prompt = build_reverify_prompt(&valid, &invalid);
        assert!(prompt.contains("FV1"));
        assert!(prompt.contains("TOO SHORT: missing 1 digits"));
        assert!(prompt.contains("INVALID FORMAT"));
    }

    #[tokio::test]
    async fn reverify_accepts_only_requested_and_valid_rows() {
        use crate::backends::MockBackend;

        let backend = MockBackend::new();
        backend.push_ok(serde_json::json!({"rows": [
            // Requested, valid → accepted
            {"invoiceNumber": "FV2", "variableSymbol": "2", "amount": 10.0, "iban": VALID_SK},
            // Requested, still broken → dropped
            {"invoiceNumber": "FV3", "iban": "SK00"},
            // Not requested → dropped
            {"invoiceNumber": "FV9", "iban": VALID_CZ},
        ]}));
        let backend: Arc<dyn ModelBackend> = Arc::new(backend);

        let invalid = vec![
            serde_json::json!({"invoiceNumber": "FV2", "iban": &VALID_SK[..23]}),
            serde_json::json!({"invoiceNumber": "FV3", "iban": "SK00"}),
        ];
        let accepted = reverify_rows(
            &backend,
            DocType::Drawdown,
            &[],
            &invalid,
            &[vec![0u8; 4]],
        )
        .await
        .unwrap();

        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0]["invoiceNumber"], "FV2");
        assert_eq!(accepted[0]["iban"], VALID_SK);
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("  FV-2311 "), "fv-2311");
    }
}
