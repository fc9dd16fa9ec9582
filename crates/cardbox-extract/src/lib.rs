//! Heuristic field extraction from OCR'd business-card lines.

use cardbox_core::CardFields;
use regex::Regex;
use thiserror::Error;

pub const CRATE_NAME: &str = "cardbox-extract";

/// The positional company/name/title assumption needs this many lines.
const MIN_LINES: usize = 3;

const EMAIL_PATTERN: &str = r"[a-zA-Z0-9+_.-]+@[0-9a-zA-Z][.\-0-9a-zA-Z]*\.[a-zA-Z]+";
const PHONE_PATTERN: &str = r"\(?\+?[\d ]*\d{2,}\)?[\d\- ]{7,}";

/// Romanized tokens that mark Korean street addresses on printed cards.
pub const KOREAN_ADDRESS_MARKERS: [&str; 8] = [
    "-gu", "-ro", "-do", " gu", " ro", " do", " seoul", " korea",
];

const DEFAULT_MIN_MARKERS: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("expected at least 3 detected lines, got {got}")]
    InsufficientLines { got: usize },
}

/// Locale-specific heuristic deciding whether a detected line is a street
/// address. Implementations must be cheap; every line of every card goes
/// through this.
pub trait AddressMatcher: Send + Sync {
    fn is_address(&self, line: &str) -> bool;
}

/// Marker-membership matcher for Korean addresses. A line qualifies when at
/// least `min_markers` distinct markers appear in its lowercased form;
/// repeats of one marker count once.
#[derive(Debug, Clone)]
pub struct KoreanAddressMatcher {
    markers: Vec<&'static str>,
    min_markers: usize,
}

impl KoreanAddressMatcher {
    pub fn new() -> Self {
        Self {
            markers: KOREAN_ADDRESS_MARKERS.to_vec(),
            min_markers: DEFAULT_MIN_MARKERS,
        }
    }

    /// Number of distinct markers present in `line`.
    pub fn matching_markers(&self, line: &str) -> usize {
        let lowered = line.to_lowercase();
        self.markers
            .iter()
            .filter(|marker| lowered.contains(*marker))
            .count()
    }
}

impl Default for KoreanAddressMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressMatcher for KoreanAddressMatcher {
    fn is_address(&self, line: &str) -> bool {
        self.matching_markers(line) >= self.min_markers
    }
}

/// Extracts card fields from an ordered list of OCR lines.
///
/// The first three lines are taken positionally as company, name, and job
/// title (printed cards put them there often enough that the heuristic has
/// stuck; it is not verified). Email, phone, and address are regex/marker
/// scans over every line, and a later line's match replaces an earlier one.
pub struct FieldExtractor {
    email_re: Regex,
    phone_re: Regex,
    address: Box<dyn AddressMatcher>,
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self::with_address_matcher(Box::new(KoreanAddressMatcher::new()))
    }

    /// Swap in a different locale's address heuristic.
    pub fn with_address_matcher(address: Box<dyn AddressMatcher>) -> Self {
        Self {
            email_re: Regex::new(EMAIL_PATTERN).unwrap(),
            phone_re: Regex::new(PHONE_PATTERN).unwrap(),
            address,
        }
    }

    pub fn extract(&self, lines: &[String]) -> Result<CardFields, ExtractError> {
        if lines.len() < MIN_LINES {
            return Err(ExtractError::InsufficientLines { got: lines.len() });
        }
        let mut fields = CardFields {
            company: Some(lines[0].clone()),
            name: Some(lines[1].clone()),
            job_title: Some(lines[2].clone()),
            ..CardFields::default()
        };
        for line in lines {
            if let Some(found) = self.email_re.find(line) {
                fields.email = Some(found.as_str().to_string());
            }
            if self.address.is_address(line) {
                fields.addr = Some(line.clone());
            }
            if let Some(found) = self.phone_re.find(line) {
                fields.phone_number = Some(found.as_str().to_string());
            }
        }
        Ok(fields)
    }
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}
