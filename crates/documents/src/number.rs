//! Human-readable document numbers: `{prefix}-{YYYYMM}-{NNNN}`.

use core::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::status::DocumentType;

/// Unique document number such as `ПН-202610-0003`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentNumber(String);

impl DocumentNumber {
    /// Monthly series key shared by every number of one type in one month,
    /// e.g. `РН-202610`.
    pub fn series(doc_type: DocumentType, month: NaiveDate) -> String {
        format!("{}-{}", doc_type.number_prefix(), month.format("%Y%m"))
    }

    /// Number following `last_issued` in the series (0 for an empty series).
    pub fn next(doc_type: DocumentType, month: NaiveDate, last_issued: u32) -> Self {
        Self(format!(
            "{}-{:04}",
            Self::series(doc_type, month),
            last_issued + 1
        ))
    }

    /// Trailing sequence number, if the number has the standard shape.
    pub fn sequence(&self) -> Option<u32> {
        self.0.rsplit_once('-').and_then(|(_, seq)| seq.parse().ok())
    }

    /// Wrap a number loaded from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn belongs_to(&self, series: &str) -> bool {
        self.0
            .strip_prefix(series)
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn october() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn numbers_are_zero_padded_per_month_series() {
        assert_eq!(
            DocumentNumber::next(DocumentType::Income, october(), 0).as_str(),
            "ПН-202610-0001"
        );
        assert_eq!(
            DocumentNumber::next(DocumentType::Expense, october(), 41).as_str(),
            "РН-202610-0042"
        );
    }

    #[test]
    fn series_membership_is_exact() {
        let n = DocumentNumber::next(DocumentType::Income, october(), 2);
        assert!(n.belongs_to(&DocumentNumber::series(DocumentType::Income, october())));
        assert!(!n.belongs_to(&DocumentNumber::series(DocumentType::Expense, october())));
        assert!(!n.belongs_to("ПН-2026"));
    }

    #[test]
    fn sequence_is_parsed_from_the_suffix() {
        let n = DocumentNumber::from_stored("РН-202610-0042");
        assert_eq!(n.sequence(), Some(42));
        assert_eq!(DocumentNumber::from_stored("manual").sequence(), None);
    }
}
