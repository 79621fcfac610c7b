//! Document type and status state machine.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use warehouse_core::DomainError;

/// Direction of stock movement a document describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Goods received (increases stock).
    Income,
    /// Goods shipped out (decreases stock).
    Expense,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Income => "income",
            DocumentType::Expense => "expense",
        }
    }

    /// Prefix used in human-readable document numbers.
    pub fn number_prefix(self) -> &'static str {
        match self {
            DocumentType::Income => "ПН",
            DocumentType::Expense => "РН",
        }
    }
}

/// Posting lifecycle: `draft -> posted -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Posted,
    Cancelled,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 3] = [
        DocumentStatus::Draft,
        DocumentStatus::Posted,
        DocumentStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Posted => "posted",
            DocumentStatus::Cancelled => "cancelled",
        }
    }

    /// The only legal moves are `draft -> posted` and `posted -> cancelled`.
    /// Deleting a draft is not a status transition.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Draft, DocumentStatus::Posted)
                | (DocumentStatus::Posted, DocumentStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == DocumentStatus::Cancelled
    }
}

macro_rules! impl_text_enum {
    ($t:ty, $name:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $variant.as_str() {
                        return Ok($variant);
                    }
                )+
                Err(DomainError::validation(format!("unknown {}: {s:?}", $name)))
            }
        }
    };
}

impl_text_enum!(DocumentType, "document type", [DocumentType::Income, DocumentType::Expense]);
impl_text_enum!(
    DocumentStatus,
    "document status",
    [DocumentStatus::Draft, DocumentStatus::Posted, DocumentStatus::Cancelled]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips() {
        for status in DocumentStatus::ALL {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert_eq!("expense".parse::<DocumentType>().unwrap(), DocumentType::Expense);
        assert!("Posted".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn only_forward_transitions_are_legal() {
        use DocumentStatus::*;
        assert!(Draft.can_transition_to(Posted));
        assert!(Posted.can_transition_to(Cancelled));
        assert!(!Draft.can_transition_to(Cancelled));
        assert!(!Posted.can_transition_to(Posted));
        assert!(!Cancelled.can_transition_to(Draft));
        assert!(!Cancelled.can_transition_to(Posted));
        assert!(Cancelled.is_terminal());
    }
}
