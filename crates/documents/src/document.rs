use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use warehouse_core::{DocumentId, Entity, Price, ProductId, Quantity, SupplierId, UserId};

use crate::number::DocumentNumber;
use crate::status::{DocumentStatus, DocumentType};

/// Maximum length of a document comment.
pub const MAX_COMMENT_LEN: usize = 500;

/// Document-level failure (state machine guards and draft validation).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document cannot move from {from} to {to}")]
    InvalidStateTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("operation expects a {expected} document, got {actual}")]
    WrongDocumentType {
        expected: DocumentType,
        actual: DocumentType,
    },

    /// Only drafts may be edited or deleted.
    #[error("document is {status}; only drafts can be {action}")]
    NotDraft {
        status: DocumentStatus,
        action: &'static str,
    },

    #[error("document has no line items with a positive quantity")]
    Empty,

    #[error("line {line_no}: {reason}")]
    InvalidLine { line_no: u32, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// One (product, quantity, price) entry of a document.
///
/// `price` is a snapshot taken when the line was written and is independent
/// of the product's current catalog price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub price: Price,
}

impl DocumentItem {
    pub fn total(&self) -> Decimal {
        self.quantity.times(self.price)
    }
}

/// Line item as supplied by a caller, before numbering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocumentItem {
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub price: Price,
}

impl NewDocumentItem {
    pub fn new(product_id: ProductId, quantity: Quantity, price: Price) -> Self {
        Self {
            product_id,
            quantity,
            price,
        }
    }
}

fn number_lines(items: Vec<NewDocumentItem>) -> Result<Vec<DocumentItem>, DocumentError> {
    if items.is_empty() {
        return Err(DocumentError::Empty);
    }
    items
        .into_iter()
        .zip(1u32..)
        .map(|(item, line_no)| {
            if !item.quantity.is_positive() {
                return Err(DocumentError::InvalidLine {
                    line_no,
                    reason: "quantity must be positive".to_string(),
                });
            }
            Ok(DocumentItem {
                line_no,
                product_id: item.product_id,
                quantity: item.quantity,
                price: item.price,
            })
        })
        .collect()
}

fn check_comment(comment: &Option<String>) -> Result<(), DocumentError> {
    if comment
        .as_ref()
        .is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN)
    {
        return Err(DocumentError::Validation(format!(
            "comment is limited to {MAX_COMMENT_LEN} characters"
        )));
    }
    Ok(())
}

/// Caller input for a new draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub doc_type: DocumentType,
    pub doc_date: NaiveDate,
    pub supplier_id: Option<SupplierId>,
    pub author_id: Option<UserId>,
    pub comment: Option<String>,
    pub items: Vec<NewDocumentItem>,
}

impl NewDocument {
    pub fn new(doc_type: DocumentType, doc_date: NaiveDate, items: Vec<NewDocumentItem>) -> Self {
        Self {
            doc_type,
            doc_date,
            supplier_id: None,
            author_id: None,
            comment: None,
            items,
        }
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        check_comment(&self.comment)?;
        number_lines(self.items.clone()).map(|_| ())
    }
}

/// Replacement header and lines for a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftUpdate {
    pub doc_date: NaiveDate,
    pub supplier_id: Option<SupplierId>,
    pub comment: Option<String>,
    pub items: Vec<NewDocumentItem>,
}

/// Every stored column of a document, used by storage to rebuild one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentParts {
    pub id: DocumentId,
    pub doc_type: DocumentType,
    pub number: DocumentNumber,
    pub doc_date: NaiveDate,
    pub status: DocumentStatus,
    pub supplier_id: Option<SupplierId>,
    pub author_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub items: Vec<DocumentItem>,
}

/// Income or expense document with its ordered line items.
///
/// Serialize-only: stored documents are rebuilt through [`Document::restore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    id: DocumentId,
    doc_type: DocumentType,
    number: DocumentNumber,
    doc_date: NaiveDate,
    status: DocumentStatus,
    supplier_id: Option<SupplierId>,
    author_id: Option<UserId>,
    created_at: DateTime<Utc>,
    posted_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    comment: Option<String>,
    items: Vec<DocumentItem>,
}

impl Document {
    /// Build a fresh draft from validated caller input.
    pub fn draft(
        id: DocumentId,
        number: DocumentNumber,
        input: NewDocument,
        now: DateTime<Utc>,
    ) -> Result<Self, DocumentError> {
        check_comment(&input.comment)?;
        let items = number_lines(input.items)?;
        Ok(Self {
            id,
            doc_type: input.doc_type,
            number,
            doc_date: input.doc_date,
            status: DocumentStatus::Draft,
            supplier_id: input.supplier_id,
            author_id: input.author_id,
            created_at: now,
            posted_at: None,
            cancelled_at: None,
            comment: input.comment,
            items,
        })
    }

    /// Rebuild a document from stored columns.
    pub fn restore(parts: DocumentParts) -> Self {
        Self {
            id: parts.id,
            doc_type: parts.doc_type,
            number: parts.number,
            doc_date: parts.doc_date,
            status: parts.status,
            supplier_id: parts.supplier_id,
            author_id: parts.author_id,
            created_at: parts.created_at,
            posted_at: parts.posted_at,
            cancelled_at: parts.cancelled_at,
            comment: parts.comment,
            items: parts.items,
        }
    }

    pub fn doc_type(&self) -> DocumentType {
        self.doc_type
    }

    pub fn number(&self) -> &DocumentNumber {
        &self.number
    }

    pub fn doc_date(&self) -> NaiveDate {
        self.doc_date
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn author_id(&self) -> Option<UserId> {
        self.author_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.posted_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn items(&self) -> &[DocumentItem] {
        &self.items
    }

    pub fn is_draft(&self) -> bool {
        self.status == DocumentStatus::Draft
    }

    /// Sum of quantity x price over all lines.
    pub fn total_amount(&self) -> Decimal {
        self.items.iter().map(DocumentItem::total).sum()
    }

    /// Distinct products referenced by the lines, ascending.
    pub fn product_ids(&self) -> Vec<ProductId> {
        let mut ids: Vec<ProductId> = self.items.iter().map(|i| i.product_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl Entity for Document {
    type Id = DocumentId;

    fn id(&self) -> DocumentId {
        self.id
    }
}

// State machine guards. Checks never mutate; `mark_*` apply a transition that
// has already been checked.
impl Document {
    fn ensure_transition(&self, to: DocumentStatus) -> Result<(), DocumentError> {
        if !self.status.can_transition_to(to) {
            return Err(DocumentError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Guard for `draft -> posted` by an operation handling `expected` documents.
    pub fn ensure_can_post(&self, expected: DocumentType) -> Result<(), DocumentError> {
        self.ensure_transition(DocumentStatus::Posted)?;
        if self.doc_type != expected {
            return Err(DocumentError::WrongDocumentType {
                expected,
                actual: self.doc_type,
            });
        }
        if !self.items.iter().any(|i| i.quantity.is_positive()) {
            return Err(DocumentError::Empty);
        }
        Ok(())
    }

    /// Guard for `posted -> cancelled`.
    pub fn ensure_can_cancel(&self) -> Result<(), DocumentError> {
        self.ensure_transition(DocumentStatus::Cancelled)
    }

    pub fn mark_posted(&mut self, now: DateTime<Utc>) -> Result<(), DocumentError> {
        self.ensure_transition(DocumentStatus::Posted)?;
        self.status = DocumentStatus::Posted;
        self.posted_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), DocumentError> {
        self.ensure_transition(DocumentStatus::Cancelled)?;
        self.status = DocumentStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }
}

// Draft editing. Lines are immutable once the document leaves draft.
impl Document {
    fn ensure_draft(&self, action: &'static str) -> Result<(), DocumentError> {
        if !self.is_draft() {
            return Err(DocumentError::NotDraft {
                status: self.status,
                action,
            });
        }
        Ok(())
    }

    /// Replace header fields and the full line list of a draft.
    pub fn update_draft(&mut self, update: DraftUpdate) -> Result<(), DocumentError> {
        self.ensure_draft("edited")?;
        check_comment(&update.comment)?;
        let items = number_lines(update.items)?;
        self.doc_date = update.doc_date;
        self.supplier_id = update.supplier_id;
        self.comment = update.comment;
        self.items = items;
        Ok(())
    }

    pub fn ensure_deletable(&self) -> Result<(), DocumentError> {
        self.ensure_draft("deleted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn line(product: i64, qty: rust_decimal::Decimal, price: rust_decimal::Decimal) -> NewDocumentItem {
        NewDocumentItem::new(
            ProductId::new(product),
            Quantity::new(qty).unwrap(),
            Price::new(price).unwrap(),
        )
    }

    fn draft(doc_type: DocumentType, items: Vec<NewDocumentItem>) -> Document {
        Document::draft(
            DocumentId::new(1),
            DocumentNumber::next(doc_type, date(), 0),
            NewDocument::new(doc_type, date(), items),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn draft_numbers_lines_in_order() {
        let doc = draft(
            DocumentType::Income,
            vec![line(1, dec!(10), dec!(100)), line(2, dec!(1.5), dec!(3))],
        );
        assert_eq!(doc.status(), DocumentStatus::Draft);
        assert_eq!(doc.items()[0].line_no, 1);
        assert_eq!(doc.items()[1].line_no, 2);
        assert_eq!(doc.total_amount(), dec!(1004.5));
    }

    #[test]
    fn oversized_amounts_never_reach_a_draft() {
        let json = r#"{
            "doc_type": "income",
            "doc_date": "2026-10-19",
            "supplier_id": null,
            "author_id": null,
            "comment": null,
            "items": [{"product_id": 1, "quantity": "100000000000000000000", "price": "1"}]
        }"#;
        assert!(serde_json::from_str::<NewDocument>(json).is_err());

        let at_limit = draft(
            DocumentType::Income,
            vec![line(1, dec!(99999999.99), dec!(99999999.99))],
        );
        assert_eq!(at_limit.total_amount(), dec!(99999999.99) * dec!(99999999.99));
    }

    #[test]
    fn empty_or_zero_lines_are_rejected() {
        let input = NewDocument::new(DocumentType::Income, date(), vec![]);
        assert_eq!(input.validate(), Err(DocumentError::Empty));

        let input = NewDocument::new(DocumentType::Income, date(), vec![line(1, dec!(0), dec!(1))]);
        assert!(matches!(
            input.validate(),
            Err(DocumentError::InvalidLine { line_no: 1, .. })
        ));
    }

    #[test]
    fn posting_requires_matching_type() {
        let doc = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
        assert_eq!(
            doc.ensure_can_post(DocumentType::Expense),
            Err(DocumentError::WrongDocumentType {
                expected: DocumentType::Expense,
                actual: DocumentType::Income,
            })
        );
        assert_eq!(doc.ensure_can_post(DocumentType::Income), Ok(()));
    }

    #[test]
    fn status_check_precedes_type_check() {
        let mut doc = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
        doc.mark_posted(Utc::now()).unwrap();
        assert!(matches!(
            doc.ensure_can_post(DocumentType::Expense),
            Err(DocumentError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn full_lifecycle_sets_timestamps() {
        let mut doc = draft(DocumentType::Expense, vec![line(1, dec!(4), dec!(0))]);
        let posted_at = Utc::now();
        doc.mark_posted(posted_at).unwrap();
        assert_eq!(doc.posted_at(), Some(posted_at));
        doc.ensure_can_cancel().unwrap();
        doc.mark_cancelled(posted_at).unwrap();
        assert_eq!(doc.status(), DocumentStatus::Cancelled);
        assert!(doc.cancelled_at().is_some());

        // Cancelled is terminal.
        assert_eq!(
            doc.ensure_can_cancel(),
            Err(DocumentError::InvalidStateTransition {
                from: DocumentStatus::Cancelled,
                to: DocumentStatus::Cancelled,
            })
        );
    }

    #[test]
    fn cancelling_a_draft_is_rejected() {
        let doc = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
        assert_eq!(
            doc.ensure_can_cancel(),
            Err(DocumentError::InvalidStateTransition {
                from: DocumentStatus::Draft,
                to: DocumentStatus::Cancelled,
            })
        );
    }

    #[test]
    fn posted_documents_cannot_be_edited_or_deleted() {
        let mut doc = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
        doc.mark_posted(Utc::now()).unwrap();
        let update = DraftUpdate {
            doc_date: date(),
            supplier_id: None,
            comment: None,
            items: vec![line(1, dec!(99), dec!(1))],
        };
        assert!(matches!(doc.update_draft(update), Err(DocumentError::NotDraft { .. })));
        assert_eq!(doc.items()[0].quantity, Quantity::units(1));
        assert!(doc.ensure_deletable().is_err());
    }

    #[test]
    fn draft_update_replaces_lines() {
        let mut doc = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
        doc.update_draft(DraftUpdate {
            doc_date: date(),
            supplier_id: Some(SupplierId::new(3)),
            comment: Some("пересчёт".into()),
            items: vec![line(2, dec!(5), dec!(2)), line(3, dec!(1), dec!(1))],
        })
        .unwrap();
        assert_eq!(doc.items().len(), 2);
        assert_eq!(doc.product_ids(), vec![ProductId::new(2), ProductId::new(3)]);
        assert_eq!(doc.supplier_id(), Some(SupplierId::new(3)));
    }

    fn any_status() -> impl Strategy<Value = DocumentStatus> {
        prop_oneof![
            Just(DocumentStatus::Draft),
            Just(DocumentStatus::Posted),
            Just(DocumentStatus::Cancelled),
        ]
    }

    proptest! {
        /// Property: a transition succeeds exactly when the state machine allows
        /// it, and a rejected transition leaves the document untouched.
        #[test]
        fn only_legal_transitions_mutate(from in any_status(), to in any_status()) {
            let base = draft(DocumentType::Income, vec![line(1, dec!(1), dec!(1))]);
            let mut parts_doc = base.clone();
            parts_doc.status = from;
            let before = parts_doc.clone();

            let result = match to {
                DocumentStatus::Posted => parts_doc.mark_posted(Utc::now()),
                DocumentStatus::Cancelled => parts_doc.mark_cancelled(Utc::now()),
                DocumentStatus::Draft => Err(DocumentError::InvalidStateTransition { from, to }),
            };

            if from.can_transition_to(to) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(parts_doc.status(), to);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(parts_doc, before);
            }
        }
    }
}
