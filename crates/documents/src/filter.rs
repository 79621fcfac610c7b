use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use warehouse_core::ProductId;

use crate::document::Document;
use crate::status::{DocumentStatus, DocumentType};

/// Criteria for listing documents; every `Some` field must match.
///
/// Date bounds are inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub doc_type: Option<DocumentType>,
    pub status: Option<DocumentStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Only documents with at least one line for this product.
    pub product_id: Option<ProductId>,
}

impl DocumentFilter {
    /// Posted documents touching `product_id`, as used by movement reports.
    pub fn posted_for_product(product_id: ProductId) -> Self {
        Self {
            status: Some(DocumentStatus::Posted),
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.doc_type.is_some_and(|t| t != doc.doc_type()) {
            return false;
        }
        if self.status.is_some_and(|s| s != doc.status()) {
            return false;
        }
        if self.date_from.is_some_and(|from| doc.doc_date() < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| doc.doc_date() > to) {
            return false;
        }
        if let Some(product_id) = self.product_id {
            return doc.items().iter().any(|i| i.product_id == product_id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warehouse_core::{DocumentId, Price, Quantity};

    use crate::document::{NewDocument, NewDocumentItem};
    use crate::number::DocumentNumber;

    fn income_on(day: u32) -> Document {
        let date = NaiveDate::from_ymd_opt(2026, 10, day).unwrap();
        Document::draft(
            DocumentId::new(day as i64),
            DocumentNumber::next(DocumentType::Income, date, day - 1),
            NewDocument::new(
                DocumentType::Income,
                date,
                vec![NewDocumentItem::new(ProductId::new(7), Quantity::units(1), Price::ZERO)],
            ),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(DocumentFilter::default().matches(&income_on(1)));
    }

    #[test]
    fn date_range_is_inclusive() {
        let filter = DocumentFilter {
            date_from: NaiveDate::from_ymd_opt(2026, 10, 2),
            date_to: NaiveDate::from_ymd_opt(2026, 10, 3),
            ..DocumentFilter::default()
        };
        assert!(!filter.matches(&income_on(1)));
        assert!(filter.matches(&income_on(2)));
        assert!(filter.matches(&income_on(3)));
        assert!(!filter.matches(&income_on(4)));
    }

    #[test]
    fn product_and_status_narrow_the_match() {
        let doc = income_on(5);
        assert!(!DocumentFilter::posted_for_product(ProductId::new(7)).matches(&doc));
        let drafts = DocumentFilter {
            status: Some(DocumentStatus::Draft),
            product_id: Some(ProductId::new(7)),
            ..DocumentFilter::default()
        };
        assert!(drafts.matches(&doc));
        let other = DocumentFilter {
            product_id: Some(ProductId::new(8)),
            ..DocumentFilter::default()
        };
        assert!(!other.matches(&doc));
    }
}
