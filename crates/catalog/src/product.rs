use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warehouse_core::{CategoryId, DomainError, DomainResult, Entity, Price, ProductId, SupplierId};

use crate::ensure_max_chars;

/// Unit of measure used when a product is registered without one.
pub const DEFAULT_UNIT: &str = "шт";

/// Catalog product.
///
/// `price` is the *current* reference price. Document lines copy it at
/// creation time, so later changes here never alter posted documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub article: String,
    pub name: String,
    pub unit: String,
    pub price: Price,
    pub category_id: Option<CategoryId>,
    pub supplier_id: Option<SupplierId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> ProductId {
        self.id
    }
}

/// Input for registering a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub article: String,
    pub name: String,
    pub unit: Option<String>,
    pub price: Price,
    pub category_id: Option<CategoryId>,
    pub supplier_id: Option<SupplierId>,
}

impl NewProduct {
    pub fn new(article: impl Into<String>, name: impl Into<String>, price: Price) -> Self {
        Self {
            article: article.into(),
            name: name.into(),
            unit: None,
            price,
            category_id: None,
            supplier_id: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.article.trim().is_empty() {
            return Err(DomainError::validation("article cannot be empty"));
        }
        ensure_max_chars("article", self.article.trim(), 50)?;
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        ensure_max_chars("name", self.name.trim(), 200)?;
        if let Some(unit) = &self.unit {
            if unit.trim().is_empty() {
                return Err(DomainError::validation("unit cannot be blank"));
            }
            ensure_max_chars("unit", unit, 20)?;
        }
        Ok(())
    }

    /// Unit of measure with the catalog default applied.
    pub fn unit_or_default(&self) -> &str {
        self.unit.as_deref().unwrap_or(DEFAULT_UNIT)
    }

    /// Replace every editable field of `existing`, keeping its id and
    /// creation time.
    pub fn apply_to(self, existing: &Product, now: DateTime<Utc>) -> Product {
        Product {
            created_at: existing.created_at,
            ..self.into_product(existing.id, now)
        }
    }

    /// Materialise the row once storage has assigned an id.
    pub fn into_product(self, id: ProductId, now: DateTime<Utc>) -> Product {
        let unit = self.unit_or_default().to_string();
        Product {
            id,
            article: self.article.trim().to_string(),
            name: self.name.trim().to_string(),
            unit,
            price: self.price,
            category_id: self.category_id,
            supplier_id: self.supplier_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(v: rust_decimal::Decimal) -> Price {
        Price::new(v).unwrap()
    }

    #[test]
    fn blank_article_is_rejected() {
        let p = NewProduct::new("  ", "Bolt", price(dec!(1)));
        match p.validate() {
            Err(DomainError::Validation(msg)) if msg.contains("article") => {}
            other => panic!("expected article validation error, got {other:?}"),
        }
    }

    #[test]
    fn default_unit_is_applied() {
        let p = NewProduct::new("A-1", "Bolt", price(dec!(1.5)));
        p.validate().unwrap();
        let row = p.into_product(ProductId::new(7), Utc::now());
        assert_eq!(row.unit, DEFAULT_UNIT);
        assert_eq!(row.id(), ProductId::new(7));
        assert_eq!(row.price.to_string(), "1.50");
    }

    #[test]
    fn names_longer_than_the_column_are_rejected() {
        let p = NewProduct::new("A-1", "д".repeat(200), price(dec!(1)));
        assert!(p.validate().is_ok());

        let p = NewProduct::new("A-1", "д".repeat(201), price(dec!(1)));
        match p.validate() {
            Err(DomainError::Validation(msg)) => assert!(msg.contains("200"), "{msg}"),
            other => panic!("expected name length error, got {other:?}"),
        }

        let mut p = NewProduct::new("A-1", "Bolt", price(dec!(1)));
        p.unit = Some("u".repeat(21));
        assert!(p.validate().is_err());
    }

    #[test]
    fn edits_keep_id_and_creation_time() {
        let created = Utc::now() - chrono::Duration::days(3);
        let original =
            NewProduct::new("A-1", "Bolt", price(dec!(1))).into_product(ProductId::new(4), created);

        let now = Utc::now();
        let edited = NewProduct::new("A-1", "Bolt M8", price(dec!(2))).apply_to(&original, now);
        assert_eq!(edited.id, original.id);
        assert_eq!(edited.created_at, created);
        assert_eq!(edited.updated_at, now);
        assert_eq!(edited.name, "Bolt M8");
    }
}
