use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relaybox_core::{DomainError, DomainResult, ProductId};
use relaybox_events::Event;

/// Event type recorded in the outbox when a product is created.
pub const PRODUCT_CREATED: &str = "product_created";

const MAX_NAME_LEN: usize = 255;

/// Business record: a product as persisted in the `products` table.
///
/// Created only through the dual-write path; never touched by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decoded `create product` request.
///
/// Server-assigned fields (`id`, timestamps) are ignored if a client sends them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    pub stock: i32,
    #[serde(default)]
    pub category: String,
}

impl CreateProduct {
    pub fn validate(&self) -> DomainResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("name must not be blank"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(DomainError::validation("price must be a non-negative number"));
        }
        if self.stock < 0 {
            return Err(DomainError::validation("stock must not be negative"));
        }
        Ok(())
    }
}

/// Event: a product was created. Serialises as the product snapshot itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProductCreated(pub Product);

impl Event for ProductCreated {
    fn event_type(&self) -> &'static str {
        PRODUCT_CREATED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relaybox_events::NewOutboxEntry;

    fn request() -> CreateProduct {
        CreateProduct {
            name: "Desk lamp".to_string(),
            description: "LED, warm white".to_string(),
            price: 24.5,
            stock: 10,
            category: "lighting".to_string(),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn blank_name_is_rejected() {
        let req = CreateProduct { name: "   ".to_string(), ..request() };
        assert!(matches!(req.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn non_finite_price_is_rejected() {
        for price in [f64::NAN, f64::INFINITY, -0.01] {
            let req = CreateProduct { price, ..request() };
            assert!(req.validate().is_err(), "price {price} should be rejected");
        }
    }

    #[test]
    fn missing_optional_fields_default_to_empty() {
        let req: CreateProduct =
            serde_json::from_str(r#"{"name":"Mug","price":3.0,"stock":1}"#).unwrap();
        assert_eq!(req.description, "");
        assert_eq!(req.category, "");
    }

    #[test]
    fn created_event_payload_is_the_product_snapshot() {
        let now = Utc::now();
        let product = Product {
            id: ProductId::new(77),
            name: "Mug".to_string(),
            description: String::new(),
            price: 3.0,
            stock: 1,
            category: "kitchen".to_string(),
            created_at: now,
            updated_at: now,
        };

        let entry = NewOutboxEntry::for_event(&ProductCreated(product.clone())).unwrap();
        assert_eq!(entry.event_type, PRODUCT_CREATED);

        let decoded: Product = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(decoded, product);
    }

    proptest! {
        #[test]
        fn negative_stock_never_validates(stock in i32::MIN..0) {
            let req = CreateProduct { stock, ..request() };
            prop_assert!(req.validate().is_err());
        }

        #[test]
        fn non_negative_values_validate(price in 0.0f64..1e9, stock in 0i32..i32::MAX) {
            let req = CreateProduct { price, stock, ..request() };
            prop_assert!(req.validate().is_ok());
        }
    }
}
