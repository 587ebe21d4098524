//! Products domain: the business record written alongside outbox rows.

pub mod product;

pub use product::{CreateProduct, Product, ProductCreated, PRODUCT_CREATED};
