//! Domain records persisted through repositories.
//!
//! # Responsibility
//! - Define the record and key shapes stored by the price dashboard.
//!
//! # Invariants
//! - Every record embeds the fields of its key.
//! - Keys serialize to flat objects of scalar fields.

pub mod price;
