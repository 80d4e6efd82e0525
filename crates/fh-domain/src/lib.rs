//! Chart-of-accounts and category-mapping domain objects: `spec.md` §3's
//! `Account`, `Category`, `CategoryRule`, `BusinessCategoryMap` and
//! `TxnCategorization` entities.
//!
//! This crate holds plain data and the invariants that are cheap to check
//! in-process (one category per anchor account, one map row per system
//! key); storage and the categorization algorithm itself live in
//! `fh-store` and `fh-processing` respectively.

#![deny(missing_docs)]

mod account;
mod categorization;
mod category;

pub use account::{Account, AccountType};
pub use categorization::{CategorizationSource, TxnCategorization};
pub use category::{BusinessCategoryMap, Category, CategoryRule};
