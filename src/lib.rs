//! # reltab - Versioned In-Memory Tables with Live Indexes
//!
//! reltab is an in-memory table engine built around versioned row snapshots
//! and self-maintaining sorted views. Rows carry up to three record
//! versions (original, current, proposed), every index is a live view that
//! the table keeps correct across mutations, and queries plan themselves
//! onto indexes instead of scanning.
//!
//! ## Quick Start
//!
//! ```ignore
//! use reltab::{DataType, Expr, ExprPredicate, IndexField, RowStateFilter, TableBuilder};
//!
//! let mut orders = TableBuilder::new("orders")
//!     .column("id", DataType::Int)
//!     .column("region", DataType::Text)
//!     .column("amount", DataType::Int)
//!     .build();
//!
//! orders.add_row(vec![1.into(), "EU".into(), 250.into()])?;
//!
//! let filter = ExprPredicate::new(
//!     Expr::col(1).eq(Expr::lit("EU")).and(Expr::col(2).gt(Expr::lit(100))),
//! );
//! let rows = reltab::select(
//!     &orders,
//!     Some(&filter),
//!     &[IndexField::desc(2)],
//!     RowStateFilter::CURRENT_ROWS,
//! )?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Select Planner (select)            │
//! ├──────────────────────────────────────────┤
//! │   Live Index Views (index)                │
//! │   mask + filter admission, listeners      │
//! ├──────────────────────────────────────────┤
//! │   Order-Statistics RB Tree (index::tree)  │
//! │   satellite duplicate groups, rank/select │
//! ├──────────────────────────────────────────┤
//! │   Node Arena (index::page)                │
//! │   packed (page, slot) handles             │
//! ├──────────────────────────────────────────┤
//! │   Tables, Rows, Records (rows)            │
//! │   versioned snapshots, change fan-out     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`types`]: Dynamically typed cell values with a total sort order
//! - [`expr`]: Filter expression trees and three-valued evaluation
//! - [`rows`]: Tables, versioned records, row states, edit brackets
//! - [`index`]: Reference-counted live views over a table
//! - [`select`]: Candidate analysis, index reuse, range probing

pub mod expr;
pub mod index;
pub mod rows;
pub mod select;
pub mod types;

pub use expr::{Expr, ExprPredicate, RowPredicate};
pub use index::{Index, IndexField, IndexListener, ListChange, RecordRange, RowComparer};
pub use rows::{
    DataVersion, RecordId, RecordState, RowId, RowState, RowStateFilter, Table, TableBuilder,
};
pub use select::select;
pub use types::{DataType, Value};
