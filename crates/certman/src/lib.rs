//! certman operator: manifest loading, per-request reconciliation and the
//! bounded work queue driving it.

pub mod manifest;
pub mod reconcile;
pub mod workqueue;
