//! Error handling for the transfer engine
//!
//! Every fallible operation returns [`TransferError`]. Errors carry enough
//! structure for the engine to decide what to do next:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Transfer Error Taxonomy                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Fatal            │  Transient        │  Capacity / Circuit  │
//! │  • Validation     │  • Network        │  • PoolTimeout       │
//! │  • NotFound       │  • Timeout        │  • CircuitOpen       │
//! │  • Unauthorized   │  • Remote 5xx/429 │                      │
//! │  • Quota          │  • RateLimited    │                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only transient errors are retried, and only transient errors count
//! against a circuit breaker. Capacity errors are the result of a bounded
//! wait running out; circuit-open errors mean no call was attempted.

pub mod classify;
pub mod constructors;
pub mod conversions;
pub mod types;


pub use classify::ErrorClass;
pub use types::{Result, TransferError};
