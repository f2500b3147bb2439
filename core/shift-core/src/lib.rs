//! # shift-core
//!
//! Domain logic for shift-based production tracking, shared by the `shiftd`
//! daemon and the `shiftctl` client.
//!
//! ## Design Principles
//!
//! - **Pure**: no I/O. Persistence, scheduling and transport live in `shiftd`.
//! - **Incremental**: production is only ever derived per interval by
//!   [`accumulator`]; nothing else multiplies elapsed time by speed.
//! - **Total clock**: every instant maps to exactly one shift window.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shift_core::{ShiftClock, incremental_delta};
//!
//! let clock = ShiftClock::default();
//! let window = clock.window(now);
//! let units = incremental_delta(last_update, now, speed);
//! ```

pub mod accumulator;
pub mod archive;
pub mod clock;
pub mod error;
pub mod types;

pub use accumulator::{
    accrue, book_downtime, incremental_delta, window_report, windowed_status_breakdown,
    Accrual, DowntimeBooking, StatusBreakdown, WindowReport,
};
pub use archive::{checksum, seal, ArchiveEntry, ArchiveSnapshot, SealedSnapshot};
pub use clock::{parse_timestamp, ShiftClock, ShiftWindow};
pub use error::{Result, ShiftError};
pub use types::*;
