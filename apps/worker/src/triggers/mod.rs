//! Producers that feed the scan queue without a caller
//!
//! - [`ScanScheduler`]: startup and periodic full scans of every library
//! - [`LibraryWatcher`]: debounced filesystem notifications turned into
//!   directory or library scans

pub mod schedule;
pub mod watch;

pub use schedule::{ScanSchedule, ScanScheduler};
pub use watch::{LibraryWatcher, WatchConfig};
