pub mod batch;
pub mod config;
pub mod driver;
pub mod exchange;
pub mod ids;
pub mod memory;
pub mod runtime;
pub mod scheduler;
pub mod signal;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
