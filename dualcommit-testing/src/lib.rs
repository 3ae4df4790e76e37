//! Failure injection for exercising `dualcommit` coordinators.
//!
//! Wrap the real resources in [`FaultyMessaging`] and [`FaultyStorage`],
//! share one [`FailureSimulator`] between them, and arm the failure a test
//! needs:
//!
//! ```rust,ignore
//! let simulator = FailureSimulator::new();
//! let coordinator = TransactionCoordinator::new(
//!     FaultyMessaging::new(broker.clone(), simulator.clone()),
//!     FaultyStorage::new(storage.clone(), simulator.clone()),
//! );
//!
//! simulator.fail_next_messaging_commit(MessagingFailure::AfterAcknowledge);
//! ```

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_qualifications,
    unused_results,
    unused_variables
)]

pub mod chaos;
pub mod faulty;
pub mod simulator;

pub use chaos::*;
pub use faulty::*;
pub use simulator::*;
