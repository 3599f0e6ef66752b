//! rollcalld: attendance monitoring on top of rollcall-core.
//!
//! [`CaptureController`] runs a capture thread that feeds frames through the
//! recognition engine and an attendance worker that marks each recognized
//! identity at most once per cooldown window. [`EnrollmentRegistry`] drives
//! guided multi-angle enrollment.

pub mod attendance;
pub mod config;
pub mod controller;
pub mod device;
pub mod enrollment;
pub mod journal;
pub mod state;
pub mod store;

pub use attendance::{AttendanceDeduplicator, AttendanceSink, PersistenceError};
pub use config::Config;
pub use controller::{CaptureController, ControlError, ControllerConfig, EncodedFrame, FrameStream};
pub use enrollment::{EnrollError, Enrollee, EnrollmentRegistry};
pub use journal::JournalSink;
pub use state::{Phase, Status};
pub use store::FaceStore;
