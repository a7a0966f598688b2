#![allow(dead_code)]

pub mod frames;
pub mod service_guard;

pub use frames::{collect_for, next_frame, wait_for_frame};
pub use service_guard::{process_is_running, ServiceGuard};
