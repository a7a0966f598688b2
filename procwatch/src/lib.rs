// Job control daemon library (shared between daemon and CLI)

pub mod supervisor;

// Polling assertions used by unit and integration tests
pub mod test_utils;
