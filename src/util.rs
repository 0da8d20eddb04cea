//! Small shared helpers used across components.

/// Current Unix timestamp in seconds, via `chrono` (the teacher's choice for
/// every other timestamp in this crate).
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
