use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    // a clock before 1970 is not something we recover from
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    dur.as_secs() as i64
}
