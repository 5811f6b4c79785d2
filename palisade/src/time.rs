use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    since_epoch().as_secs()
}

/// Returns the current unix timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> u64 {
    since_epoch().as_millis() as u64
}

/// Returns the current unix timestamp in microseconds
#[inline]
pub fn timestamp_micros() -> u64 {
    since_epoch().as_micros() as u64
}

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock set before the unix epoch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_units_are_consistent() {
        let secs = timestamp_secs();
        let millis = timestamp_millis();
        let micros = timestamp_micros();

        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
        assert!(micros / 1000 >= millis);
        assert!(micros / 1000 - millis <= 1000);
    }
}
