use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Clock seam so `created_at` and lockfile timestamps are fixable in tests.
pub trait Clock: Send + Sync {
    /// RFC 3339 UTC timestamp, `Z` suffix.
    fn now_rfc3339(&self) -> String;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        let now = OffsetDateTime::now_utc();
        now.format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

/// Fixed timestamp for deterministic builds in tests.
pub struct FixedClock(pub String);

impl Clock for FixedClock {
    fn now_rfc3339(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_emits_rfc3339() {
        let stamp = SystemClock.now_rfc3339();
        assert!(OffsetDateTime::parse(&stamp, &Rfc3339).is_ok(), "{stamp}");
    }

    #[test]
    fn fixed_clock_is_fixed() {
        let clock = FixedClock("2024-01-02T03:04:05Z".to_string());
        assert_eq!(clock.now_rfc3339(), clock.now_rfc3339());
    }
}
