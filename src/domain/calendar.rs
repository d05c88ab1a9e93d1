//! UTC calendar buckets used by the dated aggregate counters.

use time::OffsetDateTime;

/// The day, month and year containing a reference instant, in UTC.
#[derive(Debug, Clone, Copy)]
pub struct CalendarWindow {
    reference: OffsetDateTime,
}

impl CalendarWindow {
    pub fn containing(reference: OffsetDateTime) -> Self {
        Self {
            reference: reference.to_offset(time::UtcOffset::UTC),
        }
    }

    pub fn now() -> Self {
        Self::containing(OffsetDateTime::now_utc())
    }

    pub fn same_year(&self, instant: OffsetDateTime) -> bool {
        let instant = instant.to_offset(time::UtcOffset::UTC);
        instant.year() == self.reference.year()
    }

    pub fn same_month(&self, instant: OffsetDateTime) -> bool {
        let utc = instant.to_offset(time::UtcOffset::UTC);
        self.same_year(instant) && utc.month() == self.reference.month()
    }

    pub fn same_day(&self, instant: OffsetDateTime) -> bool {
        let utc = instant.to_offset(time::UtcOffset::UTC);
        utc.date() == self.reference.date()
    }
}
