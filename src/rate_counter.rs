use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

const SECOND_BUCKETS: usize = 60;
const MINUTE_BUCKETS: usize = 60;

// One bucket of a ring: the wall-clock key it was last written under and
// the count accumulated while that key was current. A key of u64::MAX
// marks a bucket that has never been written.
#[derive(Clone, Copy)]
struct Bucket {
    key: u64,
    count: u64,
}

impl Bucket {
    const EMPTY: Bucket = Bucket {
        key: u64::MAX,
        count: 0,
    };
}

struct Inner {
    name: String,
    seconds: [Bucket; SECOND_BUCKETS],
    minutes: [Bucket; MINUTE_BUCKETS],
    total: u64,
}

impl Inner {
    fn add(&mut self, n: u64, now_secs: u64) {
        let sec_idx = (now_secs as usize) % SECOND_BUCKETS;
        let bucket = &mut self.seconds[sec_idx];
        if bucket.key != now_secs {
            bucket.key = now_secs;
            bucket.count = 0;
        }
        bucket.count += n;

        let now_min = now_secs / 60;
        let min_idx = (now_min as usize) % MINUTE_BUCKETS;
        let bucket = &mut self.minutes[min_idx];
        if bucket.key != now_min {
            bucket.key = now_min;
            bucket.count = 0;
        }
        bucket.count += n;

        self.total = self.total.wrapping_add(n);
    }

    fn last_second(&self, now_secs: u64) -> u64 {
        let idx = (now_secs as usize) % SECOND_BUCKETS;
        let bucket = self.seconds[idx];
        if bucket.key == now_secs {
            bucket.count
        } else {
            0
        }
    }

    fn last_minute(&self, now_secs: u64) -> u64 {
        self.seconds
            .iter()
            .filter(|b| b.key != u64::MAX && now_secs.saturating_sub(b.key) < 60)
            .map(|b| b.count)
            .sum()
    }

    fn last_hour(&self, now_secs: u64) -> u64 {
        let now_min = now_secs / 60;
        self.minutes
            .iter()
            .filter(|b| b.key != u64::MAX && now_min.saturating_sub(b.key) < 60)
            .map(|b| b.count)
            .sum()
    }
}

// A named, monotonic event counter exposing last-second, last-minute,
// last-hour, and lifetime-total reads. Safe under concurrent
// increment_by/read calls from arbitrary tasks.
pub struct RateCounter {
    inner: RwLock<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                name: name.into(),
                seconds: [Bucket::EMPTY; SECOND_BUCKETS],
                minutes: [Bucket::EMPTY; MINUTE_BUCKETS],
                total: 0,
            }),
        }
    }

    // increment_by(0) is a no-op: it still takes the write lock, so
    // callers never need to special-case it, but leaves every bucket
    // and the total unchanged.
    pub fn increment_by(&self, n: u64) {
        if n == 0 {
            return;
        }
        let now = now_secs();
        self.inner.write().add(n, now);
    }

    pub fn last_second_count(&self) -> u64 {
        self.inner.read().last_second(now_secs())
    }

    pub fn last_minute_count(&self) -> u64 {
        self.inner.read().last_minute(now_secs())
    }

    pub fn last_hour_count(&self) -> u64 {
        self.inner.read().last_hour(now_secs())
    }

    pub fn total_count(&self) -> u64 {
        self.inner.read().total
    }

    pub fn summary(&self) -> String {
        let inner = self.inner.read();
        let now = now_secs();
        format!(
            "{}: 1s={} 1m={} 1h={} total={}",
            inner.name,
            inner.last_second(now),
            inner.last_minute(now),
            inner.last_hour(now),
            inner.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_by_zero_is_noop() {
        let c = RateCounter::new("test");
        c.increment_by(5);
        let before = c.total_count();
        c.increment_by(0);
        assert_eq!(c.total_count(), before);
    }

    #[test]
    fn total_accumulates_and_windows_hold_invariant() {
        let c = RateCounter::new("test");
        c.increment_by(3);
        c.increment_by(4);
        assert_eq!(c.total_count(), 7);
        assert!(c.last_second_count() <= c.last_minute_count());
        assert!(c.last_minute_count() <= c.last_hour_count());
        assert!(c.last_hour_count() <= c.total_count());
    }

    #[test]
    fn fresh_counter_reads_zero() {
        let c = RateCounter::new("idle");
        assert_eq!(c.last_second_count(), 0);
        assert_eq!(c.last_minute_count(), 0);
        assert_eq!(c.last_hour_count(), 0);
        assert_eq!(c.total_count(), 0);
    }

    #[test]
    fn summary_contains_name_and_total() {
        let c = RateCounter::new("bytes");
        c.increment_by(42);
        let s = c.summary();
        assert!(s.contains("bytes"));
        assert!(s.contains("total=42"));
    }
}
