use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

/// Expected topics that exist on the cluster and are not subscribed yet
pub fn discover_new_topics(
    existing: &HashSet<String>,
    expected: &BTreeSet<String>,
    subscribed: &BTreeSet<String>,
) -> BTreeSet<String> {
    expected
        .iter()
        .filter(|topic| existing.contains(*topic) && !subscribed.contains(*topic))
        .cloned()
        .collect()
}

/// Rate limit for metadata refreshes
///
/// Due immediately after construction, then once per `interval`.
#[derive(Debug)]
pub struct DiscoverySchedule {
    interval: Duration,
    last_run: Option<Instant>,
}

impl DiscoverySchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Record an attempt; failed attempts also wait a full interval
    pub fn mark_run(&mut self, now: Instant) {
        self.last_run = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set<'a>(topics: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        topics.into_iter().map(String::from).collect()
    }

    #[test]
    fn test_discover_new_topics() {
        let existing: HashSet<String> = [
            "postgres.public.orders",
            "postgres.public.users",
            "__consumer_offsets",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let expected = set(["postgres.public.orders", "postgres.public.users", "postgres.public.payments"]);

        let fresh = discover_new_topics(&existing, &expected, &BTreeSet::new());
        assert_eq!(fresh, set(["postgres.public.orders", "postgres.public.users"]));

        let subscribed = set(["postgres.public.orders"]);
        let fresh = discover_new_topics(&existing, &expected, &subscribed);
        assert_eq!(fresh, set(["postgres.public.users"]));

        let subscribed = set(["postgres.public.orders", "postgres.public.users"]);
        assert!(discover_new_topics(&existing, &expected, &subscribed).is_empty());
    }

    #[test]
    fn test_schedule() {
        let start = Instant::now();
        let mut schedule = DiscoverySchedule::new(Duration::from_secs(10));

        assert!(schedule.is_due(start));
        schedule.mark_run(start);
        assert!(!schedule.is_due(start + Duration::from_secs(9)));
        assert!(schedule.is_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_interval_is_always_due() {
        let start = Instant::now();
        let mut schedule = DiscoverySchedule::new(Duration::ZERO);
        schedule.mark_run(start);
        assert!(schedule.is_due(start));
    }
}
