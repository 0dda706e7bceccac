//! Lease expiry scheduling.
//!
//! The scheduler keeps every pending expiry in one ordered index and drives a
//! single underlying timer, the [`Alarm`], that is always armed for the
//! earliest expiry. However many sessions are tracked, only one timer is
//! outstanding; renewing a lease costs an O(log n) index update.
//!
//! The alarm is a trait so the ordering logic can be tested without a
//! runtime. The server uses [`SleepAlarm`], a single re-armable
//! [`tokio::time::Sleep`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::pin::Pin;

use tokio::time::{Instant, Sleep};

/// The single timer driven by a [`LeaseScheduler`].
pub trait Alarm {
    /// Arms the timer for `deadline`, replacing any earlier arming.
    fn arm(&mut self, deadline: Instant);

    /// Cancels the timer.
    fn disarm(&mut self);
}

/// Orders keys by expiry and keeps the [`Alarm`] set to the earliest one.
///
/// Ties are broken by insertion order. A key is present at most once;
/// scheduling it again moves it.
#[derive(Debug)]
pub struct LeaseScheduler<K, A> {
    queue: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    sequence: u64,
    armed: Option<Instant>,
    alarm: A,
}

impl<K, A> LeaseScheduler<K, A>
where
    K: Clone + Eq + Hash,
    A: Alarm,
{
    pub fn new(alarm: A) -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            sequence: 0,
            armed: None,
            alarm,
        }
    }

    /// Sets the expiry of `key`, replacing any previous one.
    pub fn schedule(&mut self, key: K, expiry: Instant) {
        self.remove_entry(&key);

        let slot = (expiry, self.sequence);
        self.sequence += 1;
        self.queue.insert(slot, key.clone());
        self.index.insert(key, slot);

        self.rearm();
    }

    /// Removes the expiry of `key`. Returns false if none was scheduled.
    pub fn cancel(&mut self, key: &K) -> bool {
        let removed = self.remove_entry(key);
        if removed {
            self.rearm();
        }
        removed
    }

    /// Handles the alarm firing at `now`.
    ///
    /// Returns every key whose expiry has been reached, earliest first. The
    /// alarm is then re-armed for whatever remains, including the case where
    /// it fired before the earliest expiry and nothing is due yet.
    pub fn on_wake(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.index.remove(&key);
            expired.push(key);
        }

        // The fired alarm is spent, so arm or disarm it even if the minimum is unchanged.
        self.apply(self.next_expiry());

        expired
    }

    fn remove_entry(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    fn rearm(&mut self) {
        let next = self.next_expiry();
        if next != self.armed {
            self.apply(next);
        }
    }

    fn apply(&mut self, next: Option<Instant>) {
        match next {
            Some(deadline) => self.alarm.arm(deadline),
            None => self.alarm.disarm(),
        }
        self.armed = next;
    }

    /// The earliest scheduled expiry.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue.first_key_value().map(|((expiry, _), _)| *expiry)
    }

    /// The deadline the alarm is currently armed for.
    pub fn armed(&self) -> Option<Instant> {
        self.armed
    }

    pub fn expiry_of(&self, key: &K) -> Option<Instant> {
        self.index.get(key).map(|(expiry, _)| *expiry)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn alarm(&self) -> &A {
        &self.alarm
    }

    pub fn alarm_mut(&mut self) -> &mut A {
        &mut self.alarm
    }
}

/// [`Alarm`] backed by one tokio [`Sleep`] that is reset on every arming.
#[derive(Debug)]
pub struct SleepAlarm {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl SleepAlarm {
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep_until(Instant::now())),
            armed: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Completes when the armed deadline is reached.
    ///
    /// Only poll this while [`is_armed`](Self::is_armed) is true; a disarmed
    /// alarm keeps its last (already elapsed) deadline.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await;
    }
}

impl Default for SleepAlarm {
    fn default() -> Self {
        Self::new()
    }
}

impl Alarm for SleepAlarm {
    fn arm(&mut self, deadline: Instant) {
        self.sleep.as_mut().reset(deadline);
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum AlarmCall {
        Arm(Instant),
        Disarm,
    }

    /// Alarm that records every call made to it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingAlarm {
        pub(crate) calls: Vec<AlarmCall>,
        pub(crate) deadline: Option<Instant>,
    }

    impl Alarm for RecordingAlarm {
        fn arm(&mut self, deadline: Instant) {
            self.calls.push(AlarmCall::Arm(deadline));
            self.deadline = Some(deadline);
        }

        fn disarm(&mut self) {
            self.calls.push(AlarmCall::Disarm);
            self.deadline = None;
        }
    }

    fn scheduler() -> LeaseScheduler<&'static str, RecordingAlarm> {
        LeaseScheduler::new(RecordingAlarm::default())
    }

    fn assert_single_timer(scheduler: &LeaseScheduler<&'static str, RecordingAlarm>) {
        assert_eq!(scheduler.armed(), scheduler.next_expiry());
        assert_eq!(scheduler.alarm().deadline, scheduler.next_expiry());
    }

    #[test]
    fn test_alarm_tracks_earliest_expiry() {
        let base = Instant::now();
        let mut scheduler = scheduler();

        scheduler.schedule("a", base + Duration::from_secs(30));
        scheduler.schedule("b", base + Duration::from_secs(10));
        scheduler.schedule("c", base + Duration::from_secs(20));
        assert_single_timer(&scheduler);
        assert_eq!(scheduler.armed(), Some(base + Duration::from_secs(10)));

        // Inserting a later entry must not touch the alarm.
        let calls = scheduler.alarm().calls.len();
        scheduler.schedule("d", base + Duration::from_secs(40));
        assert_eq!(scheduler.alarm().calls.len(), calls);
        assert_single_timer(&scheduler);
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let base = Instant::now();
        let mut scheduler = scheduler();

        scheduler.schedule("a", base + Duration::from_secs(5));
        scheduler.schedule("b", base + Duration::from_secs(10));
        scheduler.schedule("a", base + Duration::from_secs(15));

        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.expiry_of(&"a"), Some(base + Duration::from_secs(15)));
        assert_eq!(scheduler.armed(), Some(base + Duration::from_secs(10)));
        assert_single_timer(&scheduler);
    }

    #[test]
    fn test_cancel_rearms_and_disarms() {
        let base = Instant::now();
        let mut scheduler = scheduler();

        scheduler.schedule("a", base + Duration::from_secs(5));
        scheduler.schedule("b", base + Duration::from_secs(10));

        assert!(scheduler.cancel(&"a"));
        assert_eq!(scheduler.armed(), Some(base + Duration::from_secs(10)));
        assert!(!scheduler.cancel(&"a"));

        assert!(scheduler.cancel(&"b"));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.armed(), None);
        assert_eq!(scheduler.alarm().calls.last(), Some(&AlarmCall::Disarm));
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let base = Instant::now();
        let expiry = base + Duration::from_secs(3);
        let mut scheduler = scheduler();

        scheduler.schedule("first", expiry);
        scheduler.schedule("second", expiry);
        scheduler.schedule("third", expiry);

        assert_eq!(scheduler.on_wake(expiry), vec!["first", "second", "third"]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.armed(), None);
    }

    #[test]
    fn test_on_wake_pops_due_entries_only() {
        let base = Instant::now();
        let mut scheduler = scheduler();

        scheduler.schedule("a", base + Duration::from_secs(1));
        scheduler.schedule("b", base + Duration::from_secs(2));
        scheduler.schedule("c", base + Duration::from_secs(9));

        let expired = scheduler.on_wake(base + Duration::from_secs(2));
        assert_eq!(expired, vec!["a", "b"]);
        assert_eq!(scheduler.armed(), Some(base + Duration::from_secs(9)));
        assert_single_timer(&scheduler);
    }

    #[test]
    fn test_early_wake_rearms_for_residual() {
        let base = Instant::now();
        let expiry = base + Duration::from_secs(10);
        let mut scheduler = scheduler();
        scheduler.schedule("a", expiry);

        let calls = scheduler.alarm().calls.len();
        let expired = scheduler.on_wake(base + Duration::from_secs(9));

        assert!(expired.is_empty());
        assert_eq!(scheduler.alarm().calls.len(), calls + 1);
        assert_eq!(scheduler.alarm().calls.last(), Some(&AlarmCall::Arm(expiry)));
        assert_single_timer(&scheduler);
    }

    #[test]
    fn test_wake_on_empty_scheduler_disarms() {
        let mut scheduler = scheduler();
        assert!(scheduler.on_wake(Instant::now()).is_empty());
        assert_eq!(scheduler.armed(), None);
        assert_eq!(scheduler.alarm().calls, vec![AlarmCall::Disarm]);
    }

    #[test]
    fn test_wake_expiring_last_entry_disarms() {
        let base = Instant::now();
        let mut scheduler = scheduler();
        scheduler.schedule("a", base + Duration::from_secs(1));

        assert_eq!(scheduler.on_wake(base + Duration::from_secs(1)), vec!["a"]);
        assert_eq!(scheduler.alarm().calls.last(), Some(&AlarmCall::Disarm));
        assert_single_timer(&scheduler);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_alarm_fires_at_deadline() {
        let mut alarm = SleepAlarm::new();
        assert!(!alarm.is_armed());

        let start = Instant::now();
        alarm.arm(start + Duration::from_secs(5));
        assert!(alarm.is_armed());

        alarm.fired().await;
        assert!(Instant::now() >= start + Duration::from_secs(5));

        alarm.disarm();
        assert!(!alarm.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_alarm_rearm_replaces_deadline() {
        let mut alarm = SleepAlarm::new();
        let start = Instant::now();

        alarm.arm(start + Duration::from_secs(60));
        alarm.arm(start + Duration::from_secs(2));
        alarm.fired().await;

        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(60));
    }
}
