// ── Dirty set ──
//
// Entities waiting to be reconciled with one cloud. Flaggers mutate it
// through `flag`; the REST worker pops the most urgent ready entry with
// `next` and sleeps on `notified` when nothing is ready.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::entity::{Action, Entity, Status};

/// Worker wake-up when nothing at all is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// A mutation of one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Flag {
    /// Add actions. A new entry starts with `remote` and is ready now.
    Set {
        action: Action,
        remote: Option<DateTime<Utc>>,
    },
    /// Remove actions. An entry left without actions is dropped unless it
    /// is throttled, in which case it lingers until its wake-up.
    Clear(Action),
    /// Values up to `remote` were pushed; throttle the next push.
    Advance { remote: Option<DateTime<Utc>> },
    /// Processing failed; park the entry until the next initial sync.
    Error(String),
}

impl Flag {
    pub fn set(action: Action) -> Self {
        Self::Set {
            action,
            remote: None,
        }
    }
}

/// Result of a [`DirtySet::flag`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing changed (suppressed or no such entry).
    Unchanged,
    Updated(Status),
    Removed,
}

/// Outcome of [`DirtySet::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    Ready(Entity, Status),
    /// Nothing is ready; look again at the given instant.
    Idle(Instant),
}

#[derive(Default)]
pub struct DirtySet {
    entries: Mutex<HashMap<Entity, Status>>,
    signal: Notify,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Entity, Status>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `flag` to `entity`. `sleep` is the entity's minimum push
    /// interval.
    pub fn flag(&self, entity: Entity, flag: Flag, sleep: Duration) -> Transition {
        let now = Instant::now();
        let mut entries = self.entries();

        let transition = match flag {
            Flag::Set { action, remote } => {
                if action.is_empty() {
                    return Transition::Unchanged;
                }
                if !entity.is_device() && device_pending(&entries, &entity.device) {
                    return Transition::Unchanged;
                }
                let status = entries
                    .entry(entity)
                    .and_modify(|s| s.action |= action)
                    .or_insert_with(|| Status {
                        remote,
                        action,
                        wakeup: now,
                        sleep: Duration::ZERO,
                        error: None,
                    });
                status.sleep = sleep;
                Transition::Updated(status.clone())
            }
            Flag::Clear(action) => {
                let Some(status) = entries.get_mut(&entity) else {
                    return Transition::Unchanged;
                };
                status.action.remove(action);
                if action.contains(Action::ERROR) {
                    status.error = None;
                }
                if !status.action.is_empty() {
                    Transition::Updated(status.clone())
                } else if status.sleep.is_zero() {
                    entries.remove(&entity);
                    Transition::Removed
                } else {
                    status.wakeup = now + status.sleep;
                    Transition::Updated(status.clone())
                }
            }
            Flag::Advance { remote } => {
                let Some(status) = entries.get_mut(&entity) else {
                    return Transition::Unchanged;
                };
                status.remote = remote;
                status.sleep = sleep;
                status.wakeup = now + sleep;
                Transition::Updated(status.clone())
            }
            Flag::Error(message) => {
                let status = entries
                    .entry(entity)
                    .or_insert_with(|| Status::new(Action::NONE, None));
                status.action |= Action::ERROR;
                status.error = Some(message);
                Transition::Updated(status.clone())
            }
        };

        if matches!(&transition, Transition::Updated(status) if is_ready(status, now)) {
            self.signal.notify_one();
        }
        transition
    }

    /// Pick the most urgent ready entry.
    ///
    /// Devices come first, then entities whose remote counterpart does
    /// not exist, then the entity with the oldest remote time. Errored
    /// entries are skipped and entries left without actions are dropped.
    pub fn next(&self, now: Instant) -> Next {
        let mut entries = self.entries();
        entries.retain(|_, s| !s.action.is_empty() || s.wakeup > now);

        let mut wake = now + IDLE_WAKEUP;
        let mut best: Option<(&Entity, &Status)> = None;
        for (entity, status) in entries.iter() {
            if status.action.contains(Action::ERROR) {
                continue;
            }
            if status.wakeup > now {
                wake = wake.min(status.wakeup);
                continue;
            }
            if status.action.is_empty() {
                continue;
            }
            if best.is_none_or(|(e, s)| rank(entity, status) < rank(e, s)) {
                best = Some((entity, status));
            }
        }

        match best {
            Some((entity, status)) => Next::Ready(entity.clone(), status.clone()),
            None => Next::Idle(wake),
        }
    }

    /// Resolves once a flag leaves an entry ready to process.
    pub async fn notified(&self) {
        self.signal.notified().await;
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.entries().clear();
    }

    pub fn get(&self, entity: &Entity) -> Option<Status> {
        self.entries().get(entity).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copy of every entry, ordered by entity.
    pub fn snapshot(&self) -> Vec<(Entity, Status)> {
        let mut out: Vec<_> = self
            .entries()
            .iter()
            .map(|(e, s)| (e.clone(), s.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn is_ready(status: &Status, now: Instant) -> bool {
    !status.action.is_empty() && !status.action.contains(Action::ERROR) && status.wakeup <= now
}

fn device_pending(entries: &HashMap<Entity, Status>, device: &str) -> bool {
    entries
        .get(&Entity::device(device))
        .is_some_and(|s| s.action.contains(Action::CREATE))
}

fn rank(entity: &Entity, status: &Status) -> (u8, Option<DateTime<Utc>>, Instant) {
    let class = if entity.is_device() {
        0
    } else if status.action.contains(Action::CREATE) {
        1
    } else {
        2
    };
    (class, status.remote, status.wakeup)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    fn ready(set: &DirtySet) -> Entity {
        match set.next(Instant::now()) {
            Next::Ready(entity, _) => entity,
            Next::Idle(_) => panic!("expected a ready entry"),
        }
    }

    #[tokio::test]
    async fn unexisting_entities_take_priority() {
        let set = DirtySet::new();
        set.flag(
            Entity::sensor("d3", "old"),
            Flag::Set {
                action: Action::SYNC,
                remote: Some(at(1)),
            },
            Duration::ZERO,
        );
        set.flag(Entity::device("d1"), Flag::set(Action::CREATE), Duration::ZERO);
        // Suppressed while d1 is pending creation.
        assert_eq!(
            set.flag(Entity::sensor("d1", "s1"), Flag::set(Action::CREATE), Duration::ZERO),
            Transition::Unchanged
        );
        set.flag(Entity::sensor("d2", "s2"), Flag::set(Action::CREATE), Duration::ZERO);

        assert_eq!(ready(&set), Entity::device("d1"));
        assert_eq!(
            set.flag(Entity::device("d1"), Flag::Clear(Action::CREATE), Duration::ZERO),
            Transition::Removed
        );

        // Creating d1 seeds its sensor; both unexisting children beat the
        // stale sensor.
        set.flag(Entity::sensor("d1", "s1"), Flag::set(Action::CREATE), Duration::ZERO);
        let first = ready(&set);
        assert!(first == Entity::sensor("d1", "s1") || first == Entity::sensor("d2", "s2"));
        set.flag(first, Flag::Clear(Action::CREATE), Duration::ZERO);
        let second = ready(&set);
        assert_ne!(second, Entity::sensor("d3", "old"));
        set.flag(second, Flag::Clear(Action::CREATE), Duration::ZERO);
        assert_eq!(ready(&set), Entity::sensor("d3", "old"));
    }

    #[tokio::test]
    async fn oldest_remote_time_first() {
        let set = DirtySet::new();
        for (id, secs) in [("a", 30), ("b", 10), ("c", 20)] {
            set.flag(
                Entity::sensor("d", id),
                Flag::Set {
                    action: Action::SYNC,
                    remote: Some(at(secs)),
                },
                Duration::ZERO,
            );
        }
        assert_eq!(ready(&set), Entity::sensor("d", "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn advance_throttles_until_wakeup() {
        let set = DirtySet::new();
        let entity = Entity::sensor("d", "s");
        set.flag(entity.clone(), Flag::set(Action::SYNC), Duration::from_secs(5));
        set.flag(
            entity.clone(),
            Flag::Advance {
                remote: Some(at(9)),
            },
            Duration::from_secs(5),
        );

        let now = Instant::now();
        assert_eq!(set.next(now), Next::Idle(now + Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        let Next::Ready(_, status) = set.next(Instant::now()) else {
            panic!("entry should be ready");
        };
        assert_eq!(status.remote, Some(at(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_throttled_entry_lingers_then_drops() {
        let set = DirtySet::new();
        let entity = Entity::sensor("d", "s");
        set.flag(entity.clone(), Flag::set(Action::SYNC), Duration::from_secs(5));
        set.flag(entity.clone(), Flag::Clear(Action::SYNC), Duration::from_secs(5));
        assert_eq!(set.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(set.next(Instant::now()), Next::Idle(_)));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn errored_entries_are_skipped() {
        let set = DirtySet::new();
        let entity = Entity::device("d");
        set.flag(entity.clone(), Flag::set(Action::CREATE), Duration::ZERO);
        set.flag(entity.clone(), Flag::Error("HTTP 400".into()), Duration::ZERO);
        assert!(matches!(set.next(Instant::now()), Next::Idle(_)));
        assert_eq!(set.get(&entity).unwrap().error.as_deref(), Some("HTTP 400"));
    }

    #[tokio::test]
    async fn first_flag_signals_worker() {
        let set = DirtySet::new();
        set.flag(Entity::device("d"), Flag::set(Action::MODIFY), Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(1), set.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_work_signals_worker_past_parked_entries() {
        let set = DirtySet::new();
        set.flag(Entity::device("bad"), Flag::Error("HTTP 400".into()), Duration::ZERO);
        let Next::Idle(wake) = set.next(Instant::now()) else {
            panic!("errored entry must not be ready");
        };
        assert!(wake > Instant::now() + Duration::from_secs(60));

        set.flag(Entity::device("fresh"), Flag::set(Action::CREATE), Duration::ZERO);
        tokio::time::timeout(Duration::from_millis(500), set.notified())
            .await
            .unwrap();
        assert_eq!(ready(&set), Entity::device("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_flag_does_not_signal() {
        let set = DirtySet::new();
        let entity = Entity::sensor("d", "s");
        set.flag(entity.clone(), Flag::set(Action::SYNC), Duration::from_secs(5));
        set.notified().await;
        set.flag(entity.clone(), Flag::Advance { remote: None }, Duration::from_secs(5));
        set.flag(entity, Flag::set(Action::SYNC), Duration::from_secs(5));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), set.notified())
                .await
                .is_err()
        );
    }
}
