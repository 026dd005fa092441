//! Step deadline tracking.
//!
//! A single background task keeps every armed deadline in a min-heap and
//! sleeps until the earliest one. Workers talk to it only through a channel
//! and learn about an expiry through the [`TimeoutHandle`] returned by
//! [`TimeoutScheduler::arm`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use common::InstanceId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// One registration per instance and step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutKey {
    pub instance_id: InstanceId,
    pub step_index: usize,
}

enum Command {
    Arm {
        key: TimeoutKey,
        deadline: Instant,
        fire: oneshot::Sender<()>,
    },
    Disarm {
        key: TimeoutKey,
    },
    Pending {
        reply: oneshot::Sender<usize>,
    },
}

/// Resolves when the registration it was returned for fires.
#[derive(Debug)]
pub struct TimeoutHandle {
    fired: oneshot::Receiver<()>,
}

impl TimeoutHandle {
    /// Waits for the deadline. Never resolves if the registration is
    /// disarmed or replaced first.
    pub async fn expired(self) {
        if self.fired.await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Waits until the registration either fires (`true`) or is cancelled
    /// (`false`).
    pub async fn fired(self) -> bool {
        self.fired.await.is_ok()
    }
}

/// Handle to the deadline task. Clones share the task, which stops once
/// every clone is dropped.
#[derive(Debug, Clone)]
pub struct TimeoutScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Arm { key, deadline, .. } => f
                .debug_struct("Arm")
                .field("key", key)
                .field("deadline", deadline)
                .finish(),
            Command::Disarm { key } => f.debug_struct("Disarm").field("key", key).finish(),
            Command::Pending { .. } => f.write_str("Pending"),
        }
    }
}

impl TimeoutScheduler {
    /// Spawns the deadline task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(receiver));
        Self { commands }
    }

    /// Registers a deadline for `(instance_id, step_index)`, replacing any
    /// earlier registration for the same pair.
    pub fn arm(&self, instance_id: InstanceId, step_index: usize, deadline: Instant) -> TimeoutHandle {
        let (fire, fired) = oneshot::channel();
        let key = TimeoutKey {
            instance_id,
            step_index,
        };
        if self
            .commands
            .send(Command::Arm {
                key,
                deadline,
                fire,
            })
            .is_err()
        {
            tracing::warn!(%instance_id, step_index, "timeout scheduler stopped; deadline not armed");
        }
        TimeoutHandle { fired }
    }

    /// Cancels the registration for `(instance_id, step_index)`, if any.
    pub fn disarm(&self, instance_id: InstanceId, step_index: usize) {
        let _ = self.commands.send(Command::Disarm {
            key: TimeoutKey {
                instance_id,
                step_index,
            },
        });
    }

    /// Number of live registrations.
    pub async fn pending(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.commands.send(Command::Pending { reply }).is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }
}

struct Registration {
    id: u64,
    fire: oneshot::Sender<()>,
}

/// Below this size the heap is never compacted.
const COMPACT_FLOOR: usize = 64;

/// State owned by the deadline task.
#[derive(Default)]
struct Deadlines {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    keys: HashMap<u64, TimeoutKey>,
    live: HashMap<TimeoutKey, Registration>,
    next_id: u64,
}

impl Deadlines {
    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn arm(&mut self, key: TimeoutKey, deadline: Instant, fire: oneshot::Sender<()>) {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Reverse((deadline, id)));
        self.keys.insert(id, key);
        if let Some(replaced) = self.live.insert(key, Registration { id, fire }) {
            self.keys.remove(&replaced.id);
            self.compact();
        }
    }

    fn disarm(&mut self, key: TimeoutKey) {
        if let Some(registration) = self.live.remove(&key) {
            self.keys.remove(&registration.id);
            self.compact();
        }
    }

    /// Drops heap entries of cancelled registrations once they outnumber
    /// the live ones.
    fn compact(&mut self) {
        if self.heap.len() <= COMPACT_FLOOR.max(2 * self.keys.len()) {
            return;
        }
        let keys = &self.keys;
        self.heap.retain(|Reverse((_, id))| keys.contains_key(id));
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            // Cancelled registrations have already left `keys`.
            let Some(key) = self.keys.remove(&id) else {
                continue;
            };
            if let Some(registration) = self.live.remove(&key) {
                tracing::debug!(
                    instance_id = %key.instance_id,
                    step_index = key.step_index,
                    "step deadline elapsed"
                );
                let _ = registration.fire.send(());
            }
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut deadlines = Deadlines::default();

    loop {
        let next_deadline = deadlines.next_deadline();

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Arm { key, deadline, fire }) => deadlines.arm(key, deadline, fire),
                Some(Command::Disarm { key }) => deadlines.disarm(key),
                Some(Command::Pending { reply }) => {
                    let _ = reply.send(deadlines.live.len());
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                deadlines.fire_due(Instant::now());
            }
        }
    }

    tracing::debug!(abandoned = deadlines.live.len(), "timeout scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let scheduler = TimeoutScheduler::spawn();
        let id = InstanceId::new();

        let handle = scheduler.arm(id, 0, Instant::now() + Duration::from_secs(5));
        assert_eq!(scheduler.pending().await, 1);

        assert!(handle.fired().await);
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels() {
        let scheduler = TimeoutScheduler::spawn();
        let id = InstanceId::new();

        let handle = scheduler.arm(id, 1, Instant::now() + Duration::from_secs(5));
        scheduler.disarm(id, 1);

        assert!(!handle.fired().await);
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_registration() {
        let scheduler = TimeoutScheduler::spawn();
        let id = InstanceId::new();

        let first = scheduler.arm(id, 0, Instant::now() + Duration::from_secs(1));
        let second = scheduler.arm(id, 0, Instant::now() + Duration::from_secs(10));

        assert!(!first.fired().await);
        assert_eq!(scheduler.pending().await, 1);

        let start = Instant::now();
        assert!(second.fired().await);
        assert!(start.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_fires_first() {
        let scheduler = TimeoutScheduler::spawn();
        let a = InstanceId::new();
        let b = InstanceId::new();

        let late = scheduler.arm(a, 0, Instant::now() + Duration::from_secs(30));
        let early = scheduler.arm(b, 0, Instant::now() + Duration::from_secs(3));

        tokio::time::timeout(Duration::from_secs(5), early.expired())
            .await
            .expect("early deadline should fire");
        assert_eq!(scheduler.pending().await, 1);

        scheduler.disarm(a, 0);
        assert!(!late.fired().await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_never_resolves_after_disarm() {
        let scheduler = TimeoutScheduler::spawn();
        let id = InstanceId::new();

        let handle = scheduler.arm(id, 0, Instant::now() + Duration::from_secs(1));
        scheduler.disarm(id, 0);

        let waited = tokio::time::timeout(Duration::from_secs(10), handle.expired()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn disarmed_registrations_do_not_accumulate() {
        let mut deadlines = Deadlines::default();
        let key = TimeoutKey {
            instance_id: InstanceId::new(),
            step_index: 0,
        };
        let far = Instant::now() + Duration::from_secs(3600);

        for _ in 0..1_000 {
            let (fire, _fired) = oneshot::channel();
            deadlines.arm(key, far, fire);
            deadlines.disarm(key);
        }

        assert!(deadlines.live.is_empty());
        assert!(deadlines.keys.is_empty());
        assert!(deadlines.heap.len() <= COMPACT_FLOOR);
    }

    #[test]
    fn rearming_prunes_the_replaced_registration() {
        let mut deadlines = Deadlines::default();
        let key = TimeoutKey {
            instance_id: InstanceId::new(),
            step_index: 2,
        };
        let far = Instant::now() + Duration::from_secs(3600);

        let mut receivers = Vec::new();
        for _ in 0..500 {
            let (fire, fired) = oneshot::channel();
            deadlines.arm(key, far, fire);
            receivers.push(fired);
        }

        assert_eq!(deadlines.live.len(), 1);
        assert_eq!(deadlines.keys.len(), 1);
        assert!(deadlines.heap.len() <= COMPACT_FLOOR);

        deadlines.fire_due(far);
        let last = receivers.pop().unwrap();
        assert!(last.blocking_recv().is_ok());
        assert!(receivers.into_iter().all(|r| r.blocking_recv().is_err()));
        assert!(deadlines.heap.is_empty());
    }
}
