//! Coalesces concurrent computations for the same key.
//!
//! A [FlightGroup](FlightGroup) ensures that out of several threads which request the
//! same missing key at once, only one (the leader) actually performs the expensive
//! computation. All other threads (the followers) block until the leader publishes its
//! outcome and then share it. Once an outcome has been published, the key is released
//! again, therefore nothing is ever cached here. This turns a miss storm on a single
//! hot key into exactly one access of the backing store while computations for
//! distinct keys proceed in parallel.
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

/// A failure which is broadcast from the leader to all followers of a flight.
///
/// The underlying error is shared, as `anyhow::Error` itself cannot be cloned. Each
/// follower wraps this into a fresh error so that every caller receives an owned value
/// with the original failure as its source.
#[derive(Clone, Debug)]
struct SharedFailure(Arc<anyhow::Error>);

impl SharedFailure {
    fn aborted() -> Self {
        SharedFailure(Arc::new(anyhow::anyhow!(
            "the computation was aborted before an outcome was published"
        )))
    }
}

impl std::fmt::Display for SharedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let original: &anyhow::Error = &self.0;
        Some(original.as_ref())
    }
}

type SharedOutcome<V> = Result<V, SharedFailure>;

/// A single computation which is in progress.
///
/// The outcome remains `None` while the leader is at work. Followers block on the
/// condition variable until it is filled in.
struct Flight<V> {
    outcome: Mutex<Option<SharedOutcome<V>>>,
    done: Condvar,
}

impl<V> Flight<V> {
    fn new() -> Self {
        Flight {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }
}

/// Distinguishes the thread which performs a computation from those waiting for it.
enum Role<V> {
    Leader(Arc<Flight<V>>),
    Follower(Arc<Flight<V>>),
}

/// Ensures that the leader publishes an outcome in every case.
///
/// If the computation panics, the drop handler broadcasts an abort error so that no
/// follower remains blocked forever.
struct LeaderGuard<'a, V> {
    group: &'a FlightGroup<V>,
    key: &'a str,
    flight: Arc<Flight<V>>,
    published: bool,
}

impl<V> LeaderGuard<'_, V> {
    fn publish(mut self, outcome: SharedOutcome<V>) {
        self.deliver(outcome);
        self.published = true;
    }

    fn deliver(&self, outcome: SharedOutcome<V>) {
        // Release the key before waking anybody so that a thread arriving after the
        // broadcast starts a fresh flight instead of observing a completed one.
        let _ = self.group.flights.lock().remove(self.key);

        let mut slot = self.flight.outcome.lock();
        *slot = Some(outcome);
        drop(slot);

        let _ = self.flight.done.notify_all();
    }
}

impl<V> Drop for LeaderGuard<'_, V> {
    fn drop(&mut self) {
        if !self.published {
            self.deliver(Err(SharedFailure::aborted()));
        }
    }
}

/// Tracks all computations which are currently in progress, addressed by key.
///
/// # Example
///
/// ```
/// let group = ganymede::lru::FlightGroup::new();
///
/// let value = group.execute("road", || anyhow::Ok("42 km".to_owned())).unwrap();
/// assert_eq!(value, "42 km");
/// assert_eq!(group.in_flight(), 0);
/// ```
pub struct FlightGroup<V> {
    flights: Mutex<HashMap<String, Arc<Flight<V>>>>,
}

impl<V: Clone> FlightGroup<V> {
    /// Creates a new group without any computation in progress.
    pub fn new() -> Self {
        FlightGroup::default()
    }

    /// Executes the given computation unless one is already in progress for the key.
    ///
    /// The first caller for a key becomes the leader and runs `compute`. Every
    /// further caller which arrives before the leader finished blocks and then
    /// shares the leader's outcome. A successful outcome is cloned for each
    /// follower, a failure is reported to each caller as an error which names the
    /// original one as its source.
    ///
    /// Outcomes are only handed to callers which were already waiting. The key is
    /// released before the outcome is broadcast, hence a later call computes again.
    pub fn execute<F>(&self, key: &str, compute: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> anyhow::Result<V>,
    {
        let role = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(flight) => Role::Follower(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight::new());
                    let _ = flights.insert(key.to_owned(), Arc::clone(&flight));
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Leader(flight) => {
                let guard = LeaderGuard {
                    group: self,
                    key,
                    flight,
                    published: false,
                };

                match compute() {
                    Ok(value) => {
                        guard.publish(Ok(value.clone()));
                        Ok(value)
                    }
                    Err(error) => {
                        let failure = SharedFailure(Arc::new(error));
                        guard.publish(Err(failure.clone()));
                        Err(anyhow::Error::new(failure))
                    }
                }
            }
            Role::Follower(flight) => {
                let mut outcome = flight.outcome.lock();
                loop {
                    match outcome.as_ref() {
                        Some(Ok(value)) => return Ok(value.clone()),
                        Some(Err(failure)) => return Err(anyhow::Error::new(failure.clone())),
                        None => flight.done.wait(&mut outcome),
                    }
                }
            }
        }
    }

    /// Returns the number of computations which are currently in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

impl<V> Default for FlightGroup<V> {
    fn default() -> Self {
        FlightGroup {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::flight::FlightGroup;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    /// Blocks until the group reports a computation in progress.
    fn await_flight(group: &FlightGroup<String>) {
        while group.in_flight() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Blocks until the given number of threads signalled that they are underway.
    fn await_count(counter: &AtomicUsize, expected: usize) {
        while counter.load(Ordering::SeqCst) < expected {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn the_leader_computes_once_and_followers_share_the_outcome() {
        let group = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let joining = Arc::new(AtomicUsize::new(0));
        let (release, release_requests) = mpsc::channel::<()>();

        let leader = {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                group.execute("answer", || {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    release_requests
                        .recv()
                        .map_err(|_| anyhow::anyhow!("the test aborted"))?;
                    Ok("42".to_owned())
                })
            })
        };

        await_flight(&group);
        let followers: Vec<_> = (0..4)
            .map(|_| {
                let group = Arc::clone(&group);
                let calls = Arc::clone(&calls);
                let joining = Arc::clone(&joining);
                thread::spawn(move || {
                    let _ = joining.fetch_add(1, Ordering::SeqCst);
                    group.execute("answer", || {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        Ok("should not run".to_owned())
                    })
                })
            })
            .collect();

        // Give the followers a moment to join the flight, then let the leader finish.
        await_count(&joining, 4);
        thread::sleep(Duration::from_millis(25));
        release.send(()).unwrap();

        assert_eq!(leader.join().unwrap().unwrap(), "42");
        for follower in followers {
            assert_eq!(follower.join().unwrap().unwrap(), "42");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn failures_are_broadcast_but_not_sticky() {
        let group = Arc::new(FlightGroup::new());
        let joining = Arc::new(AtomicUsize::new(0));
        let (release, release_requests) = mpsc::channel::<()>();

        let leader = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                group.execute("answer", || {
                    release_requests
                        .recv()
                        .map_err(|_| anyhow::anyhow!("the test aborted"))?;
                    Err(anyhow::anyhow!("the backing store is offline"))
                })
            })
        };

        await_flight(&group);
        let follower = {
            let group = Arc::clone(&group);
            let joining = Arc::clone(&joining);
            thread::spawn(move || {
                let _ = joining.fetch_add(1, Ordering::SeqCst);
                group.execute("answer", || Ok("unused".to_owned()))
            })
        };

        await_count(&joining, 1);
        thread::sleep(Duration::from_millis(25));
        release.send(()).unwrap();

        let leader_error = leader.join().unwrap().unwrap_err();
        assert!(leader_error.to_string().contains("offline"));
        let follower_error = follower.join().unwrap().unwrap_err();
        assert!(follower_error.to_string().contains("offline"));

        // The failure is not remembered, a later call computes again.
        let value = group.execute("answer", || Ok("recovered".to_owned())).unwrap();
        assert_eq!(value, "recovered");
    }

    #[test]
    fn a_panicking_leader_wakes_all_followers() {
        let group = Arc::new(FlightGroup::new());
        let joining = Arc::new(AtomicUsize::new(0));
        let (release, release_requests) = mpsc::channel::<()>();

        let leader = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                group.execute("answer", || {
                    let _ = release_requests.recv();
                    panic!("the computation went up in flames");
                })
            })
        };

        await_flight(&group);
        let follower = {
            let group = Arc::clone(&group);
            let joining = Arc::clone(&joining);
            thread::spawn(move || {
                let _ = joining.fetch_add(1, Ordering::SeqCst);
                group.execute("answer", || Ok("unused".to_owned()))
            })
        };

        await_count(&joining, 1);
        thread::sleep(Duration::from_millis(25));
        release.send(()).unwrap();

        assert!(leader.join().is_err());
        let follower_error = follower.join().unwrap().unwrap_err();
        assert!(follower_error.to_string().contains("aborted"));
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn sequential_executions_compute_independently() {
        let group = FlightGroup::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = group
                .execute("answer", || {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok("42".to_owned())
                })
                .unwrap();
            assert_eq!(value, "42");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(group.in_flight(), 0);
    }
}
