use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot stop flag that background threads can sleep on.
///
/// Unlike a plain `AtomicBool` polled between `thread::sleep` calls, a
/// sleeping thread wakes as soon as [`StopSignal::stop`] is called, so
/// shutting a cache down does not wait out a whole flush or refresh interval.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
  stopped: Mutex<bool>,
  condvar: Condvar,
}

impl StopSignal {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Sleeps for up to `timeout`. Returns `true` if the signal was raised,
  /// either before or during the wait.
  pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    let mut stopped = self.stopped.lock();
    while !*stopped {
      match deadline {
        Some(deadline) => {
          // Spurious wakeups are possible; re-check until the deadline.
          if self.condvar.wait_until(&mut stopped, deadline).timed_out() {
            return *stopped;
          }
        }
        None => self.condvar.wait(&mut stopped),
      }
    }
    true
  }

  pub(crate) fn stop(&self) {
    let mut stopped = self.stopped.lock();
    *stopped = true;
    self.condvar.notify_all();
  }

  #[cfg(test)]
  pub(crate) fn is_stopped(&self) -> bool {
    *self.stopped.lock()
  }
}
