//! Receive-side flow control accounting.
//!
//! Each direction has a connection window and a per-stream window. The
//! send side is a plain signed counter (it may go negative when the peer
//! shrinks `INITIAL_WINDOW_SIZE`); the receive side is a [`WindowCounter`]
//! observed by a [`WindowStrategy`] that decides when to hand bytes back
//! to the peer via WINDOW_UPDATE.

/// Running totals for one receive window.
///
/// `total` counts bytes the strategy considers received; `acknowledged`
/// counts bytes returned to the peer. Both only grow, and
/// `acknowledged <= total` always: [`acknowledge`](WindowCounter::acknowledge)
/// is the single place the invariant is enforced.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WindowCounter {
    total: u64,
    acknowledged: u64,
}

impl WindowCounter {
    pub(crate) fn new() -> WindowCounter {
        WindowCounter::default()
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub(crate) fn unacknowledged(&self) -> u64 {
        self.total - self.acknowledged
    }

    pub(crate) fn add_total(&mut self, n: u64) {
        self.total += n;
    }

    pub(crate) fn acknowledge(&mut self, n: u64) {
        assert!(
            self.acknowledged + n <= self.total,
            "window counter over-acknowledged"
        );
        self.acknowledged += n;
    }
}

/// Which window a strategy callback concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Connection,
    Stream,
}

/// Decides when received bytes count against a window and when to release
/// them.
///
/// Implementations mutate only `counter.total` (when bytes become
/// "received" under their policy) and return how many bytes to release
/// now. The engine applies a release by moving `acknowledged` and
/// emitting the WINDOW_UPDATE, keeping the invariant in one place.
pub(crate) trait WindowStrategy: Send + Sync + 'static {
    /// A DATA frame of `len` flow-controlled bytes landed.
    fn on_frame(&self, scope: Scope, counter: &mut WindowCounter, window: u32, len: u32) -> u64;

    /// The application consumed `len` bytes from a stream's source.
    fn on_consume(&self, scope: Scope, counter: &mut WindowCounter, window: u32, len: u32) -> u64;
}

fn release_at_half(counter: &WindowCounter, window: u32) -> u64 {
    let unacked = counter.unacknowledged();
    if unacked >= u64::from(window) / 2 {
        unacked
    } else {
        0
    }
}

/// The default strategy: bytes count as received when the application
/// consumes them, and a window is released once half of it is
/// unacknowledged. Total buffered bytes can never exceed the window.
#[derive(Debug, Default)]
pub(crate) struct ReleaseOnConsume;

impl WindowStrategy for ReleaseOnConsume {
    fn on_frame(&self, _scope: Scope, _counter: &mut WindowCounter, _window: u32, _len: u32) -> u64 {
        0
    }

    fn on_consume(&self, _scope: Scope, counter: &mut WindowCounter, window: u32, len: u32) -> u64 {
        counter.add_total(u64::from(len));
        release_at_half(counter, window)
    }
}

/// A keep-the-pipe-full strategy: the connection window is counted and
/// released as frames land, so slow streams don't stall unrelated ones;
/// stream windows still release on consume. May buffer up to
/// `window x open_streams` bytes.
#[derive(Debug, Default)]
pub(crate) struct ReleaseOnReceive;

impl WindowStrategy for ReleaseOnReceive {
    fn on_frame(&self, scope: Scope, counter: &mut WindowCounter, window: u32, len: u32) -> u64 {
        match scope {
            Scope::Connection => {
                counter.add_total(u64::from(len));
                release_at_half(counter, window)
            }
            Scope::Stream => 0,
        }
    }

    fn on_consume(&self, scope: Scope, counter: &mut WindowCounter, window: u32, len: u32) -> u64 {
        match scope {
            Scope::Connection => 0,
            Scope::Stream => {
                counter.add_total(u64::from(len));
                release_at_half(counter, window)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_invariant_holds() {
        let mut counter = WindowCounter::new();
        counter.add_total(100);
        counter.acknowledge(60);
        assert_eq!(counter.unacknowledged(), 40);
        assert!(counter.acknowledged() <= counter.total());
    }

    #[test]
    #[should_panic(expected = "over-acknowledged")]
    fn over_acknowledge_panics() {
        let mut counter = WindowCounter::new();
        counter.add_total(10);
        counter.acknowledge(11);
    }

    #[test]
    fn consume_strategy_releases_at_half_window() {
        let strategy = ReleaseOnConsume;
        let mut counter = WindowCounter::new();
        // Receipt alone releases nothing.
        assert_eq!(strategy.on_frame(Scope::Stream, &mut counter, 1000, 400), 0);
        assert_eq!(counter.total(), 0);

        assert_eq!(strategy.on_consume(Scope::Stream, &mut counter, 1000, 400), 0);
        let release = strategy.on_consume(Scope::Stream, &mut counter, 1000, 200);
        assert_eq!(release, 600);
        counter.acknowledge(release);
        assert_eq!(counter.unacknowledged(), 0);
    }

    #[test]
    fn receive_strategy_frees_connection_promptly() {
        let strategy = ReleaseOnReceive;
        let mut conn = WindowCounter::new();
        let release = strategy.on_frame(Scope::Connection, &mut conn, 1000, 700);
        assert_eq!(release, 700);
        // Streams still wait for the consumer.
        let mut stream = WindowCounter::new();
        assert_eq!(strategy.on_frame(Scope::Stream, &mut stream, 1000, 700), 0);
        assert_eq!(
            strategy.on_consume(Scope::Stream, &mut stream, 1000, 700),
            700
        );
    }
}
