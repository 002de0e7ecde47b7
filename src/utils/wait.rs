//! Waiting between lock attempts.

use std::hint::spin_loop;
use std::time::Duration;

use quanta::Instant;

/// Synchronously busy-wait for some nanoseconds.
/// A zero wait returns immediately after a single spin hint.
pub fn busy_wait(nanos: u64) {
    if nanos == 0 {
        spin_loop();
        return;
    }
    busy_wait_dur(Duration::from_nanos(nanos));
}

/// Synchronously busy-wait for some duration.
pub fn busy_wait_dur(dur: Duration) {
    let end = Instant::now() + dur;
    while Instant::now() < end {
        // Hint the CPU to spin.
        spin_loop();
    }
}
