// =============================================================================
// Stream Ingestion — Binance WebSocket consumption with supervised reconnect
// =============================================================================

pub mod kline_stream;
pub mod ticker_stream;

use std::time::Duration;

/// Exponential reconnect backoff: starts at `base`, doubles per consecutive
/// failure, saturates at `cap`. Only a connection that stayed up for the
/// full `sustain` period resets the schedule; anything shorter counts as a
/// continued failure, so a connection that flaps every few seconds keeps
/// escalating instead of hammering the exchange from the floor delay.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    sustain: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, sustain: Duration) -> Self {
        Self {
            base,
            cap,
            sustain,
            current: base,
        }
    }

    /// Default schedule: 5s base doubling to a 60s ceiling, reset after a
    /// 60s sustained connection.
    pub fn standard() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
    }

    /// Delay to sleep before the next connection attempt. Each call advances
    /// the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Report how long the last connection survived. Only an uptime of at
    /// least `sustain` earns a reset to the base delay.
    pub fn record_uptime(&mut self, uptime: Duration) {
        if uptime >= self.sustain {
            self.current = self.base;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = Backoff::standard();
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(20));
        assert_eq!(b.next_delay(), Duration::from_secs(40));
        assert_eq!(b.next_delay(), Duration::from_secs(60));
        // Saturates.
        assert_eq!(b.next_delay(), Duration::from_secs(60));
        assert_eq!(b.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_resets_after_sustained_connection() {
        let mut b = Backoff::standard();
        b.next_delay();
        b.next_delay();
        b.next_delay(); // next would be 40s

        b.record_uptime(Duration::from_secs(120));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_short_uptime_keeps_escalating() {
        let mut b = Backoff::standard();
        b.next_delay(); // 5
        b.record_uptime(Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_flapping_connection_does_not_reset() {
        // A connection that survives a few seconds at a time is still a
        // failure: only a full sustain period earns the base delay back.
        let mut b = Backoff::standard();
        b.next_delay(); // 5
        b.next_delay(); // 10
        b.next_delay(); // 20, next would be 40

        b.record_uptime(Duration::from_secs(6));
        assert_eq!(b.next_delay(), Duration::from_secs(40));
    }

    #[test]
    fn backoff_sustain_boundary() {
        let mut b = Backoff::standard();
        b.next_delay(); // 5
        b.next_delay(); // 10, next would be 20

        b.record_uptime(Duration::from_secs(59));
        assert_eq!(b.next_delay(), Duration::from_secs(20));

        b.record_uptime(Duration::from_secs(60));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }
}
