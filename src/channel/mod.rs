//! The instrument command channel abstraction.
//!
//! A [`Channel`] is an exclusive, half-duplex, line-oriented transport to a
//! programmable instrument: write one command line, read back zero or more
//! response lines. Connection lifecycle (open/close) and addressing live
//! entirely outside the core; everything here consumes an already-open
//! channel.
//!
//! Reads are blocking with a bounded timeout held by the channel itself.
//! Drain loops temporarily shorten that timeout through [`TimeoutGuard`],
//! which restores the previous value when dropped — on error paths included.

pub mod mock;

pub use mock::MockChannel;

use std::time::Duration;

use crate::error::ChannelError;

/// Exclusive line-oriented command/response transport.
///
/// # Contract
/// - `write_line` sends one command line; no implicit response is expected.
/// - `read_line` blocks for at most the current timeout and returns the next
///   response line without its terminator.
/// - The channel is never shared between threads; ownership is transferred
///   whole (see [`crate::session`]).
pub trait Channel: Send {
    /// Send one command line.
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;

    /// Blocking read of the next response line under the current timeout.
    fn read_line(&mut self) -> Result<String, ChannelError>;

    /// Replace the read timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Write a command line and read a single response line.
    fn query(&mut self, line: &str) -> Result<String, ChannelError> {
        self.write_line(line)?;
        self.read_line()
    }
}

impl Channel for Box<dyn Channel> {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        (**self).write_line(line)
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        (**self).read_line()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout);
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }
}

/// RAII guard that shortens a channel's read timeout and restores the prior
/// value on drop.
///
/// Restoration must survive early returns from drain loops, so it lives in
/// `Drop` rather than at the loop's exit.
pub struct TimeoutGuard<'a, C: Channel + ?Sized> {
    channel: &'a mut C,
    previous: Duration,
}

impl<'a, C: Channel + ?Sized> TimeoutGuard<'a, C> {
    /// Shorten `channel`'s timeout to `timeout` for the guard's lifetime.
    pub fn new(channel: &'a mut C, timeout: Duration) -> Self {
        let previous = channel.timeout();
        channel.set_timeout(timeout);
        Self { channel, previous }
    }

    /// Access the guarded channel.
    pub fn channel(&mut self) -> &mut C {
        self.channel
    }
}

impl<C: Channel + ?Sized> Drop for TimeoutGuard<'_, C> {
    fn drop(&mut self) {
        self.channel.set_timeout(self.previous);
    }
}

/// Parse a flat list of floating-point tokens.
///
/// Buffer readback payloads separate values with commas and/or newlines;
/// both are treated as equivalent and empty tokens are skipped. Tokens that
/// fail to parse are dropped rather than aborting the whole payload.
pub fn parse_float_list(payload: &str) -> Vec<f64> {
    payload
        .split(|c: char| c == ',' || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_list_accepts_mixed_separators() {
        let values = parse_float_list("1.0, 2.5\n3.0,\n,4.25");
        assert_eq!(values, vec![1.0, 2.5, 3.0, 4.25]);
    }

    #[test]
    fn float_list_skips_garbage_tokens() {
        let values = parse_float_list("1.0, not-a-number, 2.0");
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn float_list_of_empty_payload_is_empty() {
        assert!(parse_float_list("").is_empty());
        assert!(parse_float_list(" , \n ,").is_empty());
    }

    #[test]
    fn timeout_guard_restores_on_drop() {
        let mut channel = MockChannel::new();
        channel.set_timeout(Duration::from_secs(10));
        {
            let mut guard = TimeoutGuard::new(&mut channel, Duration::from_millis(100));
            assert_eq!(guard.channel().timeout(), Duration::from_millis(100));
        }
        assert_eq!(channel.timeout(), Duration::from_secs(10));
    }
}
