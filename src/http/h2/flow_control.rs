//! HTTP/2 flow control windows
//!
//! A connection keeps one send window and one receive window for itself
//! and for every stream. Outbound DATA waits for send credit; inbound DATA
//! is checked against the receive window and replenished with
//! WINDOW_UPDATE once half of it has been used.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
///
/// The current size may go negative when the peer shrinks
/// INITIAL_WINDOW_SIZE below what is already in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Octets that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take up to `amount` octets of credit; returns what was granted
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.current_size -= granted as i64;
        granted
    }

    /// Apply a WINDOW_UPDATE increment
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::FlowControl(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Account for received DATA
    ///
    /// Receiving more than the advertised window is a flow-control error.
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "received {} octets with only {} of window left",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Increment to send in a WINDOW_UPDATE, once under half the initial size
    ///
    /// The window is assumed refilled once the update is queued.
    pub fn replenish(&mut self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.current_size >= initial / 2 {
            return None;
        }
        let increment = (initial - self.current_size) as u32;
        self.current_size = initial;
        Some(increment)
    }

    /// Adjust for a new SETTINGS_INITIAL_WINDOW_SIZE
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_basic() {
        let window = FlowControlWindow::new();
        assert_eq!(window.size(), 65535);
        assert_eq!(window.initial_size(), 65535);
        assert_eq!(window.available(), 65535);
    }

    #[test]
    fn test_consume_is_capped_by_credit() {
        let mut window = FlowControlWindow::with_initial_size(1000);

        assert_eq!(window.consume(500), 500);
        assert_eq!(window.size(), 500);

        assert_eq!(window.consume(600), 500);
        assert_eq!(window.size(), 0);
        assert_eq!(window.consume(1), 0);
    }

    #[test]
    fn test_increase_and_overflow() {
        let mut window = FlowControlWindow::with_initial_size(1000);
        assert_eq!(window.increase(500).unwrap(), 1500);

        assert!(window.increase(0).is_err());
        assert!(window.increase(MAX_WINDOW_SIZE).is_err());
    }

    #[test]
    fn test_update_initial_size_can_go_negative() {
        let mut window = FlowControlWindow::with_initial_size(1000);
        window.consume(800);

        window.update_initial_size(500).unwrap();
        assert_eq!(window.size(), -300);
        assert_eq!(window.available(), 0);

        window.update_initial_size(2000).unwrap();
        assert_eq!(window.size(), 1200);
    }

    #[test]
    fn test_receive_beyond_window_is_error() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.receive(60).unwrap();
        assert!(window.receive(41).is_err());
    }

    #[test]
    fn test_replenish_after_half_used() {
        let mut window = FlowControlWindow::with_initial_size(1000);
        window.receive(400).unwrap();
        assert_eq!(window.replenish(), None);

        window.receive(200).unwrap();
        assert_eq!(window.replenish(), Some(600));
        assert_eq!(window.size(), 1000);
    }
}
