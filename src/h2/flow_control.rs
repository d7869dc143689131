//! HTTP/2 flow control
//!
//! Flow control as defined in RFC 7540 Section 5.2, applied at both the
//! connection and stream level. Because the session suppresses automatic
//! window maintenance, the receive windows here only account consumption;
//! replenishment happens when the bridge submits WINDOW_UPDATE frames.

use super::error::{Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
///
/// Tracks the available window size for one direction of transfer.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (can be negative if over-committed)
    current_size: i64,
    /// Maximum window size allowed (2^31 - 1)
    max_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
            max_size: 0x7FFFFFFF,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Check if window can carry the specified amount
    pub fn can_send(&self, amount: usize) -> bool {
        self.current_size >= amount as i64
    }

    /// Largest amount currently sendable, capped at `amount`
    pub fn available(&self, amount: usize) -> usize {
        if self.current_size <= 0 {
            return 0;
        }
        std::cmp::min(amount as i64, self.current_size) as usize
    }

    /// Consume window capacity for sent data
    pub fn consume(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size.
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::FlowControl(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1: overflow is a flow control error
        if new_size > self.max_size {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Whether the peer has overrun this receive window
    pub fn overdrawn(&self) -> bool {
        self.current_size < 0
    }

    /// Update initial window size from SETTINGS
    ///
    /// The current window is adjusted by the difference, per RFC 7540
    /// Section 6.9.2.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > self.max_size {
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

/// Paired send/receive windows for the connection or one stream
#[derive(Debug)]
pub struct FlowControlPair {
    /// Send window (outbound data, replenished by the peer)
    send_window: FlowControlWindow,
    /// Receive window (inbound data, replenished by us)
    recv_window: FlowControlWindow,
}

impl FlowControlPair {
    /// Create with specified initial window sizes
    pub fn with_initial_sizes(send_size: u32, recv_size: u32) -> Self {
        FlowControlPair {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Get send window
    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    /// Get mutable send window
    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    /// Get receive window
    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// Largest amount currently sendable, capped at `amount`
    pub fn sendable(&self, amount: usize) -> usize {
        self.send_window.available(amount)
    }

    /// Consume send window for outbound data
    pub fn consume_send_window(&mut self, amount: usize) {
        self.send_window.consume(amount);
    }

    /// Increase send window from a peer WINDOW_UPDATE
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send_window.increase(increment)
    }

    /// Account inbound data against the receive window
    pub fn consume_recv_window(&mut self, amount: usize) {
        self.recv_window.decrease(amount);
    }

    /// Whether the peer has overrun the receive window
    pub fn recv_overdrawn(&self) -> bool {
        self.recv_window.overdrawn()
    }

    /// Check if a WINDOW_UPDATE should be transmitted
    ///
    /// Returns the suggested increment once the window has fallen below
    /// half of its initial size, restoring it in one update.
    pub fn pending_window_update(&self) -> Option<u32> {
        let recv_size = self.recv_window.size();
        let initial_size = self.recv_window.initial_size() as i64;

        if recv_size < initial_size / 2 {
            Some((initial_size - recv_size) as u32)
        } else {
            None
        }
    }

    /// Apply a transmitted WINDOW_UPDATE (replenishes the receive window)
    pub fn apply_window_update(&mut self, increment: u32) -> Result<i64> {
        self.recv_window.increase(increment)
    }
}

impl Default for FlowControlPair {
    fn default() -> Self {
        FlowControlPair {
            send_window: FlowControlWindow::new(),
            recv_window: FlowControlWindow::new(),
        }
    }
}
