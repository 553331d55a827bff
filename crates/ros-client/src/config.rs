//! Client configuration.

use std::time::Duration;

use ros_types::{MAX_REQUESTS_IN_FLIGHT, PAGE_SIZE};

/// Per-connection client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Requests allowed in flight on one connection. Clamped to
    /// [`MAX_REQUESTS_IN_FLIGHT`] so 16-bit request ids never collide.
    pub max_in_flight: usize,
    /// Receive buffers kept posted.
    pub receive_depth: usize,
    /// Size of every remote object.
    pub object_size: usize,
    /// Fail requests not answered within this time. `None` waits until the
    /// connection is torn down.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    /// The effective in-flight bound.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.clamp(1, MAX_REQUESTS_IN_FLIGHT)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            receive_depth: 64,
            object_size: PAGE_SIZE,
            request_timeout: None,
        }
    }
}
