//! Per-stream tuning parameters.
//!
//! Everything here is carried in the endpoint URL's query string, the way
//! the protocol has always shipped its knobs; there is no separate config
//! file for the connection core.
//!
//!   root://host:1094/?ConnectionWindow=30&ConnectionRetry=3&NetworkStack=IPv4

use std::time::Duration;

use xrd_domain::{AddressType, XrdUrl};

// ---------------------------------------------------------------------------
// Defaults — kept here so tests can import them directly.
// ---------------------------------------------------------------------------

/// Budget for a single connect attempt window, covering every resolved
/// address plus any intra-window retries.
pub const DEFAULT_CONNECTION_WINDOW: Duration = Duration::from_secs(120);

/// Connect attempts within a window before the failure is surfaced as
/// fatal even when the underlying status was recoverable.
pub const DEFAULT_CONNECTION_RETRY: u32 = 5;

/// Silence period after a fatal failure during which `enable_link` returns
/// the recorded error without touching a socket.
pub const DEFAULT_STREAM_ERROR_WINDOW: Duration = Duration::from_secs(1800);

/// Expiry applied to internally generated requests (the synthetic close).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

// ---------------------------------------------------------------------------
// StreamParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    // ---
    pub connection_window: Duration,

    pub connection_retry: u32,

    pub stream_error_window: Duration,

    /// Address-family policy.  `IPAuto` is still uncollapsed here; the
    /// stream collapses it against the local stack at construction.
    pub address_type: AddressType,
}

// ---

impl Default for StreamParams {
    fn default() -> Self {
        // ---
        Self {
            connection_window: DEFAULT_CONNECTION_WINDOW,
            connection_retry: DEFAULT_CONNECTION_RETRY,
            stream_error_window: DEFAULT_STREAM_ERROR_WINDOW,
            address_type: AddressType::IPAuto,
        }
    }
}

// ---

impl StreamParams {
    // ---

    /// Read the tuning parameters off the URL query, falling back to the
    /// defaults above.  An unparsable value falls back too — a typo in one
    /// knob should not take the endpoint down.
    pub fn from_url(url: &XrdUrl) -> Self {
        // ---
        let defaults = Self::default();

        let connection_window = url
            .typed_param::<u64>("ConnectionWindow")
            .map(Duration::from_secs)
            .unwrap_or(defaults.connection_window);

        let connection_retry = url
            .typed_param::<u32>("ConnectionRetry")
            .unwrap_or(defaults.connection_retry);

        let stream_error_window = url
            .typed_param::<u64>("StreamErrorWindow")
            .map(Duration::from_secs)
            .unwrap_or(defaults.stream_error_window);

        let address_type = url
            .param("NetworkStack")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.address_type);

        Self {
            connection_window,
            connection_retry,
            stream_error_window,
            address_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn url_overrides_defaults() {
        // ---
        let url: XrdUrl = "root://host:1094/?ConnectionWindow=30&ConnectionRetry=3\
                           &StreamErrorWindow=60&NetworkStack=IPv6"
            .parse()
            .unwrap();
        let params = StreamParams::from_url(&url);

        assert_eq!(params.connection_window, Duration::from_secs(30));
        assert_eq!(params.connection_retry, 3);
        assert_eq!(params.stream_error_window, Duration::from_secs(60));
        assert_eq!(params.address_type, AddressType::IPv6);
    }

    #[test]
    fn missing_and_garbage_params_fall_back() {
        // ---
        let url: XrdUrl = "root://host:1094/?ConnectionWindow=soon".parse().unwrap();
        let params = StreamParams::from_url(&url);

        assert_eq!(params, StreamParams::default());
    }
}
