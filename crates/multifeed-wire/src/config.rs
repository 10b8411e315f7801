/// Default upper bound for one encoded frame.
const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Default capacity of the reader/writer frame channels.
const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Configuration for the shared replication stream.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use multifeed_wire::WireConfig;
///
/// let config = WireConfig::new()
///     .max_frame_size(2 * 1024 * 1024)
///     .channel_buffer(64);
/// ```
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum encoded frame size in bytes, enforced on both directions.
    pub(crate) max_frame_size: usize,
    /// Capacity of the inbound and outbound frame channels.
    pub(crate) channel_buffer: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WireConfig {
    /// Create a new config with defaults.
    ///
    /// If the `MULTIFEED_MAX_FRAME_SIZE` environment variable holds a byte
    /// count, it replaces the default frame size. This can be overridden with
    /// [`.max_frame_size()`](Self::max_frame_size).
    pub fn new() -> Self {
        let max_frame_size = std::env::var("MULTIFEED_MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);

        Self {
            max_frame_size,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }

    /// Set the maximum frame size (default: 8 MiB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the frame channel capacity (default: 256).
    pub fn channel_buffer(mut self, capacity: usize) -> Self {
        self.channel_buffer = capacity.max(1);
        self
    }
}
