//! Engine configuration.

use std::time::Duration;

/// Tunable behavior of the engine and scheduler.
///
/// Use [`EngineConfig::default()`] for the platform defaults, or customize
/// individual fields.
///
/// # Example
///
/// ```
/// use wavepipe::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     tick_period: Duration::from_millis(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base period of the low-latency timer domain.
    ///
    /// Pipelines run every `period_us / tick_period` ticks; the default
    /// matches the canonical 1 ms scheduling period.
    pub tick_period: Duration,

    /// How long a stopping host endpoint may take to drain in-flight data
    /// before the stop is forced.
    ///
    /// Default: 50 ms
    pub host_drain_timeout: Duration,

    /// How long a stopping DAI endpoint may take to drain its FIFO before
    /// the stop is forced.
    ///
    /// Default: 1333 µs (one and a third scheduling periods)
    pub dai_drain_timeout: Duration,

    /// Number of xruns inside [`xrun_window`](Self::xrun_window) after which
    /// recovery is abandoned and the condition is reported host-visible.
    ///
    /// Default: 5
    pub xrun_threshold: u32,

    /// Sliding window for counting repeated xruns.
    ///
    /// Default: 1 s
    pub xrun_window: Duration,

    /// Interval at which the trace ring is drained.
    ///
    /// Default: 500 ms
    pub trace_drain_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(1),
            host_drain_timeout: Duration::from_millis(50),
            dai_drain_timeout: Duration::from_micros(1333),
            xrun_threshold: 5,
            xrun_window: Duration::from_secs(1),
            trace_drain_interval: Duration::from_millis(500),
        }
    }
}
