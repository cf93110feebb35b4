//! Configuration knobs recognized by the relay core.
//!
//! The core never reads a configuration file.  A caller builds one
//! read-only [`CoreConfig`] snapshot and hands it (or pieces of it)
//! to the channel, circuit, and scheduler layers at construction
//! time; changing a knob means building new objects.

use std::time::Duration;

/// A read-only snapshot of every configuration knob the core
/// recognizes.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Close a channel that has had no circuits for this long.
    pub(crate) channel_idle_timeout: Duration,
    /// Starting value for the circuit build timeout, used until the
    /// build-time estimator has learned a better one.
    pub(crate) circuit_build_timeout_initial: Duration,
    /// Reject additional BEGIN requests on a circuit that already has
    /// this many live streams.
    pub(crate) max_streams_per_circuit: usize,
    /// Total bytes of queued cells (across all circuits) above which
    /// we begin closing the most backlogged circuits.
    pub(crate) cell_queue_highwater_bytes: usize,
    /// The scheduler's target for the depth of each channel's kernel
    /// write queue.
    pub(crate) kist_target_kernel_queue_bytes: usize,
    /// Version of SENDME messages to emit.  Version 1 messages carry
    /// an authenticating digest echo.
    pub(crate) sendme_emit_version: u8,
    /// Maximum number of RELAY_EARLY cells allowed on one circuit.
    pub(crate) relay_early_budget: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            channel_idle_timeout: Duration::from_secs(3 * 60),
            circuit_build_timeout_initial: Duration::from_secs(60),
            max_streams_per_circuit: 50,
            cell_queue_highwater_bytes: 256 * 1024 * 1024,
            kist_target_kernel_queue_bytes: 64 * 1024,
            sendme_emit_version: 1,
            relay_early_budget: 8,
        }
    }
}

impl CoreConfig {
    /// Return a new builder for a CoreConfig.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Return the configured idle timeout for channels.
    pub fn channel_idle_timeout(&self) -> Duration {
        self.channel_idle_timeout
    }
    /// Return the seed value for the circuit build timeout.
    pub fn circuit_build_timeout_initial(&self) -> Duration {
        self.circuit_build_timeout_initial
    }
    /// Return the per-circuit stream cap.
    pub fn max_streams_per_circuit(&self) -> usize {
        self.max_streams_per_circuit
    }
    /// Return the total queued-cell memory ceiling, in bytes.
    pub fn cell_queue_highwater_bytes(&self) -> usize {
        self.cell_queue_highwater_bytes
    }
    /// Return the scheduler's per-channel kernel-queue depth target.
    pub fn kist_target_kernel_queue_bytes(&self) -> usize {
        self.kist_target_kernel_queue_bytes
    }
    /// Return the version of SENDME messages we emit.
    pub fn sendme_emit_version(&self) -> u8 {
        self.sendme_emit_version
    }
    /// Return the maximum number of RELAY_EARLY cells per circuit.
    pub fn relay_early_budget(&self) -> u16 {
        self.relay_early_budget
    }
}

/// Builder for a [`CoreConfig`].
#[derive(Debug, Clone, Default)]
pub struct CoreConfigBuilder {
    /// See [`CoreConfig::channel_idle_timeout`].
    channel_idle_timeout: Option<Duration>,
    /// See [`CoreConfig::circuit_build_timeout_initial`].
    circuit_build_timeout_initial: Option<Duration>,
    /// See [`CoreConfig::max_streams_per_circuit`].
    max_streams_per_circuit: Option<usize>,
    /// See [`CoreConfig::cell_queue_highwater_bytes`].
    cell_queue_highwater_bytes: Option<usize>,
    /// See [`CoreConfig::kist_target_kernel_queue_bytes`].
    kist_target_kernel_queue_bytes: Option<usize>,
    /// See [`CoreConfig::sendme_emit_version`].
    sendme_emit_version: Option<u8>,
    /// See [`CoreConfig::relay_early_budget`].
    relay_early_budget: Option<u16>,
}

impl CoreConfigBuilder {
    /// Set the channel idle timeout.
    pub fn channel_idle_timeout(mut self, d: Duration) -> Self {
        self.channel_idle_timeout = Some(d);
        self
    }
    /// Set the initial circuit build timeout.
    pub fn circuit_build_timeout_initial(mut self, d: Duration) -> Self {
        self.circuit_build_timeout_initial = Some(d);
        self
    }
    /// Set the per-circuit stream cap.
    pub fn max_streams_per_circuit(mut self, n: usize) -> Self {
        self.max_streams_per_circuit = Some(n);
        self
    }
    /// Set the queued-cell memory ceiling, in bytes.
    pub fn cell_queue_highwater_bytes(mut self, n: usize) -> Self {
        self.cell_queue_highwater_bytes = Some(n);
        self
    }
    /// Set the per-channel kernel write-queue depth target.
    pub fn kist_target_kernel_queue_bytes(mut self, n: usize) -> Self {
        self.kist_target_kernel_queue_bytes = Some(n);
        self
    }
    /// Set the version of SENDME messages to emit.
    pub fn sendme_emit_version(mut self, v: u8) -> Self {
        self.sendme_emit_version = Some(v);
        self
    }
    /// Set the RELAY_EARLY budget.
    pub fn relay_early_budget(mut self, n: u16) -> Self {
        self.relay_early_budget = Some(n);
        self
    }
    /// Build the configuration snapshot.
    ///
    /// Gives an error for values that are out of range.
    pub fn build(self) -> crate::Result<CoreConfig> {
        let dflt = CoreConfig::default();
        let cfg = CoreConfig {
            channel_idle_timeout: self.channel_idle_timeout.unwrap_or(dflt.channel_idle_timeout),
            circuit_build_timeout_initial: self
                .circuit_build_timeout_initial
                .unwrap_or(dflt.circuit_build_timeout_initial),
            max_streams_per_circuit: self
                .max_streams_per_circuit
                .unwrap_or(dflt.max_streams_per_circuit),
            cell_queue_highwater_bytes: self
                .cell_queue_highwater_bytes
                .unwrap_or(dflt.cell_queue_highwater_bytes),
            kist_target_kernel_queue_bytes: self
                .kist_target_kernel_queue_bytes
                .unwrap_or(dflt.kist_target_kernel_queue_bytes),
            sendme_emit_version: self.sendme_emit_version.unwrap_or(dflt.sendme_emit_version),
            relay_early_budget: self.relay_early_budget.unwrap_or(dflt.relay_early_budget),
        };
        if cfg.sendme_emit_version > 1 {
            return Err(crate::Error::BadConfig(
                "unsupported sendme_emit_version".into(),
            ));
        }
        if cfg.max_streams_per_circuit == 0 {
            return Err(crate::Error::BadConfig(
                "max_streams_per_circuit must be nonzero".into(),
            ));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.channel_idle_timeout(), Duration::from_secs(180));
        assert_eq!(cfg.max_streams_per_circuit(), 50);
        assert_eq!(cfg.relay_early_budget(), 8);
        assert_eq!(cfg.sendme_emit_version(), 1);
    }

    #[test]
    fn builder() {
        let cfg = CoreConfig::builder()
            .max_streams_per_circuit(3)
            .relay_early_budget(2)
            .build()
            .unwrap();
        assert_eq!(cfg.max_streams_per_circuit(), 3);
        assert_eq!(cfg.relay_early_budget(), 2);

        assert!(CoreConfig::builder()
            .sendme_emit_version(9)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .max_streams_per_circuit(0)
            .build()
            .is_err());
    }
}
