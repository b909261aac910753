use crate::error::Error;
use crate::poller::TriggerType;

/// Where user `on_data` callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// One job per delivery on the shared worker pool. Order is preserved
    /// only within a single delivery; cross-delivery order is not
    /// guaranteed without user synchronization.
    InBusinessPool,
    /// Synchronously on the reactor thread, with the scratch buffer aliased
    /// as the payload. Lowest overhead; the handler must not retain the
    /// payload or block.
    InEventLoop,
    /// A single-consumer queue bound to the connection: strictly ordered,
    /// one-at-a-time delivery.
    InConnectionQueue,
}

/// Sizing for the shared worker pool backing the deferred dispatch modes.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Pool never shrinks below this many threads.
    pub min: usize,
    /// Pool never grows beyond this many threads.
    pub max: usize,
    /// Threads started eagerly at construction.
    pub init_count: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            min: 50,
            max: 30000,
            init_count: 8,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatch mode for `on_data`.
    pub task_type: TaskType,
    /// Readiness trigger mode for all reactors.
    pub trigger_type: TriggerType,
    /// Per-reactor scratch read buffer size; also the default segment size
    /// for write-chain appends.
    pub read_buffer_size: usize,
    /// Cap on reads per readiness signal in level-triggered mode.
    /// Ignored under edge triggering, which must drain to `EAGAIN`.
    pub max_socket_read_times: usize,
    /// Pause reading while the write chain is non-empty.
    pub flow_backpressure: bool,
    /// Drop read interest while the write chain is non-empty. Higher
    /// throughput under level triggering. Mutually exclusive with
    /// `flow_backpressure`.
    pub flow_backpressure_remove_read: bool,
    /// Worker pool sizing.
    pub task: TaskConfig,
    /// Number of reactor threads. 0 = number of CPUs.
    pub reactors: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Max level for the default tracing subscriber installed at server
    /// construction when no global subscriber is set.
    pub log_level: tracing::Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_type: TaskType::InBusinessPool,
            trigger_type: TriggerType::Level,
            read_buffer_size: 4096,
            max_socket_read_times: 1,
            flow_backpressure: false,
            flow_backpressure_remove_read: false,
            task: TaskConfig::default(),
            reactors: 0,
            backlog: 1024,
            tcp_nodelay: false,
            log_level: tracing::Level::ERROR,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range or two options contradict each other.
    pub fn validate(&self) -> Result<(), Error> {
        if self.flow_backpressure && self.flow_backpressure_remove_read {
            return Err(Error::InvalidConfig(
                "flow_backpressure and flow_backpressure_remove_read are mutually exclusive".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::InvalidConfig("read_buffer_size must be > 0".into()));
        }
        if self.task.max == 0 {
            return Err(Error::InvalidConfig("task.max must be > 0".into()));
        }
        if self.task.min > self.task.max {
            return Err(Error::InvalidConfig("task.min must be <= task.max".into()));
        }
        if self.task.init_count > self.task.max {
            return Err(Error::InvalidConfig(
                "task.init_count must be <= task.max".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(Error::InvalidConfig("backlog must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use riptide::{ConfigBuilder, TaskType, TriggerType};
///
/// let config = ConfigBuilder::new()
///     .task_type(TaskType::InEventLoop)
///     .trigger_type(TriggerType::Edge)
///     .read_buffer_size(8192)
///     .reactors(4)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Dispatch settings ────────────────────────────────────────────

    /// Set the dispatch mode for `on_data`.
    pub fn task_type(mut self, t: TaskType) -> Self {
        self.config.task_type = t;
        self
    }

    /// Set worker pool sizing: minimum, maximum, and eager start count.
    pub fn task_pool(mut self, min: usize, max: usize, init_count: usize) -> Self {
        self.config.task = TaskConfig {
            min,
            max,
            init_count,
        };
        self
    }

    // ── Reactor settings ─────────────────────────────────────────────

    /// Set the readiness trigger mode.
    pub fn trigger_type(mut self, t: TriggerType) -> Self {
        self.config.trigger_type = t;
        self
    }

    /// Set the number of reactor threads. 0 = number of CPUs.
    pub fn reactors(mut self, n: usize) -> Self {
        self.config.reactors = n;
        self
    }

    /// Set the scratch read buffer size (also the write-segment size).
    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.config.read_buffer_size = n;
        self
    }

    /// Cap reads per readiness signal (level-triggered mode only).
    pub fn max_socket_read_times(mut self, n: usize) -> Self {
        self.config.max_socket_read_times = n;
        self
    }

    // ── Backpressure settings ────────────────────────────────────────

    /// Pause reading while the write chain is non-empty.
    pub fn flow_backpressure(mut self, enable: bool) -> Self {
        self.config.flow_backpressure = enable;
        self
    }

    /// Drop read interest while the write chain is non-empty.
    pub fn flow_backpressure_remove_read(mut self, enable: bool) -> Self {
        self.config.flow_backpressure_remove_read = enable;
        self
    }

    // ── Socket settings ──────────────────────────────────────────────

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Observability ────────────────────────────────────────────────

    /// Set the max level for the default tracing subscriber.
    pub fn log_level(mut self, level: tracing::Level) -> Self {
        self.config.log_level = level;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.task_type, TaskType::InBusinessPool);
        assert_eq!(c.trigger_type, TriggerType::Level);
        assert_eq!(c.read_buffer_size, 4096);
        assert_eq!(c.max_socket_read_times, 1);
        assert_eq!(c.task.min, 50);
        assert_eq!(c.task.max, 30000);
        assert_eq!(c.task.init_count, 8);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn backpressure_flags_exclusive() {
        let c = ConfigBuilder::new()
            .flow_backpressure(true)
            .flow_backpressure_remove_read(true)
            .build();
        assert!(c.is_err());
    }

    #[test]
    fn zero_read_buffer_rejected() {
        let c = ConfigBuilder::new().read_buffer_size(0).build();
        assert!(c.is_err());
    }

    #[test]
    fn pool_bounds_rejected() {
        let c = ConfigBuilder::new().task_pool(100, 10, 1).build();
        assert!(c.is_err());
        let c = ConfigBuilder::new().task_pool(1, 4, 8).build();
        assert!(c.is_err());
    }

    #[test]
    fn builder_round_trip() {
        let c = ConfigBuilder::new()
            .task_type(TaskType::InConnectionQueue)
            .trigger_type(TriggerType::Edge)
            .read_buffer_size(16384)
            .max_socket_read_times(4)
            .reactors(2)
            .backlog(128)
            .tcp_nodelay(true)
            .build()
            .unwrap();
        assert_eq!(c.task_type, TaskType::InConnectionQueue);
        assert_eq!(c.trigger_type, TriggerType::Edge);
        assert_eq!(c.read_buffer_size, 16384);
        assert_eq!(c.reactors, 2);
        assert!(c.tcp_nodelay);
    }
}
