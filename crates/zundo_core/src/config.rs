//! Undo engine configuration.

use std::time::Duration;

/// Configuration for the undo discard and rollback engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sleep between discard cycles while there is work to do.
    pub discard_naptime: Duration,

    /// Sleep after a cycle that found no pending undo in any log.
    pub hibernate_naptime: Duration,

    /// Whether to flush the durability log after every record.
    pub wal_sync_on_write: bool,

    /// Whether physical undo discards are written to the durability log.
    pub log_discards: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discard_naptime: Duration::from_secs(10),
            hibernate_naptime: Duration::from_secs(60),
            wal_sync_on_write: true,
            log_discards: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sleep between busy discard cycles.
    #[must_use]
    pub const fn discard_naptime(mut self, value: Duration) -> Self {
        self.discard_naptime = value;
        self
    }

    /// Sets the sleep after an idle discard cycle.
    #[must_use]
    pub const fn hibernate_naptime(mut self, value: Duration) -> Self {
        self.hibernate_naptime = value;
        self
    }

    /// Sets whether to flush the durability log on every record.
    #[must_use]
    pub const fn wal_sync_on_write(mut self, value: bool) -> Self {
        self.wal_sync_on_write = value;
        self
    }

    /// Sets whether discards are written to the durability log.
    #[must_use]
    pub const fn log_discards(mut self, value: bool) -> Self {
        self.log_discards = value;
        self
    }

    /// Returns how long the discard worker sleeps after a cycle.
    #[must_use]
    pub const fn naptime(&self, hibernate: bool) -> Duration {
        if hibernate {
            self.hibernate_naptime
        } else {
            self.discard_naptime
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.wal_sync_on_write);
        assert!(config.log_discards);
        assert!(config.hibernate_naptime > config.discard_naptime);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .discard_naptime(Duration::from_millis(5))
            .hibernate_naptime(Duration::from_millis(50))
            .wal_sync_on_write(false);

        assert!(!config.wal_sync_on_write);
        assert_eq!(config.naptime(false), Duration::from_millis(5));
        assert_eq!(config.naptime(true), Duration::from_millis(50));
    }
}
