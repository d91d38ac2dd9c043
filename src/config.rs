use std::time::Duration;

use crate::error::BusError;

/// Recognized bus configuration (spec §3 "Configuration").
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub name: String,
    pub max_file_size: u32,
    pub max_reader_count: u32,
    pub min_message_age: Duration,
    pub wait_timeout: Duration,
}

impl BusConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_file_size: 1_048_576,
            max_reader_count: 6,
            min_message_age: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_max_file_size(mut self, bytes: u32) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_max_reader_count(mut self, count: u32) -> Self {
        self.max_reader_count = count;
        self
    }

    pub fn with_min_message_age(mut self, age: Duration) -> Self {
        self.min_message_age = age;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BusError> {
        if self.name.is_empty() {
            return Err(BusError::InvalidName);
        }
        if self.max_file_size < 1 {
            return Err(BusError::InvalidCapacity);
        }
        if self.max_reader_count < 1 {
            return Err(BusError::InvalidReaderCount);
        }
        Ok(())
    }
}

/// The four kernel-object names derived from a bus name (spec §6).
///
/// `signal_name` is retained for interface parity with the source naming
/// convention even though this implementation signals writes through a
/// polled in-region generation counter rather than a named wait handle
/// (see DESIGN.md / SPEC_FULL.md "Open Question decisions").
#[derive(Debug, Clone)]
pub struct NamedResources {
    pub mutex_name: String,
    pub semaphore_name: String,
    pub region_name: String,
    pub signal_name: String,
}

impl NamedResources {
    pub fn derive(name: &str) -> Self {
        Self {
            mutex_name: format!("TinyReadWriteLock_Mutex_{name}"),
            semaphore_name: format!("TinyReadWriteLock_Semaphore_{name}"),
            region_name: format!("TinyMemoryMappedFile_MemoryMappedFile_{name}"),
            signal_name: format!("TinyMemoryMappedFile_WaitHandle_{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = BusConfig::new("n");
        assert_eq!(cfg.max_file_size, 1_048_576);
        assert_eq!(cfg.max_reader_count, 6);
        assert_eq!(cfg.min_message_age, Duration::from_millis(500));
        assert_eq!(cfg.wait_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(BusConfig::new("").validate(), Err(BusError::InvalidName));
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(
            BusConfig::new("n").with_max_file_size(0).validate(),
            Err(BusError::InvalidCapacity)
        );
    }

    #[test]
    fn rejects_zero_reader_count() {
        assert_eq!(
            BusConfig::new("n").with_max_reader_count(0).validate(),
            Err(BusError::InvalidReaderCount)
        );
    }

    #[test]
    fn derives_names_with_documented_prefixes() {
        let names = NamedResources::derive("bus1");
        assert_eq!(names.mutex_name, "TinyReadWriteLock_Mutex_bus1");
        assert_eq!(names.semaphore_name, "TinyReadWriteLock_Semaphore_bus1");
        assert_eq!(
            names.region_name,
            "TinyMemoryMappedFile_MemoryMappedFile_bus1"
        );
        assert_eq!(names.signal_name, "TinyMemoryMappedFile_WaitHandle_bus1");
    }
}
