//! Error types and handling for the shared queue fabric

/// Result type alias for shared queue operations
pub type Result<T> = std::result::Result<T, SqueueError>;

/// Errors surfaced by the shared queue fabric
#[derive(Debug, thiserror::Error)]
pub enum SqueueError {
    /// I/O related errors (region files, overflow spill files)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Memory allocation or mapping failures
    #[error("Memory error: {message}")]
    Memory { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Registry hash table or sync-block pool is full
    #[error("Capacity exhausted: no free {resource}, increase the pool size")]
    CapacityExhausted { resource: String },

    /// A leftover queue entry from a prior execution could not be dislodged
    #[error("Queue {name} is still held by a previous execution after {tries} tries")]
    StaleQueueTimeout { name: String, tries: u32 },

    /// Lookup found no queue with the given name
    #[error("Queue not found: {name}")]
    NoSuchQueue { name: String },

    /// The consumer list passed to bind disagrees with the queue's slots
    #[error("Queue {name}: consumer list does not match the bound queue (expected {expected}, got {actual})")]
    MismatchedConsumers {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// The producer failed or went away; fatal to the consumer's operation
    #[error("Queue {name}: producer failed")]
    ProducerFailed { name: String },

    /// Shared state failed an internal consistency check
    #[error("Shared queue state corruption: {message}")]
    Corruption { message: String },
}

impl SqueueError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a capacity exhausted error
    pub fn capacity_exhausted(resource: impl Into<String>) -> Self {
        Self::CapacityExhausted {
            resource: resource.into(),
        }
    }

    /// Create a stale queue timeout error
    pub fn stale_queue(name: impl Into<String>, tries: u32) -> Self {
        Self::StaleQueueTimeout {
            name: name.into(),
            tries,
        }
    }

    /// Create a queue not found error
    pub fn no_such_queue(name: impl Into<String>) -> Self {
        Self::NoSuchQueue { name: name.into() }
    }

    /// Create a mismatched consumer list error
    pub fn mismatched_consumers(name: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::MismatchedConsumers {
            name: name.into(),
            expected,
            actual,
        }
    }

    /// Create a producer failed error
    pub fn producer_failed(name: impl Into<String>) -> Self {
        Self::ProducerFailed { name: name.into() }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SqueueError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SqueueError::capacity_exhausted("shared queues");
        assert!(matches!(err, SqueueError::CapacityExhausted { .. }));

        let err = SqueueError::no_such_queue("step_4");
        assert!(matches!(err, SqueueError::NoSuchQueue { .. }));

        let err = SqueueError::producer_failed("step_4");
        assert!(matches!(err, SqueueError::ProducerFailed { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = SqueueError::stale_queue("p_1_2", 10);
        let display = format!("{}", err);
        assert!(display.contains("p_1_2"));
        assert!(display.contains("10"));
    }
}
