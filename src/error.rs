use thiserror::Error;

/// Errors that can occur when talking to an under-desk bike
#[derive(Error, Debug)]
pub enum BikeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No adapter, or no peripheral advertising the bike's name
    #[error("Under desk bike not found")]
    DeviceNotFound,

    /// Service/characteristic resolution, subscription or write failure
    #[error("GATT operation failed: {0}")]
    GattOperation(String),

    /// The bike answered with bytes that do not fit the expected response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command timeout
    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A workout session is already running
    #[error("The workout has already been started")]
    AlreadyRunning,

    /// The bike is not connected
    #[error("Bike is not connected")]
    NotConnected,

    /// The connect handshake could not be written
    #[error("Bike rejected the connect handshake")]
    ConnectRejected,

    /// The in-flight command was aborted by a disconnect or shutdown
    #[error("Command cancelled")]
    Cancelled,
}

/// Result type for bike operations
pub type Result<T> = std::result::Result<T, BikeError>;

impl BikeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::DeviceNotFound
                | Self::GattOperation(_)
                | Self::NotConnected
                | Self::ConnectRejected
        )
    }

    /// Check if this error is a malformed-data error.
    ///
    /// These are the only errors a running workout tolerates, up to the
    /// consecutive error limit.
    #[must_use]
    pub const fn is_data_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Check if this error is the result of an intentional shutdown
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let gatt_error = BikeError::GattOperation("service missing".to_string());
        assert!(gatt_error.is_connection_error());
        assert!(!gatt_error.is_data_error());
        assert!(!gatt_error.is_cancellation());

        let protocol_error = BikeError::Protocol("bad header".to_string());
        assert!(!protocol_error.is_connection_error());
        assert!(protocol_error.is_data_error());

        let timeout_error = BikeError::CommandTimeout { timeout_ms: 2000 };
        assert!(!timeout_error.is_connection_error());
        assert!(!timeout_error.is_data_error());

        assert!(BikeError::Cancelled.is_cancellation());
        assert!(!BikeError::AlreadyRunning.is_data_error());
    }

    #[test]
    fn test_error_display() {
        let error = BikeError::CommandTimeout { timeout_ms: 2000 };
        assert_eq!(format!("{error}"), "Command timed out after 2000ms");

        let error = BikeError::Protocol("out of sync result".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Protocol error"));
        assert!(error_string.contains("out of sync result"));
    }
}
