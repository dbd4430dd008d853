//! Error handling for the notification engine
//!
//! This module defines all error types that can occur while validating,
//! throttling, rendering and dispatching notifications, and provides
//! utilities for error classification and conversion.

use thiserror::Error;

/// Result type alias for notification engine operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Main error type for the notification engine
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Missing user, content or channels. Rejected before any side effect.
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Per-user hourly throughput cap reached
    #[error("Rate limit exceeded for user {user_id} (limit {limit}/h)")]
    RateLimit { user_id: String, limit: u32 },

    /// Every requested channel is disabled or unavailable
    #[error("No available channel for user {user_id}")]
    NoAvailableChannel { user_id: String },

    /// A single channel attempt failed
    #[error("Delivery failed on {channel}: {message}")]
    ChannelDelivery { channel: String, message: String },

    #[error("Template not found: {name}")]
    TemplateNotFound { name: String },

    #[error("Template render error: {message}")]
    TemplateRender { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Shared key/value store errors
    #[error("Store error: {message}")]
    Store { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal engine errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NotificationError {
    /// Get the stable error code for logs and embedders
    pub fn error_code(&self) -> &'static str {
        match self {
            NotificationError::Validation { .. } => "VALIDATION_ERROR",
            NotificationError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            NotificationError::NoAvailableChannel { .. } => "NO_AVAILABLE_CHANNEL",
            NotificationError::ChannelDelivery { .. } => "CHANNEL_DELIVERY_ERROR",
            NotificationError::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            NotificationError::TemplateRender { .. } => "TEMPLATE_RENDER_ERROR",
            NotificationError::Config { .. } => "CONFIG_ERROR",
            NotificationError::Store { .. } => "STORE_ERROR",
            NotificationError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotificationError::Timeout { .. } => "TIMEOUT",
            NotificationError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Validation { .. } => false,
            NotificationError::RateLimit { .. } => true,
            NotificationError::NoAvailableChannel { .. } => false,
            NotificationError::ChannelDelivery { .. } => true,
            NotificationError::TemplateNotFound { .. } => false,
            NotificationError::TemplateRender { .. } => false,
            NotificationError::Config { .. } => false,
            NotificationError::Store { .. } => true,
            NotificationError::Serialization { .. } => false,
            NotificationError::Timeout { .. } => true,
            NotificationError::Internal { .. } => true,
        }
    }

    /// Errors raised before any side effect took place.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            NotificationError::Validation { .. }
                | NotificationError::RateLimit { .. }
                | NotificationError::NoAvailableChannel { .. }
        )
    }
}

// Conversion implementations for external error types

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Store {
            message: err.to_string(),
        }
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::channel_delivery("email", err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::channel_delivery("email", format!("SMTP error: {}", err))
    }
}

impl From<lettre::address::AddressError> for NotificationError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotificationError::channel_delivery("email", format!("Invalid address: {}", err))
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotificationError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else {
            NotificationError::ChannelDelivery {
                channel: "http".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::TemplateRender {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::TemplateError> for NotificationError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotificationError::TemplateRender {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotificationError {
    fn from(err: config::ConfigError) -> Self {
        NotificationError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NotificationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NotificationError::Timeout {
            operation: err.to_string(),
        }
    }
}

// Utility functions for creating specific error types

impl NotificationError {
    /// Create a validation error
    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(user_id: S, limit: u32) -> Self {
        Self::RateLimit {
            user_id: user_id.into(),
            limit,
        }
    }

    pub fn no_available_channel<S: Into<String>>(user_id: S) -> Self {
        Self::NoAvailableChannel {
            user_id: user_id.into(),
        }
    }

    /// Create a channel delivery error
    pub fn channel_delivery<S1: Into<String>, S2: Into<String>>(channel: S1, message: S2) -> Self {
        Self::ChannelDelivery {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn template_not_found<S: Into<String>>(name: S) -> Self {
        Self::TemplateNotFound { name: name.into() }
    }

    pub fn template_render<S: Into<String>>(message: S) -> Self {
        Self::TemplateRender {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            NotificationError::validation("field", "message").error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            NotificationError::rate_limit("user-1", 10).error_code(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            NotificationError::template_not_found("welcome").error_code(),
            "TEMPLATE_NOT_FOUND"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(NotificationError::timeout("publish").is_retryable());
        assert!(NotificationError::channel_delivery("email", "refused").is_retryable());
        assert!(!NotificationError::validation("user_id", "empty").is_retryable());
        assert!(!NotificationError::template_not_found("x").is_retryable());
    }

    #[test]
    fn test_rejections() {
        assert!(NotificationError::no_available_channel("u").is_rejection());
        assert!(NotificationError::rate_limit("u", 1).is_rejection());
        assert!(!NotificationError::store("down").is_rejection());
    }

    #[test]
    fn test_error_display() {
        let error = NotificationError::rate_limit("user-1", 10);
        assert_eq!(
            error.to_string(),
            "Rate limit exceeded for user user-1 (limit 10/h)"
        );
    }

    #[test]
    fn test_from_conversions() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let notification_error: NotificationError = json_error.into();
        assert!(matches!(
            notification_error,
            NotificationError::Serialization { .. }
        ));
    }
}
