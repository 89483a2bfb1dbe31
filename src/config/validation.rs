use super::models::{Config, StorageProvider};
use reqwest::Url;
use thiserror::Error;

/// Largest request body the front end may be configured to accept
const MAX_PAYLOAD_LIMIT: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.queue_size must be greater than zero")]
    InvalidQueueSize,

    #[error("max_payload_bytes ({actual}) exceeds limit of 16MB ({limit})")]
    PayloadSizeExceedsLimit { actual: u64, limit: u64 },

    #[error("Invalid primary endpoint '{endpoint}', expected an http:// or https:// URL")]
    InvalidPrimaryEndpoint { endpoint: String },

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("Storage provider is S3 but no region is configured")]
    MissingS3Region,

    #[error("Storage provider is S3 but missing credentials (access_key or secret_key)")]
    MissingS3Credentials,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_server(config)?;
    validate_primary(config)?;
    validate_overflow(config)?;

    if config.telemetry.interval.as_duration().is_zero() {
        return Err(ValidationError::NotPositive {
            field: "telemetry.interval",
        });
    }
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    if config.server.queue_size == 0 {
        return Err(ValidationError::InvalidQueueSize);
    }

    let actual = config.server.max_payload_bytes.as_u64();
    if actual > MAX_PAYLOAD_LIMIT {
        return Err(ValidationError::PayloadSizeExceedsLimit {
            actual,
            limit: MAX_PAYLOAD_LIMIT,
        });
    }
    Ok(())
}

fn validate_primary(config: &Config) -> Result<(), ValidationError> {
    let primary = &config.primary;

    let valid = Url::parse(&primary.endpoint)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false);
    if !valid {
        return Err(ValidationError::InvalidPrimaryEndpoint {
            endpoint: primary.endpoint.clone(),
        });
    }

    if primary.breaker.error_threshold == 0 {
        return Err(ValidationError::NotPositive {
            field: "primary.breaker.error_threshold",
        });
    }
    if primary.breaker.timeout.as_duration().is_zero() {
        return Err(ValidationError::NotPositive {
            field: "primary.breaker.timeout",
        });
    }
    if primary.request_timeout.as_duration().is_zero() {
        return Err(ValidationError::NotPositive {
            field: "primary.request_timeout",
        });
    }
    if primary.max_in_flight == 0 {
        return Err(ValidationError::NotPositive {
            field: "primary.max_in_flight",
        });
    }
    Ok(())
}

fn validate_overflow(config: &Config) -> Result<(), ValidationError> {
    let overflow = &config.overflow;

    if overflow.flush_messages == 0 {
        return Err(ValidationError::NotPositive {
            field: "overflow.flush_messages",
        });
    }
    if overflow.flush_frequency.as_duration().is_zero() {
        return Err(ValidationError::NotPositive {
            field: "overflow.flush_frequency",
        });
    }

    if overflow.provider == StorageProvider::S3 {
        if overflow.region.is_none() {
            return Err(ValidationError::MissingS3Region);
        }
        if overflow.access_key.is_none() || overflow.secret_key.is_none() {
            return Err(ValidationError::MissingS3Credentials);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::{ByteSize, HumanDuration};

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_queue_size() {
        let mut config = Config::default();
        config.server.queue_size = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidQueueSize)));
    }

    #[test]
    fn test_rejects_oversized_payload_limit() {
        let mut config = Config::default();
        config.server.max_payload_bytes = ByteSize(64 * 1024 * 1024);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::PayloadSizeExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_primary_endpoint() {
        let mut config = Config::default();
        config.primary.endpoint = "kafka://broker:9092".to_string();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidPrimaryEndpoint { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let mut config = Config::default();
        config.overflow.flush_frequency = HumanDuration::from_millis(0);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::NotPositive {
                field: "overflow.flush_frequency"
            })
        ));
    }

    #[test]
    fn test_s3_requires_region_and_credentials() {
        let mut config = Config::default();
        config.overflow.provider = StorageProvider::S3;
        assert!(matches!(validate(&config), Err(ValidationError::MissingS3Region)));

        config.overflow.region = Some("us-east-1".to_string());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingS3Credentials)
        ));

        config.overflow.access_key = Some("key".to_string());
        config.overflow.secret_key = Some("secret".to_string());
        assert!(validate(&config).is_ok());
    }
}
