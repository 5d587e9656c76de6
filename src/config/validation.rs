use std::{collections::HashSet, net::SocketAddr};

use crate::{
    config::models::{GatewayConfig, TlsSettings},
    core::{rate_limit::RateLimitConfigDto, tls::normalize_host},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Invalid proxy configuration: {message}")]
    InvalidRoutes { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator. Collects every problem before failing.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.admin_listen_addr) {
            errors.push(e);
        }
        if config.service_name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "service_name".to_string(),
            });
        }
        errors.extend(Self::validate_rate_limits(&config.rate_limits));
        if let Err(e) = config.proxy.validate() {
            errors.push(ValidationError::InvalidRoutes {
                message: e.to_string(),
            });
        }
        errors.extend(Self::validate_tls(&config.tls));

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            }),
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:9090')".to_string(),
            })
    }

    /// Only the window is strict here; negative limits are clamped on apply.
    fn validate_rate_limits(rate_limits: &RateLimitConfigDto) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if rate_limits.window_seconds < 1 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limits.window_seconds".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        for prefix in rate_limits.routes.keys() {
            if prefix.trim().trim_matches('/').is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limits.routes".to_string(),
                    message: format!("Route prefix '{prefix}' is blank"),
                });
            }
        }
        errors
    }

    fn validate_tls(tls: &TlsSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut hosts = HashSet::new();
        for (i, binding) in tls.bindings.iter().enumerate() {
            match normalize_host(&binding.host) {
                None => errors.push(ValidationError::InvalidTls {
                    message: format!("Binding {} has an empty host", i + 1),
                }),
                Some(host) if !hosts.insert(host.clone()) => {
                    errors.push(ValidationError::InvalidTls {
                        message: format!("Host '{host}' is bound more than once"),
                    });
                }
                Some(_) => {}
            }
            if binding.cert_path.as_os_str().is_empty() || binding.key_path.as_os_str().is_empty()
            {
                errors.push(ValidationError::InvalidTls {
                    message: format!(
                        "Binding for '{}' needs both cert_path and key_path",
                        binding.host
                    ),
                });
            }
        }
        errors
    }

    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
