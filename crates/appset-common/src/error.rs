//! Error types for the appset controller
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries enough context (generator variant, application name,
//! provider) to locate the failing input without a debugger.

use thiserror::Error;

/// Main error type for appset operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A generator spec (or its variant pointer) was empty
    #[error("generator spec is empty")]
    EmptyGenerator,

    /// A list element failed to parse as a JSON object
    #[error("malformed list element at index {index}: {message}")]
    MalformedElement {
        /// Position of the element within `list.elements`
        index: usize,
        /// Parse failure description
        message: String,
    },

    /// The template could not be parsed
    #[error("template parse error: {message}")]
    TemplateParse {
        /// Parse failure description
        message: String,
    },

    /// The template parsed but failed during execution
    #[error("template execute error: {message}")]
    TemplateExecute {
        /// Execution failure description
        message: String,
    },

    /// The rendered template is not a valid application object
    #[error("template unmarshal error: {message}")]
    TemplateUnmarshal {
        /// Deserialization failure description
        message: String,
    },

    /// The rendered application is unusable (e.g. empty name)
    #[error("invalid rendered application: {message}")]
    InvalidTarget {
        /// What makes the target invalid
        message: String,
    },

    /// A composite generator was given fewer than two child generators
    #[error("composite generator requires exactly two child generators, got fewer")]
    LessThanTwoGenerators,

    /// A composite generator was given more than two child generators
    #[error("composite generator requires exactly two child generators, got more")]
    MoreThanTwoGenerators,

    /// A child of a composite generator has more than one populated variant
    #[error("child generator must have exactly one populated variant")]
    MoreThanOneInnerGenerators,

    /// Two parameter maps rendered to the same application name
    #[error("duplicate application name: {name}")]
    DuplicateName {
        /// The colliding application name
        name: String,
    },

    /// A remote system (Git, SCM API, plugin endpoint) could not be reached
    #[error("remote unavailable [{provider}]: {message}")]
    RemoteUnavailable {
        /// Which remote failed (e.g. "git", "github", "plugin")
        provider: String,
        /// Failure description
        message: String,
    },

    /// Optimistic-concurrency conflict while applying an application
    #[error("conflict applying application {name}")]
    Conflict {
        /// The application that hit the conflict
        name: String,
    },

    /// Invalid controller or generator configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// What is misconfigured
        message: String,
    },

    /// The reconcile deadline elapsed and in-flight work was aborted
    #[error("reconcile cancelled: deadline exceeded")]
    Cancelled,
}

impl Error {
    /// Create a malformed-element error for a list element
    pub fn malformed_element(index: usize, msg: impl Into<String>) -> Self {
        Self::MalformedElement {
            index,
            message: msg.into(),
        }
    }

    /// Create a template parse error
    pub fn template_parse(msg: impl Into<String>) -> Self {
        Self::TemplateParse {
            message: msg.into(),
        }
    }

    /// Create a template execution error
    pub fn template_execute(msg: impl Into<String>) -> Self {
        Self::TemplateExecute {
            message: msg.into(),
        }
    }

    /// Create a template unmarshal error
    pub fn template_unmarshal(msg: impl Into<String>) -> Self {
        Self::TemplateUnmarshal {
            message: msg.into(),
        }
    }

    /// Create an invalid-target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget {
            message: msg.into(),
        }
    }

    /// Create a remote-unavailable error
    pub fn remote(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Template and arity errors are not retryable: the spec must change
    /// before a retry can succeed. Remote and conflict errors are transient.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::EmptyGenerator => false,
            Error::MalformedElement { .. } => false,
            Error::TemplateParse { .. } => false,
            Error::TemplateExecute { .. } => false,
            Error::TemplateUnmarshal { .. } => false,
            Error::InvalidTarget { .. } => false,
            Error::LessThanTwoGenerators => false,
            Error::MoreThanTwoGenerators => false,
            Error::MoreThanOneInnerGenerators => false,
            Error::DuplicateName { .. } => false,
            Error::RemoteUnavailable { .. } => true,
            Error::Conflict { .. } => true,
            Error::Configuration { .. } => false,
            Error::Cancelled => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_errors_are_not_retryable() {
        assert!(!Error::template_parse("unbalanced end").is_retryable());
        assert!(!Error::template_execute("unknown helper").is_retryable());
        assert!(!Error::template_unmarshal("not an application").is_retryable());
    }

    #[test]
    fn remote_and_conflict_errors_are_retryable() {
        assert!(Error::remote("github", "503 from api.github.com").is_retryable());
        assert!(Error::Conflict {
            name: "guestbook-dev".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn arity_errors_are_not_retryable() {
        assert!(!Error::LessThanTwoGenerators.is_retryable());
        assert!(!Error::MoreThanTwoGenerators.is_retryable());
        assert!(!Error::MoreThanOneInnerGenerators.is_retryable());
    }

    #[test]
    fn malformed_element_reports_index() {
        let err = Error::malformed_element(2, "expected object");
        assert!(err.to_string().contains("index 2"));
        assert!(err.to_string().contains("expected object"));
    }

    #[test]
    fn remote_error_names_the_provider() {
        let err = Error::remote("plugin", "connection refused");
        assert!(err.to_string().contains("[plugin]"));
        assert!(err.to_string().contains("connection refused"));
    }
}
