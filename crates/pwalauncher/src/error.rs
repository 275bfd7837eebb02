use thiserror::Error;

/// Failures inside request handling. All of them end as `500`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no dispatcher for mount {0}")]
    MissingDispatcher(usize),

    #[error("redirect location '{0}' is not a valid header value")]
    InvalidRedirect(String),
}

impl GatewayError {
    /// Short machine-readable kind for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MissingDispatcher(_) => "routing",
            GatewayError::InvalidRedirect(_) => "redirect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let e = GatewayError::MissingDispatcher(3);
        assert_eq!(e.kind(), "routing");
        assert_eq!(e.to_string(), "no dispatcher for mount 3");

        let e = GatewayError::InvalidRedirect("https://bad\nhost/".into());
        assert_eq!(e.kind(), "redirect");
    }
}
