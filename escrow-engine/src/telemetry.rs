//! Tracing setup for binaries embedding the engine

use crate::{error::EscrowError, EscrowResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber; `RUST_LOG` wins over `default_filter`
pub fn init_tracing(default_filter: &str) -> EscrowResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| EscrowError::config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| EscrowError::internal(format!("Tracing already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_only_once() {
        assert!(init_tracing("escrow_engine=debug").is_ok());
        assert!(matches!(
            init_tracing("info"),
            Err(EscrowError::Internal(_))
        ));
    }
}
