use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Environment;

const DEFAULT_FILTER: &str = "chat_engine=info,tower_http=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(environment: Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match environment {
        Environment::Prod => registry
            .with(fmt::layer().json().with_current_span(false))
            .init(),
        Environment::Dev | Environment::Stg => registry.with(fmt::layer().pretty()).init(),
    }
}
