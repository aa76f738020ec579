//! Subscriber setup and scoped log suppression.

use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
    }
    installed
}

/// Raises the log threshold to `warn` until dropped.
#[must_use = "the previous filter is restored when the guard is dropped"]
pub struct QuietGuard {
    previous: Option<String>,
}

pub fn quiet() -> QuietGuard {
    let Some(handle) = FILTER.get() else {
        return QuietGuard { previous: None };
    };
    if LevelFilter::current() <= LevelFilter::WARN {
        return QuietGuard { previous: None };
    }
    let previous = handle.with_current(|filter| filter.to_string()).ok();
    if handle.reload(EnvFilter::new("warn")).is_err() {
        return QuietGuard { previous: None };
    }
    QuietGuard { previous }
}

impl QuietGuard {
    pub fn is_active(&self) -> bool {
        self.previous.is_some()
    }
}

impl Drop for QuietGuard {
    fn drop(&mut self) {
        let (Some(previous), Some(handle)) = (self.previous.take(), FILTER.get()) else {
            return;
        };
        let restored = EnvFilter::try_new(&previous).unwrap_or_else(|_| EnvFilter::new("info"));
        if let Err(err) = handle.reload(restored) {
            warn!(error = %err, "could not restore the log filter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_without_subscriber_is_inert() {
        let guard = quiet();
        assert!(!guard.is_active());
    }
}
