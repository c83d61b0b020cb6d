//! Tracing and correlated logging.

use std::sync::Arc;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

/// Initialise the global `tracing` subscriber with a standard `fmt` layer.
///
/// Respects the `RUST_LOG` environment variable; the configured
/// `LOG_LEVEL` is the fallback filter when `RUST_LOG` is not set.
///
/// Call this once, at the very start of `main`, before any tracing macro.
pub fn init_tracing(default_level: &str) {
    let fallback = default_level.to_string();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

/// Run a future inside a named span; the span ends when the future
/// resolves, whether it returns or errors.
pub async fn with_span<F, T>(name: &'static str, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    fut.instrument(tracing::info_span!("gati", op = name)).await
}

/// Log severity for the correlated logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured logger carrying a copy-on-write context map.
///
/// `child` attaches additional fields without mutating the parent; handles
/// are cheap to clone and safe to move across tasks. Every record is
/// emitted through `tracing` with the accumulated context rendered as a
/// single structured field.
#[derive(Clone)]
pub struct Logger {
    fields: Arc<Vec<(String, String)>>,
}

impl Logger {
    pub fn new() -> Self {
        Logger {
            fields: Arc::new(Vec::new()),
        }
    }

    /// Root logger for one request, pre-tagged with the correlation ids.
    pub fn for_request(request_id: &str, trace_id: &str, client_id: &str) -> Self {
        Logger {
            fields: Arc::new(vec![
                ("request_id".to_string(), request_id.to_string()),
                ("trace_id".to_string(), trace_id.to_string()),
                ("client_id".to_string(), client_id.to_string()),
            ]),
        }
    }

    /// Derive a logger with extra context. Copy-on-write: the parent keeps
    /// its own field list.
    pub fn child(&self, context: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut fields = (*self.fields).clone();
        fields.extend(context);
        Logger {
            fields: Arc::new(fields),
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let context = self.render_context();
        match level {
            LogLevel::Trace => tracing::trace!(context = %context, "{message}"),
            LogLevel::Debug => tracing::debug!(context = %context, "{message}"),
            LogLevel::Info => tracing::info!(context = %context, "{message}"),
            LogLevel::Warn => tracing::warn!(context = %context, "{message}"),
            LogLevel::Error => tracing::error!(context = %context, "{message}"),
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// The accumulated context fields, in attachment order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    fn render_context(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}
