//! Process wide error reporting, independent of the regular log stream.

use crate::{errors::ControllerError, utils::metric_name};

use opentelemetry::{KeyValue, global, metrics::Counter};
use std::any::Any;

const ERROR_SINK: &'static str = "error_sink";

pub(crate) trait ErrorSink: Send + Sync {
    fn handle_error(&self, error: &ControllerError);
}

/// Reports errors to the log and counts them by kind.
pub(crate) struct LogErrorSink {
    errors: Counter<u64>,
}

impl LogErrorSink {
    pub fn new() -> Self {
        let errors = global::meter(ERROR_SINK)
            .u64_counter(metric_name("errors"))
            .with_description("Count of errors reported by the controller")
            .build();
        Self { errors }
    }
}

impl ErrorSink for LogErrorSink {
    fn handle_error(&self, e: &ControllerError) {
        let kind = match e {
            ControllerError::InvalidKey(_) => "invalid_key",
            ControllerError::CacheSync(_) => "cache_sync",
            ControllerError::KubeApi(_) => "kube_api",
            ControllerError::Panicked { .. } => "panic",
            ControllerError::Any(_) => "other",
        };
        self.errors.add(1, &[KeyValue::new("kind", kind)]);
        error!("{}", e);
    }
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
