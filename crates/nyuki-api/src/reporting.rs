//! Exception reporting for capability failures.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use nyuki_protocol::Method;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

/// A handler failure caught by the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exception {
    pub capability: String,
    pub method: Method,
    pub path: String,
    pub message: String,
}

pub type ExceptionHook = Arc<dyn Fn(&Exception) + Send + Sync>;

/// Where caught exceptions go. Every report is logged; the hook, when set,
/// receives it afterwards.
#[derive(Clone, Default)]
pub struct ExceptionReporter {
    hook: Arc<RwLock<Option<ExceptionHook>>>,
}

impl ExceptionReporter {
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&Exception) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    pub fn report(&self, exception: &Exception) {
        error!(
            capability = %exception.capability,
            method = %exception.method,
            path = %exception.path,
            message = %exception.message,
            "capability raised an exception"
        );

        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(|| hook(exception))).is_err() {
                error!(capability = %exception.capability, "exception hook panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nyuki_protocol::Method;
    use parking_lot::Mutex;

    use super::{Exception, ExceptionReporter};

    fn exception() -> Exception {
        Exception {
            capability: "message".to_owned(),
            method: Method::Get,
            path: "/message".to_owned(),
            message: "boom".to_owned(),
        }
    }

    #[test]
    fn hook_receives_reports_until_cleared() {
        let reporter = ExceptionReporter::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            reporter.set_hook(move |exception| seen.lock().push(exception.message.clone()));
        }

        reporter.report(&exception());
        reporter.clear_hook();
        reporter.report(&exception());
        assert_eq!(*seen.lock(), vec!["boom"]);
    }

    #[test]
    fn panicking_hook_is_contained() {
        let reporter = ExceptionReporter::default();
        reporter.set_hook(|_| panic!("hook failure"));
        reporter.report(&exception());
    }
}
