use std::{fmt, sync::Mutex};

use crate::{
    response::{RawResponse, Reply},
    util::lock_unpoisoned,
    ApiClientError, Result, WireRequest,
};

/// Callback receiving `(error, data, raw response, raw request)`.
pub type CompletionCallback = Box<
    dyn FnOnce(
            Option<&ApiClientError>,
            Option<&Reply>,
            Option<&RawResponse>,
            Option<&WireRequest>,
        ) + Send,
>;

/// Everything a finished call produced.
#[derive(Debug)]
pub(crate) struct CallOutcome {
    pub(crate) result: Result<Reply>,
    pub(crate) response: Option<RawResponse>,
    pub(crate) request: Option<WireRequest>,
}

/// Delivers a call outcome to a callback at most once.
///
/// A second delivery is a defect in the caller of `deliver`; it is logged at
/// error level and dropped so the first outcome stands.
pub struct Completion {
    callback: Mutex<Option<CompletionCallback>>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(
                Option<&ApiClientError>,
                Option<&Reply>,
                Option<&RawResponse>,
                Option<&WireRequest>,
            ) + Send
            + 'static,
    {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    pub fn is_delivered(&self) -> bool {
        lock_unpoisoned(&self.callback).is_none()
    }

    /// Returns `false` if the callback already ran.
    pub fn deliver(
        &self,
        error: Option<&ApiClientError>,
        data: Option<&Reply>,
        response: Option<&RawResponse>,
        request: Option<&WireRequest>,
    ) -> bool {
        let callback = lock_unpoisoned(&self.callback).take();
        match callback {
            Some(callback) => {
                callback(error, data, response, request);
                true
            }
            None => {
                tracing::error!(
                    error = error.map(tracing::field::display),
                    "completion callback delivered twice; dropping the second outcome"
                );
                false
            }
        }
    }

    pub(crate) fn deliver_outcome(&self, outcome: &CallOutcome) -> bool {
        let (error, data) = match &outcome.result {
            Ok(reply) => (None, Some(reply)),
            Err(err) => (Some(err), None),
        };
        self.deliver(
            error,
            data,
            outcome.response.as_ref(),
            outcome.request.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{CallOutcome, Completion};
    use crate::{response::Reply, ApiClientError};

    #[test]
    fn callback_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let completion = {
            let calls = Arc::clone(&calls);
            Completion::new(move |err, data, _, _| {
                assert!(err.is_none());
                assert!(data.is_some());
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        let outcome = CallOutcome {
            result: Ok(Reply::Body(None)),
            response: None,
            request: None,
        };
        assert!(completion.deliver_outcome(&outcome));
        assert!(completion.is_delivered());

        let err = ApiClientError::Validation("late".to_owned());
        assert!(!completion.deliver(Some(&err), None, None, None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_reach_the_callback() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let completion = {
            let seen = Arc::clone(&seen);
            Completion::new(move |err, data, _, _| {
                assert!(data.is_none());
                *seen.lock().unwrap() = err.map(|err| err.name().to_owned());
            })
        };
        let outcome = CallOutcome {
            result: Err(ApiClientError::Shutdown),
            response: None,
            request: None,
        };
        completion.deliver_outcome(&outcome);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("ShutdownError"));
    }
}
