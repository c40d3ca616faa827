use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{ApiClientError, Result, WireRequest};

pub type ModificatorError = Box<dyn std::error::Error + Send + Sync>;

/// Async hook that may rewrite an assembled request before it is sent.
///
/// Returning an error aborts the call with [`ApiClientError::Modificator`].
pub trait RequestModificator: Send + Sync {
    fn modify<'a>(
        &'a self,
        request: &'a mut WireRequest,
    ) -> BoxFuture<'a, std::result::Result<(), ModificatorError>>;
}

/// Adapts an async function to [`RequestModificator`].
///
/// ```no_run
/// use futures::FutureExt;
/// use intercall_http::{modificator_fn, ModificatorError};
///
/// let sign = modificator_fn(|request| {
///     request.set_header("x-signature", "abc");
///     async { Ok::<(), ModificatorError>(()) }.boxed()
/// });
/// ```
pub fn modificator_fn<F>(f: F) -> Arc<dyn RequestModificator>
where
    F: for<'a> Fn(&'a mut WireRequest) -> BoxFuture<'a, std::result::Result<(), ModificatorError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnModificator(f))
}

struct FnModificator<F>(F);

impl<F> RequestModificator for FnModificator<F>
where
    F: for<'a> Fn(&'a mut WireRequest) -> BoxFuture<'a, std::result::Result<(), ModificatorError>>
        + Send
        + Sync,
{
    fn modify<'a>(
        &'a self,
        request: &'a mut WireRequest,
    ) -> BoxFuture<'a, std::result::Result<(), ModificatorError>> {
        (self.0)(request)
    }
}

/// Ordered set of modificators; registering the same one twice is a no-op.
#[derive(Clone, Default)]
pub(crate) struct ModificatorPipeline {
    entries: Vec<Arc<dyn RequestModificator>>,
}

impl fmt::Debug for ModificatorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModificatorPipeline")
            .field("len", &self.entries.len())
            .finish()
    }
}

fn same_modificator(a: &Arc<dyn RequestModificator>, b: &Arc<dyn RequestModificator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ModificatorPipeline {
    /// Returns `false` when `modificator` was already registered.
    pub(crate) fn add(&mut self, modificator: Arc<dyn RequestModificator>) -> bool {
        if self
            .entries
            .iter()
            .any(|entry| same_modificator(entry, &modificator))
        {
            return false;
        }
        self.entries.push(modificator);
        true
    }

    pub(crate) fn remove(&mut self, modificator: &Arc<dyn RequestModificator>) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !same_modificator(entry, modificator));
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Runs every modificator in registration order, each awaited before the next.
    pub(crate) async fn run(&self, request: &mut WireRequest) -> Result<()> {
        for (index, modificator) in self.entries.iter().enumerate() {
            modificator.modify(request).await.map_err(|err| {
                tracing::debug!(index, error = %err, "request modificator failed");
                ApiClientError::Modificator(err.to_string())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;

    use super::{modificator_fn, ModificatorError, ModificatorPipeline, RequestModificator};
    use crate::{ApiClientError, Method, WireRequest};

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> Arc<dyn RequestModificator> {
        let log = Arc::clone(log);
        modificator_fn(move |request| {
            let log = Arc::clone(&log);
            async move {
                tokio::task::yield_now().await;
                log.lock().unwrap().push(name);
                request.set_query(name, "1");
                Ok::<(), ModificatorError>(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ModificatorPipeline::default();
        pipeline.add(recorder(&log, "first"));
        pipeline.add(recorder(&log, "second"));

        let mut request = WireRequest::new(Method::Get, "http://svc.local/");
        pipeline.run(&mut request).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(request.query.len(), 2);
    }

    #[test]
    fn registration_is_idempotent_and_removable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let modificator = recorder(&log, "only");
        let mut pipeline = ModificatorPipeline::default();

        assert!(pipeline.add(Arc::clone(&modificator)));
        assert!(!pipeline.add(Arc::clone(&modificator)));
        assert_eq!(pipeline.len(), 1);

        assert!(pipeline.remove(&modificator));
        assert!(!pipeline.remove(&modificator));
        assert_eq!(pipeline.len(), 0);
    }

    #[tokio::test]
    async fn failure_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ModificatorPipeline::default();
        pipeline.add(modificator_fn(|_| {
            async { Err::<(), ModificatorError>("signing key unavailable".into()) }.boxed()
        }));
        pipeline.add(recorder(&log, "never"));

        let mut request = WireRequest::new(Method::Post, "http://svc.local/");
        let err = pipeline.run(&mut request).await.unwrap_err();

        assert!(
            matches!(err, ApiClientError::Modificator(message) if message.contains("signing key"))
        );
        assert!(log.lock().unwrap().is_empty());
    }
}
