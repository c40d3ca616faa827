//! Attempt loop of a single call.
//!
//! A call moves through [`CallState`]:
//!
//! ```text
//! Pending -> Sending -> Succeeded
//!                    -> Classifying -> Succeeded | Failed
//!                                   -> Retrying -> Sending
//! ```
//!
//! Attempts are strictly sequential. Only transport failures are retried;
//! once a response arrives the call settles. Stream bodies are read by the
//! first attempt and never retried.

use std::{collections::BTreeMap, time::Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    classify,
    completion::CallOutcome,
    error::{NetworkError, NetworkErrorCode},
    events::{ClientEvent, EventBus},
    options::{CallOptions, ResponseEncoding},
    pool::ConnectionPool,
    request::RequestBody,
    response::{decode_body, RawResponse, Reply, ResponseEnvelope},
    retry::{AttemptContext, AttemptFailure, AttemptHistory, RetryPolicy},
    util::duration_millis,
    ApiClientError, WireRequest,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallState {
    Pending,
    Sending,
    Classifying,
    Retrying,
    Succeeded,
    Failed,
}

impl CallState {
    fn can_enter(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Pending, Sending)
                | (Sending, Succeeded)
                | (Sending, Classifying)
                | (Classifying, Succeeded)
                | (Classifying, Retrying)
                | (Classifying, Failed)
                | (Retrying, Sending)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, CallState::Succeeded | CallState::Failed)
    }
}

struct StateTracker<'a> {
    state: CallState,
    request: &'a WireRequest,
}

impl StateTracker<'_> {
    fn enter(&mut self, next: CallState, attempt: u32) {
        debug_assert!(
            !self.state.is_terminal() && self.state.can_enter(next),
            "invalid call transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(
            method = %self.request.method,
            url = %self.request.url,
            attempt,
            from = ?self.state,
            to = ?next,
            "call state"
        );
        self.state = next;
    }
}

/// Response of the attempt that got one.
struct Exchange {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

enum AttemptError {
    /// No response; may be retried.
    Transport(reqwest::Error),
    /// The request cannot be sent at all.
    Fatal(ApiClientError),
}

/// Shared resources a call runs against.
pub(crate) struct Engine<'a> {
    pub(crate) pool: ConnectionPool,
    pub(crate) policy: RetryPolicy,
    pub(crate) events: &'a EventBus,
    pub(crate) shutdown: &'a CancellationToken,
}

impl Engine<'_> {
    /// Sends `request` until it settles and classifies the result.
    pub(crate) async fn run(&self, request: WireRequest, options: &CallOptions) -> CallOutcome {
        let mut tracker = StateTracker {
            state: CallState::Pending,
            request: &request,
        };

        if self.shutdown.is_cancelled() {
            return CallOutcome {
                result: Err(ApiClientError::Shutdown),
                response: None,
                request: Some(request.clone()),
            };
        }
        let host = match request.host_key() {
            Ok(host) => host,
            Err(err) => {
                return CallOutcome {
                    result: Err(err),
                    response: None,
                    request: Some(request.clone()),
                }
            }
        };

        let started = Instant::now();
        let streamed = request.is_streamed();
        let max_attempts = self.policy.max_attempts();
        let mut history = AttemptHistory::default();
        let mut attempt = 1u32;

        loop {
            tracker.enter(CallState::Sending, attempt);
            let attempt_started = Instant::now();

            let err = match self.send_once(&request, &host).await {
                Ok(exchange) => {
                    let retry_info = history.finish(attempt, None);
                    self.events.emit(ClientEvent::RequestCompleted {
                        method: request.method,
                        url: request.url.clone(),
                        status: exchange.status,
                        attempts: attempt,
                        duration_ms: duration_millis(started.elapsed()),
                    });
                    let raw = RawResponse {
                        status: exchange.status,
                        headers: exchange.headers,
                        retry_info,
                    };
                    let result = settle(&mut tracker, &raw, exchange.body, options, attempt);
                    return CallOutcome {
                        result,
                        response: Some(raw),
                        request: Some(request.clone()),
                    };
                }
                Err(AttemptError::Fatal(err)) => {
                    tracing::debug!(error = %err, "request could not be sent");
                    return CallOutcome {
                        result: Err(err),
                        response: None,
                        request: Some(request.clone()),
                    };
                }
                Err(AttemptError::Transport(err)) => err,
            };

            tracker.enter(CallState::Classifying, attempt);
            let failure = AttemptFailure {
                code: classify::network_code(&err),
                attempt,
                elapsed: attempt_started.elapsed(),
            };

            let strategy_supported = if streamed {
                None
            } else {
                let context = AttemptContext {
                    request: &request,
                    attempt,
                    max_attempts,
                    retry_on_transient_error: options.retry_on_transient_error,
                };
                Some(self.policy.strategy().decide(&failure, &context).retry)
            };
            let will_retry = strategy_supported == Some(true) && attempt < max_attempts;

            self.events.emit(ClientEvent::NetworkError {
                method: request.method,
                url: request.url.clone(),
                code: failure.code,
                attempt,
                will_retry,
            });

            if !will_retry {
                tracker.enter(CallState::Failed, attempt);
                if streamed {
                    tracing::debug!(code = %failure.code, "stream body cannot be resent");
                } else if strategy_supported == Some(false) {
                    tracing::debug!(code = %failure.code, "retry strategy does not support error");
                } else {
                    tracing::debug!(code = %failure.code, max_attempts, "retry attempts exhausted");
                }
                let retry_info = history.finish(attempt, strategy_supported);
                return network_failure(failure.code, retry_info, &request, err);
            }

            history.record(&failure);
            tracker.enter(CallState::Retrying, attempt);
            tracing::warn!(
                method = %request.method,
                url = %request.url,
                code = %failure.code,
                attempt,
                max_attempts,
                delay_ms = duration_millis(self.policy.retry_delay()),
                "retrying request after network error"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        "client factory shut down; abandoning retries"
                    );
                    self.events.emit(ClientEvent::NetworkError {
                        method: request.method,
                        url: request.url.clone(),
                        code: failure.code,
                        attempt,
                        will_retry: false,
                    });
                    tracker.state = CallState::Failed;
                    let retry_info = history.finish(attempt, strategy_supported);
                    return network_failure(failure.code, retry_info, &request, err);
                }
                _ = tokio::time::sleep(self.policy.retry_delay()) => {}
            }
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        request: &WireRequest,
        host: &str,
    ) -> std::result::Result<Exchange, AttemptError> {
        let _lease = self.pool.acquire(host).await.map_err(AttemptError::Fatal)?;
        let http = self.pool.http();

        let mut builder = http.request(request.method.to_reqwest(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.encoding == ResponseEncoding::Json && request.header("accept").is_none() {
            builder = builder.header(reqwest::header::ACCEPT, "application/json");
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Stream(stream) => match stream.take() {
                Some(body) => builder.body(body),
                None => {
                    return Err(AttemptError::Fatal(ApiClientError::Validation(
                        "stream body was already consumed".to_owned(),
                    )))
                }
            },
        };

        let built = builder.build().map_err(|err| {
            AttemptError::Fatal(ApiClientError::Validation(format!(
                "cannot build request: {err}"
            )))
        })?;
        let response = http.execute(built).await.map_err(AttemptError::Transport)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let body = response.bytes().await.map_err(AttemptError::Transport)?;

        Ok(Exchange {
            status,
            headers,
            body,
        })
    }
}

fn settle(
    tracker: &mut StateTracker<'_>,
    raw: &RawResponse,
    body: Bytes,
    options: &CallOptions,
    attempt: u32,
) -> crate::Result<Reply> {
    let body = decode_body(body, tracker.request.encoding);

    if (200..300).contains(&raw.status) {
        tracker.enter(CallState::Succeeded, attempt);
        return Ok(reply(raw, body, options));
    }

    tracker.enter(CallState::Classifying, attempt);
    if raw.status == 404 && options.not_found_is_null {
        tracker.enter(CallState::Succeeded, attempt);
        return Ok(reply(raw, None, options));
    }

    tracker.enter(CallState::Failed, attempt);
    Err(classify::response_error(raw, body.as_ref(), tracker.request))
}

fn reply(
    raw: &RawResponse,
    body: Option<crate::response::ResponseBody>,
    options: &CallOptions,
) -> Reply {
    if options.details {
        Reply::Details(ResponseEnvelope {
            status: raw.status,
            headers: raw.headers.clone(),
            body,
            retry_info: raw.retry_info.clone(),
        })
    } else {
        Reply::Body(body)
    }
}

fn network_failure(
    code: NetworkErrorCode,
    retry_info: crate::error::RetryInfo,
    request: &WireRequest,
    source: reqwest::Error,
) -> CallOutcome {
    let error = NetworkError {
        code,
        retry_info,
        request: request.clone(),
        source: Some(source),
    };
    CallOutcome {
        result: Err(error.into()),
        response: None,
        request: Some(request.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::{CallState, Engine};
    use crate::{
        events::{ClientEvent, EventBus},
        options::CallOptions,
        pool::{AgentOptions, ConnectionPool},
        retry::{AttemptContext, AttemptFailure, FnStrategy, RetryPolicy},
        ApiClientError, Method, WireRequest,
    };

    fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/notes")
    }

    #[tokio::test]
    async fn shutdown_wins_over_a_zero_retry_delay() {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_retry_delay(Duration::ZERO)
            .with_strategy(FnStrategy(
                move |_: &AttemptFailure, _: &AttemptContext<'_>| {
                    trigger.cancel();
                    true
                },
            ));
        let events = EventBus::default();
        let mut received = events.subscribe();
        let engine = Engine {
            pool: ConnectionPool::new(AgentOptions::default()).unwrap(),
            policy,
            events: &events,
            shutdown: &shutdown,
        };

        let outcome = engine
            .run(
                WireRequest::new(Method::Get, closed_port_url()),
                &CallOptions::default(),
            )
            .await;

        let err = outcome.result.unwrap_err();
        let network = match &err {
            ApiClientError::Network(network) => network,
            other => panic!("expected a network error, got {other:?}"),
        };
        assert_eq!(network.retry_info.tries, 1);

        let verdicts: Vec<_> = std::iter::from_fn(|| received.try_recv().ok())
            .map(|event| match event {
                ClientEvent::NetworkError {
                    attempt,
                    will_retry,
                    ..
                } => (attempt, will_retry),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(verdicts, vec![(1, true), (1, false)]);
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use CallState::*;

        assert!(Pending.can_enter(Sending));
        assert!(Sending.can_enter(Succeeded));
        assert!(Sending.can_enter(Classifying));
        assert!(Classifying.can_enter(Retrying));
        assert!(Retrying.can_enter(Sending));

        assert!(!Pending.can_enter(Succeeded));
        assert!(!Retrying.can_enter(Failed));
        assert!(!Failed.can_enter(Sending));
        assert!(!Succeeded.can_enter(Classifying));
    }

    #[test]
    fn only_settled_states_are_terminal() {
        assert!(CallState::Succeeded.is_terminal());
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Retrying.is_terminal());
        assert!(!CallState::Pending.is_terminal());
    }
}
