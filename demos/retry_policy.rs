use std::time::Duration;

use intercall_http::{
    AgentOptions, ApiClientError, ApiClientFactory, AttemptContext, AttemptFailure, Call,
    ClientEvent, FactoryOptions, FnStrategy, NetworkErrorCode, RetryPolicy,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("intercall_http=debug")),
        )
        .init();

    let api_url =
        std::env::var("INTERCALL_API_URL").unwrap_or_else(|_| "http://127.0.0.1:9".to_owned());

    // Retry resets and timeouts for any method, give up on everything else.
    let retry = RetryPolicy::default()
        .with_max_attempts(4)
        .with_retry_delay(Duration::from_millis(250))
        .with_strategy(FnStrategy(|failure: &AttemptFailure, _: &AttemptContext<'_>| {
            failure.code.never_reached_peer()
                || matches!(
                    failure.code,
                    NetworkErrorCode::ConnectionReset | NetworkErrorCode::TimedOut
                )
        }));

    let factory = ApiClientFactory::with_options(
        api_url,
        FactoryOptions {
            retry,
            agent: AgentOptions {
                max_sockets_per_host: 8,
                connect_timeout: Some(Duration::from_secs(2)),
                ..AgentOptions::default()
            },
            ..FactoryOptions::default()
        },
    )?;

    let mut events = factory.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClientEvent::NetworkError {
                code,
                attempt,
                will_retry,
                ..
            } = event
            {
                println!("attempt {attempt} failed with {code} (retry: {will_retry})");
            }
        }
    });

    let client = factory.get_client(None, "retry-demo");
    match client
        .post(Call::new("/jobs").timeout(Duration::from_secs(1)))
        .await
    {
        Ok(reply) => println!("job accepted: {:?}", reply.json()),
        Err(ApiClientError::Network(err)) => {
            println!(
                "gave up after {} attempts: {}",
                err.retry_info.tries,
                serde_json::to_string(&err)?
            );
        }
        Err(err) => return Err(err.into()),
    }

    factory.shutdown();
    Ok(())
}
