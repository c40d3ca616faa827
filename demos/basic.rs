use intercall_http::{ApiClientFactory, Call, CallContext};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let factory = ApiClientFactory::from_env()?;

    let context = CallContext {
        user_id: Some(42),
        remote_app_code: Some("demo".to_owned()),
        request_id: Some("demo-request-1".to_owned()),
        ..CallContext::default()
    };
    let client = factory.get_client_by_context(&context);

    let created = client
        .post(Call::new("/notes").json(&json!({"title": "test note"}))?)
        .await?;
    println!("created: {:?}", created.json());

    let notes = client
        .get(
            Call::new("/notes")
                .filter(json!({"title": "test note"}))
                .order(json!(["date", "desc"]))
                .range(json!([0, 10])),
        )
        .await?;
    println!("notes: {:?}", notes.json());

    let exists = client.exists(["/notes/??", "missing/id"]).await?;
    println!("missing note exists: {exists}");

    println!("pool: {}", factory.pool_stats());
    Ok(())
}
