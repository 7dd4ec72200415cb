use aws_config::{BehaviorVersion, SdkConfig, retry::RetryConfig};
use aws_lambda_events::event::sqs::{SqsBatchResponse, SqsEvent};
use aws_sdk_dynamodb as dynamodb;

pub async fn get_aws_config() -> SdkConfig {
    let version = BehaviorVersion::v2025_01_17();
    let retry_config = RetryConfig::disabled();

    aws_config::defaults(version)
        .retry_config(retry_config)
        .load()
        .await
}

async fn handle(
    ddb_client: &dynamodb::Client,
    request: lambda_runtime::LambdaEvent<SqsEvent>,
) -> Result<SqsBatchResponse, lambda_runtime::Error> {
    let config = worker::Config::from_env()?;

    Ok(worker::handle(ddb_client, &config, request.payload).await)
}

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    lambda_runtime::tracing::init_default_subscriber();

    let aws_config = get_aws_config().await;
    let ddb_client = &dynamodb::Client::new(&aws_config);

    let service_fn = lambda_runtime::service_fn(
        move |request: lambda_runtime::LambdaEvent<SqsEvent>| async move {
            handle(ddb_client, request).await
        },
    );
    lambda_runtime::run(service_fn).await
}
