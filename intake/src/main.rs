use anyhow::Result;
use aws_config::{BehaviorVersion, SdkConfig, retry::RetryConfig};
use aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse};
use aws_sdk_sqs as sqs;
use intake::{Intake, SqsQueue};
use lambda_runtime::tracing;
use std::sync::Arc;

pub async fn get_aws_config() -> SdkConfig {
    let version = BehaviorVersion::v2025_01_17();
    let retry_config = RetryConfig::adaptive().with_max_attempts(3);

    aws_config::defaults(version)
        .retry_config(retry_config)
        .load()
        .await
}

async fn handle(
    intake: &Intake<SqsQueue>,
    request: lambda_runtime::LambdaEvent<ApiGatewayProxyRequest>,
) -> Result<ApiGatewayProxyResponse> {
    let (request, context) = request.into_parts();
    tracing::info!(request_id = %context.request_id, "Intake request received");

    Ok(intake.handle(&request).await)
}

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    lambda_runtime::tracing::init_default_subscriber();

    let config = intake::Config::from_env()?;
    let aws_config = get_aws_config().await;

    let queue = config
        .queue_url
        .map(|queue_url| Arc::new(SqsQueue::new(sqs::Client::new(&aws_config), queue_url)));
    let intake = &Intake::new(queue, config.max_batch);

    let service_fn = lambda_runtime::service_fn(
        move |request: lambda_runtime::LambdaEvent<ApiGatewayProxyRequest>| async move {
            handle(intake, request).await
        },
    );
    lambda_runtime::run(service_fn).await
}
