use std::path::PathBuf;
use std::sync::Arc;

use resolver::AppConfig;
use resolver::resolution::ReqwestHttpClient;
use resolver::server::services::ResolverServices;

fn config(user_agent: &str) -> AppConfig {
    AppConfig {
        providers_file: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/providers.json")),
        user_agent: user_agent.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_http_client_rejects_an_unusable_user_agent() {
    assert!(ReqwestHttpClient::new("Mozilla/5.0").is_ok());
    assert!(ReqwestHttpClient::new("bad\nagent").is_err());
}

#[tokio::test]
async fn test_startup_fails_instead_of_dropping_the_client_settings() {
    let Err(error) = ResolverServices::new(Arc::new(config("bad\nagent"))) else {
        panic!("services started with a user agent that can't be sent");
    };
    assert!(format!("{:#}", error).contains("failed to build the upstream http client"));

    let services = ResolverServices::new(Arc::new(config("Mozilla/5.0"))).unwrap();
    assert_eq!(services.orchestrator.registry().len(), 4);
}
