//! Standalone adapter against a mock engine API.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use proxy_discovery::config::ProviderOptions;
use proxy_discovery::discovery::{Backend, Connector, DockerConnector, HealthState, NetworkMode};
use proxy_discovery::provider::Reconciler;

use common::start_mock_engine;

const VERSION: &str = r#"{"Version":"24.0.7","ApiVersion":"1.43"}"#;

fn inspect(id: &str, name: &str, ip: &str, labels: &str, health: Option<&str>) -> String {
    let health = health
        .map(|status| format!(r#","Health":{{"Status":"{status}"}}"#))
        .unwrap_or_default();
    format!(
        r#"{{
            "Id": "{id}",
            "Name": "/{name}",
            "State": {{"Running": true{health}}},
            "Config": {{"Labels": {labels}}},
            "HostConfig": {{"NetworkMode": "default"}},
            "NetworkSettings": {{
                "Ports": {{"80/tcp": null}},
                "Networks": {{"bridge": {{"NetworkID": "net1", "IPAddress": "{ip}"}}}}
            }}
        }}"#
    )
}

async fn engine() -> String {
    let mut routes = HashMap::new();
    routes.insert("/version", VERSION.to_string());
    routes.insert(
        "/containers/json",
        r#"[{"Id":"aaa"},{"Id":"bbb"},{"Id":"ccc"}]"#.to_string(),
    );
    routes.insert(
        "/containers/aaa/json",
        inspect(
            "aaa",
            "web_1",
            "172.17.0.2",
            r#"{"com.docker.compose.service":"web","com.docker.compose.project":"shop"}"#,
            None,
        ),
    );
    routes.insert(
        "/containers/bbb/json",
        inspect(
            "bbb",
            "web_2",
            "172.17.0.3",
            r#"{"com.docker.compose.service":"web","com.docker.compose.project":"shop"}"#,
            Some("healthy"),
        ),
    );
    routes.insert(
        "/containers/ccc/json",
        inspect(
            "ccc",
            "hidden",
            "172.17.0.4",
            r#"{"traefik.enable":"false"}"#,
            None,
        ),
    );
    start_mock_engine(routes).await
}

#[tokio::test]
async fn test_lists_running_containers() {
    let options = Arc::new(ProviderOptions {
        endpoint: engine().await,
        ..Default::default()
    });
    let backend = DockerConnector::new(options).connect().await.unwrap();
    let snapshot = backend.list_entities().await.unwrap();

    assert_eq!(snapshot.entities.len(), 3);
    let web = &snapshot.entities[0];
    assert_eq!(web.name, "web_1");
    assert_eq!(web.service_name, "web-shop");
    assert_eq!(web.network.mode, NetworkMode::Bridge);
    assert_eq!(web.network.ports[0].port, 80);
    assert!(web.extra.enable);
    assert_eq!(snapshot.entities[1].health, HealthState::Healthy);
    assert!(!snapshot.entities[2].extra.enable);
}

#[tokio::test]
async fn test_compose_replicas_share_one_service() {
    let options = Arc::new(ProviderOptions {
        endpoint: engine().await,
        ..Default::default()
    });
    let backend = DockerConnector::new(options.clone()).connect().await.unwrap();
    let snapshot = backend.list_entities().await.unwrap();
    let configuration = Reconciler::new("docker", options).unwrap().reconcile(&snapshot);

    let servers: Vec<_> = configuration.http.services["web-shop"]
        .load_balancer
        .as_ref()
        .unwrap()
        .servers
        .iter()
        .map(|s| s.url.as_str())
        .collect();
    assert_eq!(servers, vec!["http://172.17.0.2:80", "http://172.17.0.3:80"]);
    assert_eq!(configuration.http.routers["web-shop"].rule, "Host(`web-shop`)");
    assert!(!configuration.http.services.contains_key("hidden"));
}

#[tokio::test]
async fn test_unreachable_engine_fails_to_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let options = Arc::new(ProviderOptions {
        endpoint: format!("tcp://{addr}"),
        ..Default::default()
    });
    assert!(DockerConnector::new(options).connect().await.is_err());
}

#[tokio::test]
async fn test_container_gone_before_inspect_is_skipped() {
    let mut routes = HashMap::new();
    routes.insert("/version", VERSION.to_string());
    routes.insert(
        "/containers/json",
        r#"[{"Id":"aaa"},{"Id":"gone"}]"#.to_string(),
    );
    routes.insert(
        "/containers/aaa/json",
        inspect("aaa", "web", "172.17.0.2", "{}", None),
    );

    let options = Arc::new(ProviderOptions {
        endpoint: start_mock_engine(routes).await,
        ..Default::default()
    });
    let backend = DockerConnector::new(options).connect().await.unwrap();
    let snapshot = backend.list_entities().await.unwrap();

    assert_eq!(snapshot.entities.len(), 1);
    assert_eq!(snapshot.entities[0].name, "web");
}
