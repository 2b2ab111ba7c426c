// Config loading, routing and the HTTP transport against live local backends
#[cfg(test)]
mod test {
    use std::{io::Write, net::SocketAddr, sync::Arc, time::Duration};

    use axum::{
        Json, Router,
        body::Body,
        extract::Path,
        http::{Request, StatusCode},
        routing::get,
    };
    use conflux::{
        adapters::{FixedSubscriberFactory, HttpBackendFactory, HttpHandler},
        config::{GatewayConfigValidator, loader::load_config},
        core::{DefaultFactory, GatewayService, ShadowFactory},
    };
    use serde_json::{Value, json};
    use tempfile::NamedTempFile;

    async fn spawn_backend() -> SocketAddr {
        let app = Router::new()
            .route(
                "/users/{id}",
                get(|Path(id): Path<u64>| async move {
                    Json(json!({"id": id, "name": "x", "password": "secret"}))
                }),
            )
            .route(
                "/users/{id}/orders",
                get(|Path(id): Path<u64>| async move {
                    Json(json!([{"user": id, "sku": "a"}, {"user": id, "sku": "b"}]))
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!({"late": true}))
                }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "gone") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn write_config(backend: SocketAddr) -> NamedTempFile {
        let host = format!("http://{backend}");
        let yaml = format!(
            r#"
listen_addr: "127.0.0.1:0"
timeout: 500ms
endpoints:
  - endpoint: /profile/{{id}}
    backends:
      - url_pattern: "/users/{{{{.id}}}}"
        hosts: ["{host}"]
        deny_list: ["password"]
      - url_pattern: "/users/{{{{.id}}}}/orders"
        hosts: ["{host}"]
        group: orders
  - endpoint: /slow
    timeout: 100ms
    backends:
      - url_pattern: /slow
        hosts: ["{host}"]
  - endpoint: /down
    backends:
      - url_pattern: /users/1
        hosts: ["http://127.0.0.1:1"]
      - url_pattern: /users/2
        hosts: ["http://127.0.0.1:1"]
  - endpoint: /stalled
    timeout: 100ms
    backends:
      - url_pattern: /slow
        hosts: ["{host}"]
      - url_pattern: /slow
        hosts: ["{host}"]
  - endpoint: /partial
    backends:
      - url_pattern: /users/1
        hosts: ["{host}"]
      - url_pattern: /missing
        hosts: ["{host}"]
    extra_config:
      proxy:
        static:
          strategy: incomplete
          data:
            degraded: true
"#
        );
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    async fn handler(backend: SocketAddr) -> HttpHandler {
        let file = write_config(backend);
        let config = load_config(file.path().to_str().unwrap()).await.unwrap();
        GatewayConfigValidator::validate(&config).unwrap();

        let factory = ShadowFactory::new(DefaultFactory::new(
            Arc::new(HttpBackendFactory::new().unwrap()),
            Arc::new(FixedSubscriberFactory),
        ));
        let service = GatewayService::new(Arc::new(config), &factory).unwrap();
        HttpHandler::new(Arc::new(service))
    }

    async fn get_json(handler: &HttpHandler, uri: &str) -> (StatusCode, Option<String>, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = handler.handle_request(req).await;
        let status = response.status();
        let completed = response
            .headers()
            .get("x-conflux-completed")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, completed, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_merged_endpoint_over_http() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, completed, body) = get_json(&handler, "/profile/7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed.as_deref(), Some("true"));
        assert_eq!(
            body,
            json!({
                "id": 7,
                "name": "x",
                "orders": {"collection": [{"user": 7, "sku": "a"}, {"user": 7, "sku": "b"}]}
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_endpoint_timeout_over_http() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, _, body) = get_json(&handler, "/slow").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], json!("context deadline exceeded"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_backends_fail_the_merge() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, completed, body) = get_json(&handler, "/down").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(completed, None);
        assert!(body["error"].is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_backends_time_out_the_merge() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, completed, body) = get_json(&handler, "/stalled").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(completed, None);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("context deadline exceeded")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backend_status_error_degrades_with_static_data() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, completed, body) = get_json(&handler, "/partial").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed.as_deref(), Some("false"));
        assert_eq!(body["id"], json!(1));
        assert_eq!(body["degraded"], json!(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_route() {
        let backend = spawn_backend().await;
        let handler = handler(backend).await;

        let (status, _, _) = get_json(&handler, "/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_config_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(
            br#"
endpoints:
  - endpoint: no-leading-slash
    backends:
      - url_pattern: /x
        hosts: ["ftp://nope"]
        concurrent_calls: 0
"#,
        )
        .unwrap();
        let config = load_config(file.path().to_str().unwrap()).await.unwrap();
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
