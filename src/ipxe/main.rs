//! Chain-boot dispatcher: given a hardware service tag, serves either
//! the registration boot script or the machine-specific boot script, and
//! serves the published artifact tree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod script;

/// The API lookup is on the PXE boot path; keep its timeout modest so a
/// slow control plane degrades to registration boots instead of hanging.
const API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "metal-ipxe")]
#[command(version, about = "Metal enrollment chain-boot dispatcher")]
struct Args {
    /// Base URL the target machines use to reach this service.
    #[arg(long, env = "BASE_URL", default_value = "http://192.168.1.100")]
    base_url: String,

    /// Enrollment endpoint handed to the registration image.
    #[arg(
        long,
        env = "ENROLLMENT_URL",
        default_value = "http://enrollment.local:8080/api/v1/enroll"
    )]
    enrollment_url: String,

    /// Enrollment API base URL for machine lookups.
    #[arg(
        long,
        env = "API_URL",
        default_value = "http://enrollment.local:8080/api/v1"
    )]
    api_url: String,

    /// Published artifact tree written by the build orchestrator.
    #[arg(
        long,
        env = "IMAGES_DIR",
        default_value = "/var/lib/metal-enrollment/images"
    )]
    images_dir: PathBuf,

    /// HTTP listen address.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: std::net::SocketAddr,
}

#[derive(Clone)]
struct DispatcherState {
    base_url: String,
    enrollment_url: String,
    api_url: String,
    images_dir: PathBuf,
    http: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "metal_ipxe=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.images_dir)
        .with_context(|| format!("failed to create {}", args.images_dir.display()))?;

    let state = Arc::new(DispatcherState {
        base_url: args.base_url.trim_end_matches('/').to_string(),
        enrollment_url: args.enrollment_url.clone(),
        api_url: args.api_url.trim_end_matches('/').to_string(),
        images_dir: args.images_dir.clone(),
        http: reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(
        listen = %args.listen,
        base_url = %args.base_url,
        images_dir = %args.images_dir.display(),
        "starting metal-ipxe"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}

fn build_router(state: Arc<DispatcherState>) -> Router {
    Router::new()
        .route("/nixos/machines/:script", get(serve_script))
        .nest_service("/images", ServeDir::new(state.images_dir.clone()))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /nixos/machines/{service_tag}.ipxe`
async fn serve_script(
    State(state): State<Arc<DispatcherState>>,
    Path(script): Path<String>,
) -> Response {
    let Some(service_tag) = script.strip_suffix(".ipxe") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let hostname = lookup_hostname(&state, service_tag).await;
    let artifact = state
        .images_dir
        .join("machines")
        .join(service_tag)
        .join("bzImage");

    let body = match hostname {
        Some(hostname) if !hostname.is_empty() && artifact.exists() => {
            info!(service_tag, hostname = %hostname, "serving machine boot script");
            script::render_machine(service_tag, &hostname, &state.base_url)
        }
        _ => {
            info!(service_tag, "serving registration boot script");
            script::render_registration(service_tag, &state.base_url, &state.enrollment_url)
        }
    };

    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// Ask the API for the machine. `None` means unknown; any lookup failure
/// (including a down API) is treated as unknown so the machine falls
/// back to the registration boot.
async fn lookup_hostname(state: &DispatcherState, service_tag: &str) -> Option<String> {
    let url = format!("{}/machines/by-servicetag/{service_tag}", state.api_url);
    let response = match state.http.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(service_tag, error = %err, "machine lookup failed");
            return None;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        return None;
    }

    let machine: serde_json::Value = match response.json().await {
        Ok(machine) => machine,
        Err(err) => {
            tracing::warn!(service_tag, error = %err, "machine lookup returned invalid JSON");
            return None;
        }
    };
    Some(
        machine
            .get("hostname")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get as axum_get;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Minimal stand-in for the enrollment API's by-servicetag lookup.
    async fn start_api_stub(machines: Vec<(&'static str, Option<&'static str>)>) -> String {
        let app = Router::new().route(
            "/api/v1/machines/by-servicetag/:tag",
            axum_get(move |Path(tag): Path<String>| async move {
                for (known_tag, hostname) in &machines {
                    if *known_tag == tag {
                        let mut machine = serde_json::json!({
                            "id": "m-1",
                            "service_tag": tag,
                            "status": "ready",
                        });
                        if let Some(hostname) = hostname {
                            machine["hostname"] = serde_json::json!(hostname);
                        }
                        return (StatusCode::OK, axum::Json(machine)).into_response();
                    }
                }
                (
                    StatusCode::NOT_FOUND,
                    axum::Json(serde_json::json!({ "error": "machine not found" })),
                )
                    .into_response()
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/v1")
    }

    fn dispatcher(api_url: String, images_dir: PathBuf) -> Router {
        build_router(Arc::new(DispatcherState {
            base_url: "http://boot.local".to_string(),
            enrollment_url: "http://api.local/api/v1/enroll".to_string(),
            api_url,
            images_dir,
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
        }))
    }

    async fn fetch_script(app: &Router, tag: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/nixos/machines/{tag}.ipxe"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn unknown_machine_gets_registration_script() {
        let tmp = TempDir::new().unwrap();
        let api = start_api_stub(vec![]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let (status, body) = fetch_script(&app, "UNKNOWN-01").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Registration Mode"));
        assert!(body.contains("Service Tag: UNKNOWN-01"));
        assert!(body.contains("enrollment_url=http://api.local/api/v1/enroll"));
    }

    #[tokio::test]
    async fn known_machine_with_artifact_gets_machine_script() {
        let tmp = TempDir::new().unwrap();
        let artifact_dir = tmp.path().join("machines/SVC-001");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("bzImage"), b"kernel").unwrap();

        let api = start_api_stub(vec![("SVC-001", Some("node7"))]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let (status, body) = fetch_script(&app, "SVC-001").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Custom Image"));
        assert!(body.contains("Hostname: node7"));
        assert!(body.contains("/images/machines/SVC-001/bzImage"));
    }

    #[tokio::test]
    async fn known_machine_without_artifact_falls_back_to_registration() {
        let tmp = TempDir::new().unwrap();
        let api = start_api_stub(vec![("SVC-001", Some("node7"))]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let (_, body) = fetch_script(&app, "SVC-001").await;
        assert!(body.contains("Registration Mode"));
    }

    #[tokio::test]
    async fn known_machine_without_hostname_falls_back_to_registration() {
        let tmp = TempDir::new().unwrap();
        let artifact_dir = tmp.path().join("machines/SVC-001");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("bzImage"), b"kernel").unwrap();

        let api = start_api_stub(vec![("SVC-001", None)]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let (_, body) = fetch_script(&app, "SVC-001").await;
        assert!(body.contains("Registration Mode"));
    }

    #[tokio::test]
    async fn unreachable_api_falls_back_to_registration() {
        let tmp = TempDir::new().unwrap();
        // Nothing is listening here.
        let app = dispatcher(
            "http://127.0.0.1:1/api/v1".to_string(),
            tmp.path().to_path_buf(),
        );

        let (status, body) = fetch_script(&app, "SVC-001").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Registration Mode"));
    }

    #[tokio::test]
    async fn script_route_requires_ipxe_suffix() {
        let tmp = TempDir::new().unwrap();
        let api = start_api_stub(vec![]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/nixos/machines/SVC-001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn artifact_tree_is_served() {
        let tmp = TempDir::new().unwrap();
        let artifact_dir = tmp.path().join("machines/SVC-001");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("bzImage"), b"kernel-bytes").unwrap();

        let api = start_api_stub(vec![]).await;
        let app = dispatcher(api, tmp.path().to_path_buf());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/machines/SVC-001/bzImage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"kernel-bytes");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
