use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::CommandError;
use crate::engine::Engine;
use crate::engine::LightState;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    lights: usize,
}

/// One entry of the /v1/lights listing
#[derive(Debug, Serialize)]
struct LightResponse {
    entity_id: String,
    #[serde(flatten)]
    state: LightState,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            lights: state.engine.state_snapshot().lights.len(),
        }),
    )
}

/// Handler for GET /v1/lights
#[tracing::instrument(skip(state))]
async fn list_lights(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    let lights: Vec<LightResponse> = snapshot
        .lights
        .iter()
        .map(|(entity_id, light)| LightResponse {
            entity_id: entity_id.clone(),
            state: light.clone(),
        })
        .collect();
    (StatusCode::OK, Json(lights))
}

/// Handler for GET /v1/lights/:id
#[tracing::instrument(skip(state))]
async fn get_light(State(state): State<Arc<AppState>>, Path(entity_id): Path<String>) -> Response {
    let snapshot = state.engine.state_snapshot();
    match snapshot.lights.get(&entity_id) {
        Some(light) => (
            StatusCode::OK,
            Json(LightResponse {
                entity_id,
                state: light.clone(),
            }),
        )
            .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("unknown light: {}", entity_id),
        ),
    }
}

fn dispatch(state: &AppState, entity_id: String, on: bool) -> Response {
    match state.engine.send_light_command(entity_id, on) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ CommandError::UnknownEntity(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e @ CommandError::IntegrationGone(_)) => {
            tracing::warn!("Dropping light command: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}

/// Handler for POST /v1/lights/:id/turn_on
#[tracing::instrument(skip(state))]
async fn turn_on(State(state): State<Arc<AppState>>, Path(entity_id): Path<String>) -> Response {
    dispatch(&state, entity_id, true)
}

/// Handler for POST /v1/lights/:id/turn_off
#[tracing::instrument(skip(state))]
async fn turn_off(State(state): State<Arc<AppState>>, Path(entity_id): Path<String>) -> Response {
    dispatch(&state, entity_id, false)
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/lights", get(list_lights))
        .route("/v1/lights/:id", get(get_light))
        .route("/v1/lights/:id/turn_on", post(turn_on))
        .route("/v1/lights/:id/turn_off", post(turn_off))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., "127.0.0.1")
/// * `port` - The port to listen on (e.g., 8565)
/// * `engine` - The engine whose state is served and which receives commands
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::FromIntegrationMessage;
    use crate::engine::FromIntegrationSender;
    use crate::engine::Integration;
    use crate::engine::SetupError;
    use crate::engine::ToIntegrationMessage;

    /// Integration owning `light.office_group_1`, recording every command.
    struct OneLight {
        commands: tokio::sync::mpsc::UnboundedSender<ToIntegrationMessage>,
    }

    #[async_trait::async_trait]
    impl Integration for OneLight {
        fn name(&self) -> &str {
            "helvar.office"
        }

        async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError> {
            tx.send(FromIntegrationMessage::EntityDiscovered {
                entity_id: "light.office_group_1".to_string(),
                integration_name: "helvar.office".to_string(),
            })
            .await
            .unwrap();
            tx.send(FromIntegrationMessage::LightStateChanged {
                entity_id: "light.office_group_1".to_string(),
                name: "Group: Office".to_string(),
                on: true,
                brightness: None,
            })
            .await
            .unwrap();
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), Box<dyn std::error::Error + Send>> {
            self.commands.send(msg).unwrap();
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), Box<dyn std::error::Error + Send>> {
            Ok(())
        }
    }

    async fn app() -> (
        Router,
        tokio::sync::mpsc::UnboundedReceiver<ToIntegrationMessage>,
    ) {
        let engine = Arc::new(Engine::default());
        let runner = engine.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let (commands, rx) = tokio::sync::mpsc::unbounded_channel();
        engine.register_integration(Box::new(OneLight { commands }));
        for _ in 0..100 {
            if !engine.state_snapshot().lights.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let state = Arc::new(AppState {
            version: "test",
            engine,
        });
        (create_router(state), rx)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _) = app().await;
        let response = app.oneshot(get_request("/v1/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_info_counts_lights() {
        let (app, _) = app().await;
        let response = app.oneshot(get_request("/v1/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], "test");
        assert_eq!(body["lights"], 1);
    }

    #[tokio::test]
    async fn test_list_lights() {
        let (app, _) = app().await;
        let response = app.oneshot(get_request("/v1/lights")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!([{
                "entity_id": "light.office_group_1",
                "name": "Group: Office",
                "on": true,
                "brightness": null,
            }])
        );
    }

    #[tokio::test]
    async fn test_get_unknown_light() {
        let (app, _) = app().await;
        let response = app
            .oneshot(get_request("/v1/lights/light.nowhere"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_turn_on_dispatches_command() {
        let (app, mut commands) = app().await;
        let response = app
            .oneshot(post_request("/v1/lights/light.office_group_1/turn_on"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            commands.recv().await.unwrap(),
            ToIntegrationMessage::LightCommand {
                entity_id: "light.office_group_1".to_string(),
                on: true,
            }
        );
    }

    #[tokio::test]
    async fn test_turn_off_unknown_light() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post_request("/v1/lights/light.nowhere/turn_off"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["error"],
            "no integration found for entity: light.nowhere"
        );
    }
}
