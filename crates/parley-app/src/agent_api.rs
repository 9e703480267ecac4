//! Minimal request/response adapter for the agent tool surface. Session
//! identity travels in transport metadata (a header here); tool arguments
//! are structured JSON. A production deployment can front this with a
//! reconnect-aware proxy without touching the broker.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parley_dispatch::ToolDispatcher;
use parley_protocol::{BrokerError, CallId, ChoiceOption, RegisterSessionArgs, SessionId};
use serde::Deserialize;

pub const SESSION_HEADER: &str = "x-parley-session";
pub const CALL_HEADER: &str = "x-parley-call";

pub fn router(dispatcher: Arc<ToolDispatcher>) -> Router {
    Router::new()
        .route("/tools/{name}", post(invoke))
        .with_state(dispatcher)
}

#[derive(Debug, Deserialize)]
struct ChoicesArgs {
    preamble: String,
    choices: Vec<ChoiceOption>,
}

#[derive(Debug, Deserialize)]
struct TextArgs {
    text: String,
}

#[derive(Debug, Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CancelArgs {
    call_id: CallId,
}

async fn invoke(
    Path(name): Path<String>,
    State(dispatcher): State<Arc<ToolDispatcher>>,
    headers: HeaderMap,
    Json(args): Json<serde_json::Value>,
) -> Response {
    // `cancel` is transport-level and carries no session identity.
    if name == "cancel" {
        return match parse_args::<CancelArgs>(args)
            .and_then(|args| dispatcher.cancel(&args.call_id))
        {
            Ok(cancelled) => Json(serde_json::json!({ "cancelled": cancelled })).into_response(),
            Err(error) => error_response(error),
        };
    }

    let Some(session_id) = session_id_from(&headers) else {
        return error_response(BrokerError::InvalidRequest(format!(
            "missing {SESSION_HEADER} header"
        )));
    };
    let call_id = call_id_from(&headers);

    let result = dispatch_tool(&dispatcher, &name, &session_id, call_id, args).await;
    match result {
        Ok(value) => Json(value).into_response(),
        Err(error) => error_response(error),
    }
}

async fn dispatch_tool(
    dispatcher: &ToolDispatcher,
    name: &str,
    session_id: &SessionId,
    call_id: Option<CallId>,
    args: serde_json::Value,
) -> Result<serde_json::Value, BrokerError> {
    match name {
        "register_session" => {
            let args: RegisterSessionArgs = parse_args(args)?;
            to_value(dispatcher.register_session(session_id, args).await?)
        }
        "present_choices" => {
            let args: ChoicesArgs = parse_args(args)?;
            to_value(
                dispatcher
                    .present_choices(session_id, call_id, args.preamble, args.choices)
                    .await?,
            )
        }
        "present_multi_select" => {
            let args: ChoicesArgs = parse_args(args)?;
            to_value(
                dispatcher
                    .present_multi_select(session_id, call_id, args.preamble, args.choices)
                    .await?,
            )
        }
        "speak" => {
            let args: TextArgs = parse_args(args)?;
            to_value(dispatcher.speak(session_id, args.text).await?)
        }
        "speak_async" => {
            let args: TextArgs = parse_args(args)?;
            to_value(dispatcher.speak_async(session_id, args.text).await?)
        }
        "speak_urgent" => {
            let args: TextArgs = parse_args(args)?;
            to_value(dispatcher.speak_urgent(session_id, args.text).await?)
        }
        "rename_session" => {
            let args: NameArgs = parse_args(args)?;
            to_value(dispatcher.rename_session(session_id, args.name).await?)
        }
        "check_inbox" => to_value(dispatcher.check_inbox(session_id).await?),
        "get_settings" => to_value(dispatcher.get_settings()),
        unknown => Err(BrokerError::InvalidRequest(format!(
            "unknown tool: {unknown}"
        ))),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, BrokerError> {
    serde_json::from_value(value)
        .map_err(|error| BrokerError::InvalidRequest(format!("malformed tool arguments: {error}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, BrokerError> {
    serde_json::to_value(value)
        .map_err(|error| BrokerError::Internal(format!("serialize tool result: {error}")))
}

fn session_id_from(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(SessionId::new)
}

fn call_id_from(headers: &HeaderMap) -> Option<CallId> {
    headers
        .get(CALL_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(CallId::new)
}

fn error_response(error: BrokerError) -> Response {
    let status = match &error {
        BrokerError::InvalidRequest(_) | BrokerError::SessionNotFound(_) => StatusCode::BAD_REQUEST,
        BrokerError::Cancelled(_) | BrokerError::SessionClosed(_) => StatusCode::CONFLICT,
        BrokerError::Audio(_) | BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": error.code(),
            "message": error.to_string(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use parley_core::{
        InboxEngine, ItemOutcome, RegistryConfig, SessionRegistry, SpeechOutcome, SpeechRequest,
        SpeechSink,
    };
    use parley_dispatch::{DispatcherConfig, ToolDispatcher};
    use parley_eventbus::BrokerEventBus;
    use parley_protocol::{BrokerResult, SessionId, SettingsSnapshot, VoiceProfile};
    use tokio::time::timeout;
    use tower::ServiceExt;

    use super::{router, SESSION_HEADER};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    struct NullSink;

    #[async_trait]
    impl SpeechSink for NullSink {
        async fn speak(&self, _request: SpeechRequest) -> BrokerResult<SpeechOutcome> {
            Ok(SpeechOutcome::Completed)
        }

        fn begin_readout(&self) -> u64 {
            0
        }

        async fn readout(&self, _text: String, _voice: VoiceProfile, _token: u64) {}

        async fn pregenerate(&self, _texts: Vec<String>, _voice: VoiceProfile) {}

        fn stop(&self) {}
    }

    fn dispatcher() -> Arc<ToolDispatcher> {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let bus = Arc::new(BrokerEventBus::default());
        let engine = InboxEngine::new(registry, bus, Arc::new(NullSink));
        Arc::new(ToolDispatcher::new(
            engine,
            DispatcherConfig::default(),
            SettingsSnapshot {
                voice: "alloy".to_owned(),
                style: "neutral".to_owned(),
                speed: 1.0,
                model: "test".to_owned(),
            },
        ))
    }

    fn tool_request(name: &str, session: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/tools/{name}"))
            .header("content-type", "application/json")
            .header(SESSION_HEADER, session)
            .body(Body::from(body.to_owned()))
            .expect("build request")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("parse body json")
    }

    #[tokio::test]
    async fn register_session_round_trips_over_the_adapter() {
        let dispatcher = dispatcher();
        let response = router(Arc::clone(&dispatcher))
            .oneshot(tool_request(
                "register_session",
                "sess-a",
                r#"{"cwd":"/work","hostname":"devbox","name":"Review"}"#,
            ))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response).await;
        assert_eq!(value["session_id"], "sess-a");
        assert_eq!(value["name"], "Review");
    }

    #[tokio::test]
    async fn missing_session_header_is_rejected() {
        let dispatcher = dispatcher();
        let request = Request::builder()
            .method("POST")
            .uri("/tools/check_inbox")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .expect("build request");

        let response = router(dispatcher)
            .oneshot(request)
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn present_choices_blocks_until_a_selection_arrives() {
        let dispatcher = dispatcher();
        let engine = Arc::clone(dispatcher.engine());

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                router(dispatcher)
                    .oneshot(tool_request(
                        "present_choices",
                        "sess-a",
                        r#"{"preamble":"pick","choices":[{"label":"A","summary":"first"}]}"#,
                    ))
                    .await
            })
        };

        let session_id = SessionId::new("sess-a");
        timeout(TEST_TIMEOUT, async {
            loop {
                if let Ok(session) = engine.registry().get(&session_id) {
                    if session.has_active_item().unwrap_or(false) {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("choices should activate");

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "A".to_owned(),
                    summary: "first".to_owned(),
                },
            )
            .expect("resolve");

        let response = timeout(TEST_TIMEOUT, call)
            .await
            .expect("call timed out")
            .expect("join call")
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response).await;
        assert_eq!(value["selected"], "A");
        assert_eq!(value["pending_messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_request() {
        let dispatcher = dispatcher();
        let response = router(dispatcher)
            .oneshot(tool_request("frobnicate", "sess-a", "{}"))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
