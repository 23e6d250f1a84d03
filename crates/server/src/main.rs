use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{Person, PersonId},
    error::{ApiError, ErrorCode},
    protocol::{
        EditResponse, NavigationResponse, Outcome, PageView, RelationSummary, SearchRequest,
        Submission,
    },
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

mod app_state;
mod config;
mod conversations;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use conversations::{Checkout, Conversations};

const MAX_BODY_BYTES: usize = 64 * 1024;

type ApiFailure = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    cid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditQuery {
    cid: Option<String>,
    id: Option<i64>,
    #[serde(default)]
    postback: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    cid: Option<String>,
    id: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings();
    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .init();

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let conversations = Conversations::new(Duration::from_secs(settings.conversation_idle_secs));
    spawn_idle_sweeper(conversations.clone());

    let state = AppState {
        storage,
        conversations,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_idle_sweeper(conversations: Conversations) {
    let period = conversations.idle_timeout().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = conversations.evict_idle().await;
            if evicted > 0 {
                info!(evicted, "idle conversations dropped");
            }
        }
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/people", get(list_people))
        .route("/people/create", post(begin_create))
        .route("/people/edit", get(edit_person))
        .route("/people/save", post(save_person))
        .route("/people/delete", post(delete_person))
        .route("/people/search", post(search_people))
        .route("/people/added", post(take_added))
        .route("/people/by-key/:key", get(person_by_key))
        .route("/relations", get(list_relations))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn begin_create(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConversationQuery>,
) -> Result<Json<NavigationResponse>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let (outcome, scope) = {
        let mut controller = checkout.controller.lock().await;
        (controller.begin_create(), controller.scope())
    };
    let conversation_id = state.conversations.settle(&checkout, scope).await;
    Ok(Json(navigation(Some(outcome), conversation_id, Vec::new())))
}

async fn edit_person(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EditQuery>,
) -> Result<Json<EditResponse>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let submission = if q.postback {
        Submission::Postback
    } else {
        Submission::Initial
    };

    let (person, scope) = {
        let mut controller = checkout.controller.lock().await;
        controller.set_id(q.id.map(PersonId));
        controller.retrieve(submission).await.map_err(failure)?;
        (controller.person().cloned(), controller.scope())
    };
    let conversation_id = state.conversations.settle(&checkout, scope).await;
    Ok(Json(EditResponse {
        person,
        conversation_id: conversation_id.map(|id| id.to_string()),
    }))
}

async fn save_person(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConversationQuery>,
    Json(form): Json<Person>,
) -> Result<Json<NavigationResponse>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let (outcome, messages, scope) = {
        let mut controller = checkout.controller.lock().await;
        controller.apply_form(form);
        let outcome = controller.save().await;
        (outcome, controller.take_messages(), controller.scope())
    };
    let conversation_id = state.conversations.settle(&checkout, scope).await;
    Ok(Json(navigation(outcome, conversation_id, messages)))
}

async fn delete_person(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<NavigationResponse>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let (outcome, messages, scope) = {
        let mut controller = checkout.controller.lock().await;
        if let Some(id) = q.id {
            controller.set_id(Some(PersonId(id)));
        }
        let outcome = controller.delete().await;
        (outcome, controller.take_messages(), controller.scope())
    };
    let conversation_id = state.conversations.settle(&checkout, scope).await;
    Ok(Json(navigation(outcome, conversation_id, messages)))
}

/// Runs a search. With a `cid` the example and page are kept on that
/// conversation, so a following edit without an id starts from the example.
async fn search_people(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConversationQuery>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<PageView>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let mut controller = checkout.controller.lock().await;
    controller.set_example(req.example);
    controller.set_page(req.page);
    if req.reset {
        controller.search();
    }
    controller.paginate().await.map_err(failure)?;
    Ok(Json(controller.page_view()))
}

async fn list_people(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Person>>, ApiFailure> {
    let checkout = checkout(&state, None).await?;
    let people = checkout
        .controller
        .lock()
        .await
        .list_all()
        .await
        .map_err(failure)?;
    Ok(Json(people))
}

async fn person_by_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(q): Query<ConversationQuery>,
) -> Result<Json<Person>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let person = checkout
        .controller
        .lock()
        .await
        .resolve_key(&key)
        .await
        .map_err(failure)?;
    person
        .map(Json)
        .ok_or_else(|| failure(ApiError::not_found(format!("no person for key '{key}'"))))
}

async fn take_added(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConversationQuery>,
) -> Result<Json<Person>, ApiFailure> {
    let checkout = checkout(&state, q.cid.as_deref()).await?;
    let added = checkout.controller.lock().await.take_new_child_template();
    Ok(Json(added))
}

async fn list_relations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RelationSummary>>, ApiFailure> {
    let checkout = checkout(&state, None).await?;
    let relations = checkout
        .controller
        .lock()
        .await
        .list_relations()
        .await
        .map_err(failure)?;
    Ok(Json(relations.iter().map(RelationSummary::from).collect()))
}

async fn checkout(state: &AppState, cid: Option<&str>) -> Result<Checkout, ApiFailure> {
    state
        .conversations
        .checkout(&state.storage, cid)
        .await
        .map_err(failure)
}

fn navigation(
    outcome: Option<Outcome>,
    conversation_id: Option<uuid::Uuid>,
    messages: Vec<shared::protocol::UserMessage>,
) -> NavigationResponse {
    NavigationResponse {
        outcome,
        conversation_id: conversation_id.map(|id| id.to_string()),
        messages,
    }
}

fn failure(err: ApiError) -> ApiFailure {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
