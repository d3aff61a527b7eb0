use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{
    error::{Error, ErrorKind},
    lifecycle::DeploySource,
    manifest::Manifest,
    model::{AppTemplate, ContainerRequest, PullEvent, RegistryConfig, ServiceFailure},
    translator, Services,
};

const DEFAULT_LOG_TAIL: usize = 100;

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/templates", get(list_templates).post(put_template))
        .route("/templates/import", post(import_template))
        .route(
            "/templates/:id",
            get(get_template).put(replace_template).delete(delete_template),
        )
        .route("/templates/:id/manifest", get(template_manifest))
        .route("/projects", get(list_projects).post(deploy_project))
        .route("/projects/:name", delete(remove_project))
        .route("/projects/:name/status", get(project_status))
        .route("/projects/:name/start", post(start_project))
        .route("/projects/:name/stop", post(stop_project))
        .route("/projects/:name/restart", post(restart_project))
        .route(
            "/projects/:name/manifest",
            get(get_project_manifest).put(set_project_manifest),
        )
        .route("/projects/:name/logs", get(project_logs))
        .route("/containers", get(list_containers).post(create_container))
        .route("/containers/:id", delete(remove_container))
        .route("/containers/:id/start", post(start_container))
        .route("/containers/:id/stop", post(stop_container))
        .route("/system/info", get(system_info))
        .route("/system/stats", get(system_stats))
        .route("/images", get(list_images))
        .route("/images/pull", post(start_pull))
        .route("/images/pulls", get(list_pulls))
        .route("/images/pulls/:id", get(get_pull).delete(cancel_pull))
        .route("/images/pulls/:id/events", get(pull_events))
        .route("/images/remove", post(remove_image))
        .route("/images/tag", post(tag_image))
        .route(
            "/images/import",
            post(import_image).layer(DefaultBodyLimit::disable()),
        )
        .route("/images/export", get(export_image))
        .route("/networks", get(list_networks).post(create_network))
        .route("/networks/:name", delete(remove_network))
        .route("/volumes", get(list_volumes).post(create_volume))
        .route("/volumes/prune", post(prune_volumes))
        .route("/volumes/:name", delete(remove_volume))
        .route("/registry", get(get_registry).put(set_registry))
        .route("/registry/daemon", get(daemon_config))
        .with_state(services)
}

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<ServiceFailure>,
}

/// Domain error on its way out as an HTTP response.
pub struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::MalformedManifest | ErrorKind::MissingId | ErrorKind::InvalidName => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::DuplicateName | ErrorKind::ProjectBusy => StatusCode::CONFLICT,
            ErrorKind::NoProxyConfigured | ErrorKind::NoMirrorConfigured => {
                StatusCode::PRECONDITION_FAILED
            }
            ErrorKind::RuntimeFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::PartialFailure => StatusCode::MULTI_STATUS,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            kind: self.0.kind(),
            detail: self.0.to_string(),
            failures: match self.0 {
                Error::PartialFailure { failures, .. } => failures,
                _ => Vec::new(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn failure(operation: &str) -> impl FnOnce(Error) -> ApiError + '_ {
    move |e| {
        match e.kind() {
            ErrorKind::Storage | ErrorKind::RuntimeFailure | ErrorKind::RuntimeUnavailable => {
                error!("Error during {} {:?}", operation, e)
            }
            _ => warn!("Error during {} {}", operation, e),
        }
        ApiError(e)
    }
}

fn yaml(text: String) -> Response {
    ([(header::CONTENT_TYPE, "application/yaml")], text).into_response()
}

async fn list_templates(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .templates
        .list()
        .await
        .map(Json)
        .map_err(failure("list_templates"))
}

async fn put_template(
    State(services): State<Arc<Services>>,
    Json(template): Json<AppTemplate>,
) -> impl IntoResponse {
    services
        .templates
        .put(template)
        .await
        .map(|template| (StatusCode::CREATED, Json(template)))
        .map_err(failure("put_template"))
}

#[derive(Deserialize)]
struct ImportQuery {
    id: Option<String>,
}

async fn import_template(
    State(services): State<Arc<Services>>,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> impl IntoResponse {
    services
        .templates
        .ingest(&body, query.id.as_deref())
        .await
        .map(|template| (StatusCode::CREATED, Json(template)))
        .map_err(failure("import_template"))
}

async fn get_template(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services
        .templates
        .get(&id)
        .await
        .map(Json)
        .map_err(failure("get_template"))
}

async fn replace_template(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(mut template): Json<AppTemplate>,
) -> ApiResult<Json<AppTemplate>> {
    if template.id.is_empty() {
        template.id = id.clone();
    }
    if template.id != id {
        return Err(failure("replace_template")(Error::malformed(
            "id",
            format!("body id {} does not match path id {id}", template.id),
        )));
    }
    services
        .templates
        .put(template)
        .await
        .map(Json)
        .map_err(failure("replace_template"))
}

async fn delete_template(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services
        .templates
        .delete(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("delete_template"))
}

async fn template_manifest(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let template = services
        .templates
        .get(&id)
        .await
        .map_err(failure("template_manifest"))?;
    translator::to_manifest(&template)
        .to_yaml()
        .map(yaml)
        .map_err(failure("template_manifest"))
}

async fn list_projects(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .lifecycle
        .list()
        .await
        .map(Json)
        .map_err(failure("list_projects"))
}

#[derive(Deserialize)]
struct DeployRequest {
    name: String,
    template_id: Option<String>,
    /// Compose YAML.
    manifest: Option<String>,
}

async fn deploy_project(
    State(services): State<Arc<Services>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = match (request.template_id, request.manifest) {
        (Some(id), None) => DeploySource::Template(id),
        (None, Some(text)) => {
            DeploySource::Manifest(Manifest::parse(&text).map_err(failure("deploy_project"))?)
        }
        _ => {
            return Err(failure("deploy_project")(Error::malformed(
                "template_id",
                "exactly one of template_id and manifest is required",
            )))
        }
    };
    services
        .lifecycle
        .deploy(&request.name, source)
        .await
        .map(Json)
        .map_err(failure("deploy_project"))
}

async fn remove_project(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .remove(&name)
        .await
        .map(Json)
        .map_err(failure("remove_project"))
}

async fn project_status(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .status(&name)
        .await
        .map(Json)
        .map_err(failure("project_status"))
}

async fn start_project(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .start(&name)
        .await
        .map(Json)
        .map_err(failure("start_project"))
}

async fn stop_project(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .stop(&name)
        .await
        .map(Json)
        .map_err(failure("stop_project"))
}

async fn restart_project(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .restart(&name)
        .await
        .map(Json)
        .map_err(failure("restart_project"))
}

async fn get_project_manifest(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .lifecycle
        .get_manifest(&name)
        .await
        .map(yaml)
        .map_err(failure("get_project_manifest"))
}

async fn set_project_manifest(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
    body: String,
) -> impl IntoResponse {
    services
        .lifecycle
        .set_manifest(&name, &body)
        .await
        .map(Json)
        .map_err(failure("set_project_manifest"))
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn project_logs(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    services
        .lifecycle
        .logs(&name, query.tail.unwrap_or(DEFAULT_LOG_TAIL))
        .await
        .map(Json)
        .map_err(failure("project_logs"))
}

#[derive(Deserialize)]
struct ListContainersQuery {
    #[serde(default = "default_true")]
    all: bool,
}

fn default_true() -> bool {
    true
}

async fn list_containers(
    State(services): State<Arc<Services>>,
    Query(query): Query<ListContainersQuery>,
) -> impl IntoResponse {
    services
        .resources
        .list_containers(query.all)
        .await
        .map(Json)
        .map_err(failure("list_containers"))
}

async fn create_container(
    State(services): State<Arc<Services>>,
    Json(request): Json<ContainerRequest>,
) -> impl IntoResponse {
    services
        .resources
        .create_container(request)
        .await
        .map(|container| (StatusCode::CREATED, Json(container)))
        .map_err(failure("create_container"))
}

async fn start_container(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services
        .resources
        .start_container(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("start_container"))
}

async fn stop_container(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services
        .resources
        .stop_container(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("stop_container"))
}

async fn remove_container(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> impl IntoResponse {
    services
        .resources
        .remove_container(&id, query.force)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("remove_container"))
}

async fn system_info(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .system_info()
        .await
        .map(Json)
        .map_err(failure("system_info"))
}

async fn system_stats(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .system_stats()
        .await
        .map(Json)
        .map_err(failure("system_stats"))
}

async fn list_images(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .list_images()
        .await
        .map(Json)
        .map_err(failure("list_images"))
}

#[derive(Deserialize)]
struct PullRequestBody {
    image: String,
    registry: Option<String>,
}

#[derive(Serialize)]
struct PullStarted {
    id: String,
}

async fn start_pull(
    State(services): State<Arc<Services>>,
    Json(request): Json<PullRequestBody>,
) -> impl IntoResponse {
    services
        .pulls
        .start_pull(&request.image, request.registry.as_deref())
        .await
        .map(|id| (StatusCode::ACCEPTED, Json(PullStarted { id })))
        .map_err(failure("start_pull"))
}

async fn list_pulls(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(services.pulls.list())
}

async fn get_pull(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services.pulls.get(&id).map(Json).map_err(failure("get_pull"))
}

async fn cancel_pull(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    services
        .pulls
        .cancel(&id)
        .map(|summary| (StatusCode::ACCEPTED, Json(summary)))
        .map_err(failure("cancel_pull"))
}

async fn pull_events(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let events = services.pulls.subscribe(&id).map_err(failure("pull_events"))?;
    let events = events.map(|event| {
        let name = match &event {
            PullEvent::Progress(_) => "progress",
            PullEvent::Finished(_) => "finished",
        };
        Event::default().event(name).json_data(&event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct ImageReference {
    reference: String,
}

async fn remove_image(
    State(services): State<Arc<Services>>,
    Json(request): Json<ImageReference>,
) -> impl IntoResponse {
    services
        .resources
        .remove_image(&request.reference)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("remove_image"))
}

#[derive(Deserialize)]
struct TagRequest {
    source: String,
    target: String,
}

async fn tag_image(
    State(services): State<Arc<Services>>,
    Json(request): Json<TagRequest>,
) -> impl IntoResponse {
    services
        .resources
        .tag_image(&request.source, &request.target)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("tag_image"))
}

async fn import_image(State(services): State<Arc<Services>>, body: Bytes) -> impl IntoResponse {
    services
        .resources
        .import_image(body)
        .await
        .map(|_| StatusCode::CREATED)
        .map_err(failure("import_image"))
}

async fn export_image(
    State(services): State<Arc<Services>>,
    Query(request): Query<ImageReference>,
) -> impl IntoResponse {
    services
        .resources
        .export_image(&request.reference)
        .await
        .map(|archive| ([(header::CONTENT_TYPE, "application/x-tar")], archive))
        .map_err(failure("export_image"))
}

async fn list_networks(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .list_networks()
        .await
        .map(Json)
        .map_err(failure("list_networks"))
}

#[derive(Deserialize)]
struct NetworkRequest {
    name: String,
    driver: Option<String>,
}

async fn create_network(
    State(services): State<Arc<Services>>,
    Json(request): Json<NetworkRequest>,
) -> impl IntoResponse {
    services
        .resources
        .create_network(&request.name, request.driver.as_deref())
        .await
        .map(|network| (StatusCode::CREATED, Json(network)))
        .map_err(failure("create_network"))
}

async fn remove_network(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    services
        .resources
        .remove_network(&name)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("remove_network"))
}

async fn list_volumes(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .list_volumes()
        .await
        .map(Json)
        .map_err(failure("list_volumes"))
}

#[derive(Deserialize)]
struct VolumeRequest {
    name: String,
}

async fn create_volume(
    State(services): State<Arc<Services>>,
    Json(request): Json<VolumeRequest>,
) -> impl IntoResponse {
    services
        .resources
        .create_volume(&request.name)
        .await
        .map(|volume| (StatusCode::CREATED, Json(volume)))
        .map_err(failure("create_volume"))
}

#[derive(Deserialize)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

async fn remove_volume(
    State(services): State<Arc<Services>>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> impl IntoResponse {
    services
        .resources
        .remove_volume(&name, query.force)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("remove_volume"))
}

async fn prune_volumes(State(services): State<Arc<Services>>) -> impl IntoResponse {
    services
        .resources
        .prune_volumes()
        .await
        .map(Json)
        .map_err(failure("prune_volumes"))
}

async fn get_registry(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(services.registry.get().await.unwrap_or_default())
}

async fn set_registry(
    State(services): State<Arc<Services>>,
    Json(config): Json<RegistryConfig>,
) -> impl IntoResponse {
    services
        .registry
        .set(config)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure("set_registry"))
}

async fn daemon_config(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(services.registry.daemon_config().await)
}
