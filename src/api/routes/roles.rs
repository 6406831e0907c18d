use crate::AppState;
use crate::routes::auth::{get_auth_context, request_id};
use actix_web::{HttpRequest, HttpResponse, web};
use std::sync::Arc;
use warden::Error;
use warden::models::{AssignRoleRequest, RoleResponse, SecurityEvent, SecurityEventType};

/// Admin tooling over the role tree. Reads require ROLE_MANAGE; grants are
/// additionally constrained to the actor's own subtree by the hierarchy
/// validator inside the resolver.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin/roles")
            .route("", web::get().to(list_roles))
            .route("", web::post().to(create_role))
            .route("/assign", web::post().to(assign_role))
            .route("/revoke", web::post().to(revoke_role))
            .route("/at-depth/{depth}", web::get().to(roles_at_depth))
            .route("/{name}", web::delete().to(delete_role))
            .route("/{name}/descendants", web::get().to(descendants))
            .route("/{name}/ancestors", web::get().to(ancestors))
            .route("/{name}/parent", web::put().to(move_role)),
    );
}

#[derive(Debug, serde::Deserialize)]
struct MoveRoleRequest {
    parent: String,
}

#[derive(Debug, serde::Deserialize)]
struct CreateRoleRequest {
    name: String,
    #[serde(default)]
    description: String,
    parent: Option<String>,
}

async fn list_roles(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let roles = state.pipeline.db.list_roles().await?;
    let out: Vec<RoleResponse> = roles.into_iter().map(RoleResponse::from).collect();

    Ok(HttpResponse::Ok().json(out))
}

async fn descendants(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let graph = state.roles.graph().await?;
    let role = graph
        .get(&path)
        .ok_or_else(|| Error::NotFound(format!("Role {} not found", path)))?;

    let out: Vec<RoleResponse> = graph
        .descendants_of(role)
        .into_iter()
        .map(RoleResponse::from)
        .collect();

    Ok(HttpResponse::Ok().json(out))
}

async fn ancestors(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let graph = state.roles.graph().await?;
    let role = graph
        .get(&path)
        .ok_or_else(|| Error::NotFound(format!("Role {} not found", path)))?;

    let out: Vec<RoleResponse> = graph
        .ancestors_of(role)
        .into_iter()
        .map(RoleResponse::from)
        .collect();

    Ok(HttpResponse::Ok().json(out))
}

async fn roles_at_depth(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<usize>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let graph = state.roles.graph().await?;
    let out: Vec<RoleResponse> = graph
        .roles_at_depth(*path)
        .into_iter()
        .map(RoleResponse::from)
        .collect();

    Ok(HttpResponse::Ok().json(out))
}

async fn create_role(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<CreateRoleRequest>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let role = state
        .roles
        .create_role(&body.name, &body.description, body.parent.as_deref())
        .await?;

    tracing::info!(role = %role.name, path = %role.path, "Role created");

    Ok(HttpResponse::Created().json(RoleResponse::from(role)))
}

async fn delete_role(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    state.roles.delete_role(&path).await?;

    tracing::info!(role = %path, "Role deleted; children re-parented");

    Ok(HttpResponse::NoContent().finish())
}

async fn revoke_role(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<AssignRoleRequest>,
) -> Result<HttpResponse, Error> {
    let (actor, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(actor.id, "ROLE_MANAGE").await?;

    let target = state
        .pipeline
        .db
        .find_by_email(&body.email)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

    state.roles.revoke_role(target.id, &body.role).await?;

    tracing::info!(target = %target.id, role = %body.role, revoked_by = %actor.id, "Role revoked");

    Ok(HttpResponse::NoContent().finish())
}

async fn move_role(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<MoveRoleRequest>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    state.roles.require_permission(user.id, "ROLE_MANAGE").await?;

    let moved = state.roles.move_role(&path, &body.parent).await?;

    tracing::info!(role = %moved.name, new_path = %moved.path, "Role moved");

    Ok(HttpResponse::Ok().json(RoleResponse::from(moved)))
}

async fn assign_role(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<AssignRoleRequest>,
) -> Result<HttpResponse, Error> {
    let (actor, _) = get_auth_context(&state, &req).await?;

    let target = state
        .pipeline
        .db
        .find_by_email(&body.email)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

    let result = state.roles.assign_role(actor.id, target.id, &body.role).await;

    let stamp = |mut event: SecurityEvent| {
        if let Some(request_id) = request_id(&req) {
            event = event.detail("request_id", request_id);
        }
        event
    };

    match &result {
        Ok(role) => {
            state
                .pipeline
                .events
                .record(stamp(
                    SecurityEvent::new(SecurityEventType::RoleAssignment)
                        .user(target.id)
                        .detail("role", role.name.clone())
                        .detail("granted_by", actor.id.to_string()),
                ))
                .await?;
        }
        Err(Error::RoleAssignmentForbidden(_)) => {
            state
                .pipeline
                .events
                .record_best_effort(stamp(
                    SecurityEvent::new(SecurityEventType::RoleAssignmentDenied)
                        .user(target.id)
                        .detail("role", body.role.clone())
                        .detail("attempted_by", actor.id.to_string()),
                ))
                .await;
        }
        Err(_) => {}
    }

    let role = result?;

    tracing::info!(
        target = %target.id,
        role = %role.name,
        granted_by = %actor.id,
        "Role assigned"
    );

    Ok(HttpResponse::Ok().json(RoleResponse::from(role)))
}
