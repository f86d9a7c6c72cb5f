use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::error;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // username
    pub exp: usize,         // expiration time
    pub roles: Vec<String>, // user roles
}

/// Extract and validate JWT token from request
/// Returns Claims if valid, or an error HttpResponse
pub fn verify_token(req: &HttpRequest, app_state: &AppState) -> Result<Claims, HttpResponse> {
    let auth_header = req.headers().get("Authorization");

    let token = match auth_header {
        Some(header) => {
            let header_str = header.to_str().unwrap_or("");
            if header_str.starts_with("Bearer ") {
                &header_str[7..]
            } else {
                return Err(HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "Invalid authorization header"
                })));
            }
        }
        None => {
            return Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "Missing authorization header"
            })));
        }
    };

    let claims = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(app_state.jwt_secret.as_ref()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims,
        Err(_) => {
            return Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "Invalid token"
            })));
        }
    };

    Ok(claims)
}

#[derive(Debug, FromRow)]
struct User {
    id: i32,
    username: String,
    password_hash: String,
}

#[post("/login")]
async fn login(
    app_state: web::Data<AppState>,
    credentials: web::Json<LoginRequest>,
) -> impl Responder {
    // Query user from database
    let user_result = sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash FROM users WHERE username = $1",
    )
    .bind(&credentials.username)
    .fetch_optional(&app_state.db)
    .await;

    let user = match user_result {
        Ok(Some(user)) => user,
        Ok(None) => {
            return HttpResponse::Unauthorized().json(ErrorResponse {
                error: "Invalid credentials".to_string(),
            });
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Internal server error".to_string(),
            });
        }
    };

    // Verify password
    let parsed_hash = match PasswordHash::new(&user.password_hash) {
        Ok(hash) => hash,
        Err(e) => {
            error!("Failed to parse password hash: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Internal server error".to_string(),
            });
        }
    };

    let password_valid = Argon2::default()
        .verify_password(credentials.password.as_bytes(), &parsed_hash)
        .is_ok();

    if !password_valid {
        return HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Invalid credentials".to_string(),
        });
    }

    // Fetch user roles
    let roles_result = sqlx::query_scalar::<_, String>(
        "SELECT r.name FROM roles r
         INNER JOIN user_roles ur ON r.id = ur.role_id
         WHERE ur.user_id = $1",
    )
    .bind(user.id)
    .fetch_all(&app_state.db)
    .await;

    let roles = match roles_result {
        Ok(roles) => roles,
        Err(e) => {
            error!("Failed to fetch user roles: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Internal server error".to_string(),
            });
        }
    };

    // Check if user has admin role OR at least one active activity role
    let has_admin = roles.contains(&"admin".to_string());

    if !has_admin {
        let mut has_active_role = false;

        // Check if teacher role is active
        if roles.contains(&"teacher".to_string()) {
            let is_active: Option<(bool,)> = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM teachers WHERE user_id = $1 AND status = 'active')",
            )
            .bind(user.id)
            .fetch_optional(&app_state.db)
            .await
            .unwrap_or(None);

            if is_active.map(|(exists,)| exists).unwrap_or(false) {
                has_active_role = true;
            }
        }

        // Check if student role is active
        if !has_active_role && roles.contains(&"student".to_string()) {
            let is_active: Option<(bool,)> = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM students WHERE user_id = $1 AND status = 'active')",
            )
            .bind(user.id)
            .fetch_optional(&app_state.db)
            .await
            .unwrap_or(None);

            if is_active.map(|(exists,)| exists).unwrap_or(false) {
                has_active_role = true;
            }
        }

        if !has_active_role {
            return HttpResponse::Unauthorized().json(ErrorResponse {
                error: "All roles are archived".to_string(),
            });
        }
    }

    // Generate JWT token
    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: user.username.clone(),
        exp: expiration,
        roles,
    };

    let token = match encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(app_state.jwt_secret.as_ref()),
    ) {
        Ok(t) => t,
        Err(e) => {
            error!("JWT encoding error: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Could not generate token".to_string(),
            });
        }
    };

    HttpResponse::Ok().json(LoginResponse { token })
}

#[get("/validate")]
async fn validate_token_endpoint(
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> impl Responder {
    let claims = match verify_token(&req, &app_state) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let user_exists = sqlx::query_scalar::<_, i32>("SELECT id FROM users WHERE username = $1")
        .bind(&claims.sub)
        .fetch_optional(&app_state.db)
        .await;

    match user_exists {
        Ok(Some(_)) => HttpResponse::Ok().json(serde_json::json!({
            "valid": true,
            "username": claims.sub,
            "roles": claims.roles,
        })),
        Ok(None) => HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "User not found",
        })),
        Err(e) => {
            error!("Database error: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error",
            }))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Change current user's password
#[post("/change-password")]
async fn change_password(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    change_req: web::Json<ChangePasswordRequest>,
) -> impl Responder {
    let claims = match verify_token(&req, &app_state) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    // Verify current password first
    let user_result = sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash FROM users WHERE username = $1",
    )
    .bind(&claims.sub)
    .fetch_optional(&app_state.db)
    .await;

    let user = match user_result {
        Ok(Some(user)) => user,
        Ok(None) => {
            return HttpResponse::NotFound().json(ErrorResponse {
                error: "User not found".to_string(),
            });
        }
        Err(e) => {
            error!("Database error: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Internal server error".to_string(),
            });
        }
    };

    let parsed_hash = match PasswordHash::new(&user.password_hash) {
        Ok(hash) => hash,
        Err(e) => {
            error!("Failed to parse password hash: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Internal server error".to_string(),
            });
        }
    };

    let password_valid = Argon2::default()
        .verify_password(change_req.current_password.as_bytes(), &parsed_hash)
        .is_ok();

    if !password_valid {
        return HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Current password is incorrect".to_string(),
        });
    }

    // Hash new password
    use argon2::{
        password_hash::{rand_core::OsRng, SaltString},
        PasswordHasher,
    };

    let salt = SaltString::generate(&mut OsRng);
    let new_hash = match Argon2::default().hash_password(change_req.new_password.as_bytes(), &salt)
    {
        Ok(hash) => hash.to_string(),
        Err(e) => {
            error!("Failed to hash password: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to hash password".to_string(),
            });
        }
    };

    // Update password
    let update_result = sqlx::query("UPDATE users SET password_hash = $1 WHERE username = $2")
        .bind(&new_hash)
        .bind(&claims.sub)
        .execute(&app_state.db)
        .await;

    match update_result {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "message": "Password changed successfully"
        })),
        Err(e) => {
            error!("Database error: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to change password".to_string(),
            })
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .service(login)
            .service(validate_token_endpoint),
    );
    cfg.service(web::scope("/api/profile").service(change_password));
}
