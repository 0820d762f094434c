pub mod attendance;
pub mod auth;
pub mod config;
pub mod err;
pub mod export;
pub mod feed;
pub mod mail;
pub mod models;
pub mod payload;
pub mod scanner;
pub mod state;
pub mod store;
pub mod students;

use std::sync::Arc;

use axum::routing::{any, delete, get, post};
use axum::{Extension, Router};
use serde::Serialize;

pub use axum::http::Uri;
pub use axum::response::IntoResponse;

use crate::config::Config;
use crate::err::{Fine, Maybe, Nothing};
use crate::scanner::remote;
use crate::state::AppState;

pub use crate::err::Error;

pub type Payload<T> = axum::response::Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/students", post(students::register_student))
        .route("/students/:student_id", get(students::student_dashboard))
        .route("/attendance/scan", post(attendance::scan_decoded_text))
        .route("/admin/login", post(auth::login_admin))
        .route("/admin/logout", post(auth::logout_admin))
        .route("/admin/me", get(auth::current_admin))
        .route(
            "/admin/accounts",
            get(auth::list_admins).post(auth::create_admin),
        )
        .route("/admin/accounts/:admin_id", delete(auth::delete_admin))
        .route("/admin/password", post(auth::change_password))
        .route("/admin/students", get(students::list_students))
        .route(
            "/admin/students/:student_id",
            delete(students::delete_student),
        )
        .route("/admin/attendance", get(attendance::attendance_overview))
        .route("/admin/attendance/range", get(attendance::attendance_range))
        .route("/admin/attendance/export", get(attendance::export_attendance))
        .route("/admin/changes", get(feed::change_stream))
        .route("/scanner/sessions", post(remote::open_scanner))
        .route(
            "/scanner/sessions/:session_id",
            get(remote::scanner_state).delete(remote::close_scanner),
        )
        .route("/scanner/sessions/:session_id/frames", post(remote::push_frame))
        .route("/scanner/sessions/:session_id/events", get(remote::scanner_events))
        .route("/scanner/sessions/:session_id/retry", post(remote::retry_scanner))
        .fallback(any(err::handler404))
        .layer(Extension(state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::load()?;
    let addr = config.bind_address;
    let state = AppState::new(config).await?;

    log::info!("Starting QR Attend HTTP Server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app(state).into_make_service())
        .await?;
    Ok(())
}
