use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    connection: String,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let connection = *state.connection.borrow();
    Json(Status {
        status: "Available".into(),
        connection: connection.as_str().into(),
    })
}
