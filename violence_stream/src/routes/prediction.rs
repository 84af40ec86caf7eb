use crate::{prediction::Prediction, server::SharedState};
use axum::{extract::State, response::Json};

pub async fn latest_prediction(State(state): State<SharedState>) -> Json<Prediction> {
    Json(state.sink.current())
}
