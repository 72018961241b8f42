//! Webhook route definitions.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::dispatch::{Dispatched, Dispatcher};
use crate::link_proto::rpc::Envelope;
use crate::link_proto::wire::{self, Frame};

pub fn webhook_routes() -> Router<Dispatcher> {
    Router::new().route("/", post(receive))
}

/// One envelope in, at most one envelope out.
///
/// `400` for frames that do not decode, `204` when there is nothing to say.
async fn receive(State(dispatcher): State<Dispatcher>, body: Bytes) -> Response {
    let envelope = match wire::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "rejecting undecodable webhook body");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    match envelope.data {
        Frame::Handshake { plugin_id } => {
            debug!(%plugin_id, "handshake frame on webhook ignored");
            StatusCode::NO_CONTENT.into_response()
        }
        Frame::Ignored { kind } => {
            debug!(%kind, "ignoring unknown message type");
            StatusCode::NO_CONTENT.into_response()
        }
        Frame::Message(message) => {
            let Dispatched { reply, job } = dispatcher.dispatch(message);
            let response = match reply {
                Some(reply) => Json(Envelope::new(reply)).into_response(),
                None => StatusCode::NO_CONTENT.into_response(),
            };
            if let Some(job) = job {
                job.start();
            }
            response
        }
    }
}
