//! Response envelope shared by every endpoint.
//!
//! Success bodies nest under `data`, failures under `error` with a
//! machine-readable [`ErrorCode`], and both carry `meta` naming the store
//! backend that served the request. Clients branch on `error.code`; the
//! message text is for humans and may change.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stable failure codes. The HTTP status is derived from the code.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No measurements stored for the requested city.
    CityNotFound,
    /// Alert id does not exist.
    AlertNotFound,
    /// Transient store outage; retry later.
    StoreUnavailable,
    /// Non-retryable store failure.
    StoreFailure,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            ErrorCode::CityNotFound | ErrorCode::AlertNotFound => StatusCode::NOT_FOUND,
            ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct EnvelopeMeta {
    generated_at: DateTime<Utc>,
    /// Store backend that served the request.
    served_by: &'static str,
}

impl EnvelopeMeta {
    fn stamp(served_by: &'static str) -> Self {
        Self {
            generated_at: Utc::now(),
            served_by,
        }
    }
}

#[derive(Debug, Serialize)]
struct Reply<T: Serialize> {
    data: T,
    meta: EnvelopeMeta,
}

#[derive(Debug, Serialize)]
struct Fault {
    error: FaultDetail,
    meta: EnvelopeMeta,
}

#[derive(Debug, Serialize)]
struct FaultDetail {
    code: ErrorCode,
    message: String,
}

/// 200 with the payload under `data`.
pub fn reply<T: Serialize>(served_by: &'static str, data: T) -> Response {
    Json(Reply {
        data,
        meta: EnvelopeMeta::stamp(served_by),
    })
    .into_response()
}

/// Failure response; the status follows the code.
pub fn fault(served_by: &'static str, code: ErrorCode, message: impl Into<String>) -> Response {
    let body = Fault {
        error: FaultDetail {
            code,
            message: message.into(),
        },
        meta: EnvelopeMeta::stamp(served_by),
    };
    (code.status(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_reply_nests_data_under_stamped_meta() {
        let response = reply("Sled", json!({ "city": "London", "aqi": 68 }));
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["data"]["city"], "London");
        assert_eq!(body["data"]["aqi"], 68);
        assert_eq!(body["meta"]["served_by"], "Sled");
        assert!(body["meta"]["generated_at"].is_string());
    }

    #[tokio::test]
    async fn test_fault_status_follows_code() {
        let response = fault(
            "InMemory",
            ErrorCode::CityNotFound,
            "No measurements for Atlantis",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "CITY_NOT_FOUND");
        assert_eq!(body["error"]["message"], "No measurements for Atlantis");
        assert_eq!(body["meta"]["served_by"], "InMemory");

        let outage = fault("Sled", ErrorCode::StoreUnavailable, "store unavailable: io");
        assert_eq!(outage.status(), StatusCode::SERVICE_UNAVAILABLE);

        let failure = fault("Sled", ErrorCode::StoreFailure, "storage error: corrupt");
        assert_eq!(failure.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
