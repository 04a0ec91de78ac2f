use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::json;

use fws_protocol::ErrorKind;
use fws_protocol::FwsErr;

/// Wrapper turning [`FwsErr`] into the `{error:{kind,message}}` body every
/// non-2xx response carries.
pub struct ApiError(pub FwsErr);

impl From<FwsErr> for ApiError {
    fn from(err: FwsErr) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::ValidationError | ErrorKind::EnvelopeMalformed => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Busy | ErrorKind::ModeInteractive | ErrorKind::ImmutableThreadId => {
                StatusCode::CONFLICT
            }
            ErrorKind::ApprovalStale => StatusCode::GONE,
            ErrorKind::Timeout | ErrorKind::RpcTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ChildCrashed | ErrorKind::ShellGone | ErrorKind::InitializeFailed => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::RpcError | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {"kind": kind, "message": self.0.to_string()}
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        let cases = [
            (FwsErr::Busy, StatusCode::CONFLICT),
            (FwsErr::NotFound("x".into()), StatusCode::NOT_FOUND),
            (FwsErr::RpcTimeout("m".into()), StatusCode::GATEWAY_TIMEOUT),
            (FwsErr::ImmutableThreadId, StatusCode::CONFLICT),
            (FwsErr::ApprovalStale("7".into()), StatusCode::GONE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
