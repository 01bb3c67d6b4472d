use {
    crate::{writer::RotatingLogWriter, State},
    actix_service::Service,
    actix_web::{
        dev::{ServiceRequest, ServiceResponse},
        http::header::USER_AGENT,
        web::Data,
        Error,
    },
    chrono::{DateTime, SecondsFormat, Utc},
    fast_logger::{error, warn, Generic, Logger},
    serde_derive::Serialize,
    std::{future::Future, time::Instant},
};

/// One line of the request log.
#[derive(Clone, Debug, Serialize)]
pub struct RequestRecord {
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Milliseconds spent in the inner service.
    pub duration: u128,
    pub user_agent: String,
}

impl RequestRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        method: String,
        path: String,
        status: u16,
        duration: u128,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            method,
            path,
            status,
            duration,
            user_agent: user_agent.unwrap_or_else(|| "-".into()),
        }
    }

    /// JSON object on a single line. Control characters in the request are
    /// escaped, so the line never contains a raw line feed.
    pub fn format_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Persists `record`. Failures are reported to `lgr` and never propagate into
/// request handling.
pub fn persist(writer: &RotatingLogWriter, lgr: &Logger<Generic>, record: &RequestRecord) {
    let line = match record.format_line() {
        Ok(line) => line,
        Err(err) => {
            error!(lgr, "Unable to format request record"; "error" => err.to_string());
            return;
        }
    };

    if let Err(err) = writer.write(&line) {
        if err.is_rotation() {
            warn!(lgr, "Request log rotation failed, appending to the active file"; "error" => err);
        } else {
            error!(lgr, "Unable to write request log"; "error" => err, "line" => line);
        }
    }
}

/// Middleware for `App::wrap_fn`: times the inner service and appends one
/// [`RequestRecord`] per request to the state's writer.
pub fn log_request<S, B>(
    req: ServiceRequest,
    srv: &S,
) -> impl Future<Output = Result<ServiceResponse<B>, Error>>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    let timestamp = Utc::now();
    let started = Instant::now();
    let state = req.app_data::<Data<State>>().cloned();
    let method = req.method().to_string();
    let path = req.path().to_string();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let response = srv.call(req);

    async move {
        let response = response.await;
        let duration = started.elapsed().as_millis();

        let status = match &response {
            Ok(response) => response.status(),
            Err(err) => err.as_response_error().status_code(),
        };

        if let Some(state) = state {
            let record = RequestRecord::new(
                timestamp,
                method,
                path,
                status.as_u16(),
                duration,
                user_agent,
            );
            persist(&state.writer, &state.lgr_important, &record);
        }

        response
    }
}
