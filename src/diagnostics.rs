//! Best-effort crash reporting.
//!
//! A top-level panic hook posts a JSON report to the diagnostics
//! endpoint before the previous hook runs. Every step is guarded: the
//! report itself must never panic, and failures are logged and
//! forgotten.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};

use crate::config::UserIdentity;

/// Install a panic hook reporting to `endpoint`. The user identity, if
/// known, is attached to the report; it is used for nothing else.
pub fn install_panic_hook(endpoint: String, user: Option<UserIdentity>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let message = info.to_string();
        report_crash(&endpoint, user.as_ref(), &message);
        previous(info);
    }));
}

/// Synchronously POST a crash report. Swallows every failure.
pub fn report_crash(endpoint: &str, user: Option<&UserIdentity>, message: &str) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        send_report(endpoint, user, message);
    }));
    if outcome.is_err() {
        // Nothing left to do; the report must not take the process down.
    }
}

fn send_report(endpoint: &str, user: Option<&UserIdentity>, message: &str) {
    let mut body = serde_json::json!({
        "message": message,
        "platform": "webrtc_audio_bridge",
        "stackTrace": message,
        "screenName": "Session",
    });
    if let Some(user) = user {
        body["userId"] = user.user_id.clone().into();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("crash report runtime unavailable: {}", e);
            return;
        }
    };

    runtime.block_on(async {
        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();

        let request = match hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(endpoint)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
        {
            Ok(request) => request,
            Err(e) => {
                warn!("failed to build crash report request: {}", e);
                return;
            }
        };

        match tokio::time::timeout(Duration::from_secs(5), client.request(request)).await {
            Ok(Ok(response)) => debug!("crash report delivered: {}", response.status()),
            Ok(Err(e)) => warn!("crash report failed: {}", e),
            Err(_) => warn!("crash report timed out"),
        }
    });
}
