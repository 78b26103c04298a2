use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::{header::HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::CONFIG;

const ESCALATION_DELAY: Duration = Duration::from_secs(5);

/// Client for plain single-shot dispatch; honors the global relay timeout.
pub static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true);
    if CONFIG.relay_timeout > 0 {
        builder = builder.timeout(Duration::from_secs(CONFIG.relay_timeout));
    }
    builder.build().expect("failed to build relay http client")
});

/// Client shared by all racing attempts; the per-host idle pool is bounded
/// and header arrival is bounded per attempt by `relay_response_timeout`.
static RACING_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(100)
        .build()
        .expect("failed to build racing http client")
});

/// A fully buffered upstream request. Buffering the body once up front keeps
/// every attempt (and the escalation attempt) idempotent to launch.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream did not send response headers in time")]
    HeaderTimeout,
    #[error("attempt cancelled")]
    Cancelled,
    #[error("all upstream attempts failed without a response")]
    NoResponse,
}

/// Single-shot dispatch through the plain client.
pub async fn http_do(prepared: PreparedRequest) -> Result<reqwest::Response, DispatchError> {
    let response = HTTP_CLIENT
        .request(prepared.method, &prepared.url)
        .headers(prepared.headers)
        .body(prepared.body)
        .send()
        .await?;
    Ok(response)
}

/// Races `async_num` concurrent attempts of the same request and returns the
/// first one that answers 200. Non-200 responses are queued as fallbacks;
/// losers are cancelled the moment a winner is chosen and their bodies are
/// dropped here, never leaked to the caller. When no 200 has arrived after
/// five seconds and more than one attempt is racing, one extra attempt is
/// launched from the same buffered body.
pub async fn async_http_do(
    prepared: PreparedRequest,
    async_num: usize,
) -> Result<reqwest::Response, DispatchError> {
    let async_num = async_num.max(1);
    let header_timeout = Duration::from_secs(CONFIG.relay_response_timeout_secs());
    let cancel_table: Arc<Mutex<HashMap<usize, CancellationToken>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut attempts: JoinSet<(usize, Result<reqwest::Response, DispatchError>)> = JoinSet::new();
    for index in 0..async_num {
        spawn_attempt(&mut attempts, &cancel_table, &prepared, index, header_timeout);
    }

    let mut fallbacks: VecDeque<reqwest::Response> = VecDeque::new();
    let mut last_err: Option<DispatchError> = None;
    let mut escalation_armed = async_num > 1;
    let escalation = tokio::time::sleep(ESCALATION_DELAY);
    tokio::pin!(escalation);

    loop {
        tokio::select! {
            joined = attempts.join_next() => {
                match joined {
                    None => break,
                    Some(Err(join_err)) => {
                        // A panicking attempt is a hard failure, nothing more.
                        error!("racing attempt panicked: {}", join_err);
                    }
                    Some(Ok((index, Ok(response)))) => {
                        if response.status() == StatusCode::OK {
                            let losers: Vec<CancellationToken> = {
                                let mut table = cancel_table.lock().unwrap();
                                table.remove(&index);
                                table.drain().map(|(_, token)| token).collect()
                            };
                            for token in losers {
                                token.cancel();
                            }
                            // Queued non-200 bodies are closed by the drop.
                            drop(fallbacks);
                            debug!("racing attempt {} won", index);
                            return Ok(response);
                        }
                        cancel_table.lock().unwrap().remove(&index);
                        fallbacks.push_back(response);
                    }
                    Some(Ok((index, Err(e)))) => {
                        cancel_table.lock().unwrap().remove(&index);
                        if !matches!(e, DispatchError::Cancelled) {
                            last_err = Some(e);
                        }
                    }
                }
            }
            _ = &mut escalation, if escalation_armed => {
                escalation_armed = false;
                warn!("no 200 within {:?}, launching escalation attempt", ESCALATION_DELAY);
                spawn_attempt(&mut attempts, &cancel_table, &prepared, async_num, header_timeout);
            }
        }
    }

    // Every attempt finished without a 200: surface the first fallback, or
    // the last transport error when nothing completed at all.
    if let Some(response) = fallbacks.pop_front() {
        drop(fallbacks);
        return Ok(response);
    }
    Err(last_err.unwrap_or(DispatchError::NoResponse))
}

fn spawn_attempt(
    attempts: &mut JoinSet<(usize, Result<reqwest::Response, DispatchError>)>,
    cancel_table: &Arc<Mutex<HashMap<usize, CancellationToken>>>,
    prepared: &PreparedRequest,
    index: usize,
    header_timeout: Duration,
) {
    let token = CancellationToken::new();
    cancel_table.lock().unwrap().insert(index, token.clone());

    let method = prepared.method.clone();
    let url = prepared.url.clone();
    let headers = prepared.headers.clone();
    let body = prepared.body.clone();

    attempts.spawn(async move {
        let send = RACING_CLIENT
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send();
        tokio::select! {
            _ = token.cancelled() => (index, Err(DispatchError::Cancelled)),
            result = tokio::time::timeout(header_timeout, send) => match result {
                Ok(Ok(response)) => (index, Ok(response)),
                Ok(Err(e)) => (index, Err(DispatchError::Transport(e))),
                Err(_) => (index, Err(DispatchError::HeaderTimeout)),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_request_body_clone_is_shared() {
        let prepared = PreparedRequest {
            method: Method::POST,
            url: "http://localhost/v1/chat/completions".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"model\":\"gpt-4\"}"),
        };
        let clone = prepared.clone();
        // Bytes clones are reference-counted views of the same buffer.
        assert_eq!(prepared.body.as_ptr(), clone.body.as_ptr());
    }

    #[tokio::test]
    async fn test_cancel_table_entry_lifecycle() {
        let cancel_table: Arc<Mutex<HashMap<usize, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut attempts = JoinSet::new();
        let prepared = PreparedRequest {
            method: Method::POST,
            // An unroutable address; the attempt will fail, not hang.
            url: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        };
        spawn_attempt(&mut attempts, &cancel_table, &prepared, 0, Duration::from_secs(5));
        assert!(cancel_table.lock().unwrap().contains_key(&0));

        let (index, result) = attempts.join_next().await.unwrap().unwrap();
        assert_eq!(index, 0);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_attempt_reports_cancelled() {
        let cancel_table: Arc<Mutex<HashMap<usize, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut attempts = JoinSet::new();
        let prepared = PreparedRequest {
            method: Method::POST,
            // A blackhole address (TEST-NET-1); connect will out-wait the cancel.
            url: "http://192.0.2.1:9/v1/chat/completions".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        spawn_attempt(&mut attempts, &cancel_table, &prepared, 3, Duration::from_secs(30));

        let token = cancel_table.lock().unwrap().get(&3).unwrap().clone();
        token.cancel();
        let (index, result) = attempts.join_next().await.unwrap().unwrap();
        assert_eq!(index, 3);
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }
}
