//! Batch coalescer
//!
//! Gathers concurrent inline generation requests that opted into batching
//! into one asynchronous upstream batch job, polls the job to completion,
//! and demultiplexes the inlined responses back to the callers that have
//! been parked on their reply channels the whole time.
//!
//! Locking order is manager map first, then the coalescer's own state.
//! Execution never runs under either lock: the coalescer is removed from
//! the map and its pending list is moved out before the first upstream
//! call. Reply channels are oneshot, so delivery is non-blocking and a
//! caller that abandoned its wait just drops the receiving half.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::config::BatchConfig;

/// Batch opt-in header on inbound requests.
pub const BATCH_OPT_IN_HEADER: &str = "x-gemini-batch";

/// Substring the decoded target URL must carry to be coalesced.
const BATCH_TARGET_MARKER: &str = "v1beta/models/gemini";

const STATE_SUCCEEDED: &str = "BATCH_STATE_SUCCEEDED";
const STATE_FAILED: &str = "BATCH_STATE_FAILED";
const STATE_CANCELLED: &str = "BATCH_STATE_CANCELLED";

/// Whether a request qualifies for the coalescer.
pub fn is_batch_eligible(headers: &HeaderMap, target_url: &str) -> bool {
    headers
        .get(BATCH_OPT_IN_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some("1")
        && target_url.contains(BATCH_TARGET_MARKER)
}

/// What a parked caller eventually receives.
#[derive(Debug)]
pub struct BatchReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

struct PendingRequest {
    key: String,
    request: Value,
    tx: oneshot::Sender<BatchReply>,
}

struct CoalescerState {
    first_headers: HeaderMap,
    pending: Vec<PendingRequest>,
    timer: Option<tokio::task::AbortHandle>,
}

/// One open accumulation window for a target URL.
struct Coalescer {
    batch_id: u64,
    state: parking_lot::Mutex<CoalescerState>,
}

pub struct BatchManager {
    cfg: BatchConfig,
    client: reqwest::Client,
    batches: parking_lot::Mutex<HashMap<String, Arc<Coalescer>>>,
    next_batch_id: AtomicU64,
}

impl BatchManager {
    pub fn new(cfg: BatchConfig) -> Arc<Self> {
        // Submission and polling are quick calls; upstream bodies are
        // unframed manually, so automatic decompression stays off.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(60))
            .no_gzip()
            .build()
            .expect("failed to build batch HTTP client");

        Arc::new(Self {
            cfg,
            client,
            batches: parking_lot::Mutex::new(HashMap::new()),
            next_batch_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.cfg
    }

    /// Join the open coalescer for the batch endpoint (opening one if
    /// needed) and return the reply channel to park on. `headers` must
    /// already have the opt-in header, `Host`, and configured del-headers
    /// stripped; they template the aggregated upstream request.
    pub fn add_request(
        self: &Arc<Self>,
        headers: HeaderMap,
        body: &[u8],
    ) -> oneshot::Receiver<BatchReply> {
        let key = self.cfg.batch_url.clone();
        let (tx, rx) = oneshot::channel();

        let mut batches = self.batches.lock();

        let (coalescer, is_new) = match batches.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(batch_id, "opened new batch");
                let fresh = Arc::new(Coalescer {
                    batch_id,
                    state: parking_lot::Mutex::new(CoalescerState {
                        first_headers: headers.clone(),
                        pending: Vec::with_capacity(self.cfg.max_size),
                        timer: None,
                    }),
                });
                batches.insert(key.clone(), fresh.clone());
                (fresh, true)
            }
        };

        let mut state = coalescer.state.lock();

        if is_new {
            let manager = Arc::clone(self);
            let timer_key = key.clone();
            let timer_target = coalescer.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(manager.cfg.collect_timeout).await;
                manager.close_on_timer(timer_key, timer_target).await;
            });
            state.timer = Some(handle.abort_handle());
        }

        let index = state.pending.len();
        let request_key = format!("req_b_{}_i_{}", coalescer.batch_id, index);
        let request = serde_json::from_slice(body).unwrap_or(Value::Null);
        state.pending.push(PendingRequest {
            key: request_key,
            request,
            tx,
        });

        tracing::info!(
            batch_id = coalescer.batch_id,
            count = state.pending.len(),
            max = self.cfg.max_size,
            "request added to batch"
        );

        if state.pending.len() >= self.cfg.max_size {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let pending = std::mem::take(&mut state.pending);
            let template = state.first_headers.clone();
            let batch_id = coalescer.batch_id;
            drop(state);

            // Removed before execution starts: the next eligible arrival
            // opens a fresh coalescer while this one is in flight.
            batches.remove(&key);
            drop(batches);

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.execute(batch_id, template, pending).await;
            });
        }

        rx
    }

    /// Timer path: close the window and execute whatever accumulated.
    async fn close_on_timer(self: Arc<Self>, key: String, target: Arc<Coalescer>) {
        {
            let mut batches = self.batches.lock();
            match batches.get(&key) {
                // The size path may already have replaced this coalescer.
                Some(current) if Arc::ptr_eq(current, &target) => {
                    batches.remove(&key);
                }
                _ => return,
            }
        }

        let (batch_id, template, pending) = {
            let mut state = target.state.lock();
            (
                target.batch_id,
                state.first_headers.clone(),
                std::mem::take(&mut state.pending),
            )
        };

        self.execute(batch_id, template, pending).await;
    }

    /// SUBMITTING → POLLING → DISTRIBUTE / FAIL_FANOUT.
    async fn execute(&self, batch_id: u64, template: HeaderMap, pending: Vec<PendingRequest>) {
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        tracing::info!(batch_id, count, url = %self.cfg.batch_url, "executing batch");

        // Compound deadline: base plus a per-request allowance.
        let deadline =
            Instant::now() + Duration::from_secs(180) + Duration::from_secs(30) * count as u32;

        let payload = build_batch_payload(batch_id, pending.iter().map(|p| (&p.key, &p.request)));
        if self.cfg.debug {
            tracing::debug!(batch_id, payload = %payload, "batch payload");
        }

        let mut headers = template.clone();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().expect("static header"));
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONNECTION);

        let response = match self
            .client
            .post(&self.cfg.batch_url)
            .headers(headers)
            .body(payload.to_string())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(batch_id, error = %e, "batch job submission failed");
                fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
                return;
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(batch_id, error = %e, "failed to read job creation response");
                fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
                return;
            }
        };
        // The upstream sometimes gzip-frames bodies without saying so.
        let body = match gunzip_if_needed(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(batch_id, error = %e, "failed to unframe job creation response");
                fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
                return;
            }
        };

        // A 5xx on create is backpressure: the upstream is shedding, tell
        // the callers to back off. Other non-2xx answers pass through.
        if status.is_server_error() {
            tracing::error!(batch_id, %status, "batch job creation failed upstream");
            fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            return;
        }
        if !status.is_success() {
            tracing::error!(batch_id, %status, "batch job creation refused");
            fanout_body(pending, status, body);
            return;
        }

        let job_name = match serde_json::from_slice::<Value>(&body) {
            Ok(created) => created
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                tracing::error!(batch_id, error = %e, "failed to parse job creation response");
                fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
                return;
            }
        };
        if job_name.is_empty() {
            tracing::error!(batch_id, "job creation response carried no name");
            fanout_text(pending, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            return;
        }

        tracing::info!(batch_id, job = %job_name, "batch job created");
        self.poll_job(batch_id, &job_name, template, pending, deadline)
            .await;
    }

    /// Poll `/v1beta/{job}` until a terminal state or the deadline.
    async fn poll_job(
        &self,
        batch_id: u64,
        job_name: &str,
        template: HeaderMap,
        pending: Vec<PendingRequest>,
        deadline: Instant,
    ) {
        tokio::time::sleep(self.cfg.settle).await;

        let status_url = format!("{}/{}", self.cfg.status_base_url, job_name);

        loop {
            if Instant::now() >= deadline {
                tracing::error!(batch_id, "batch polling deadline exceeded");
                fanout_text(pending, StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
                return;
            }

            tokio::time::sleep(self.cfg.poll_interval).await;

            // Only the caller's auth travels on polls.
            let mut request = self.client.get(&status_url);
            for name in ["x-goog-api-key", "authorization"] {
                if let Some(value) = template.get(name) {
                    request = request.header(name, value);
                }
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(batch_id, error = %e, "job status poll failed");
                    continue;
                }
            };
            let response_headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(batch_id, error = %e, "failed to read job status body");
                    continue;
                }
            };
            let body = match gunzip_if_needed(&body) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(batch_id, error = %e, "failed to unframe job status body");
                    continue;
                }
            };
            let parsed: Value = match serde_json::from_slice(&body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::error!(batch_id, error = %e, "failed to parse job status body");
                    continue;
                }
            };

            let Some(metadata) = parsed.get("metadata") else {
                tracing::error!(batch_id, "job status body carried no metadata");
                continue;
            };
            let state = metadata
                .get("state")
                .and_then(|s| s.as_str())
                .unwrap_or_default();
            tracing::info!(batch_id, state, "batch job state");

            match state {
                STATE_SUCCEEDED => {
                    distribute_results(batch_id, pending, metadata, &response_headers);
                    return;
                }
                STATE_FAILED | STATE_CANCELLED => {
                    tracing::error!(batch_id, state, "batch job terminated unsuccessfully");
                    fanout_text(pending, StatusCode::INTERNAL_SERVER_ERROR, "Batch job failed");
                    return;
                }
                _ => {}
            }
        }
    }
}

/// Gemini batch creation payload: each sub-request travels with its
/// metadata key so the inlined responses can be matched back.
fn build_batch_payload<'a>(
    batch_id: u64,
    requests: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Value {
    let formatted: Vec<Value> = requests
        .map(|(key, request)| {
            json!({
                "request": request,
                "metadata": { "key": key },
            })
        })
        .collect();

    json!({
        "batch": {
            "display_name": format!("batch-{}", batch_id),
            "input_config": {
                "requests": { "requests": formatted },
            },
        },
    })
}

/// DISTRIBUTE: hand each caller its keyed sub-response, in arrival order.
fn distribute_results(
    batch_id: u64,
    pending: Vec<PendingRequest>,
    metadata: &Value,
    response_headers: &HeaderMap,
) {
    let Some(responses) = metadata
        .get("output")
        .and_then(|o| o.get("inlinedResponses"))
        .and_then(|i| i.get("inlinedResponses"))
        .and_then(|i| i.as_array())
    else {
        tracing::error!(batch_id, "job metadata carried no inlined responses");
        fanout_text(
            pending,
            StatusCode::INTERNAL_SERVER_ERROR,
            "No inlinedResponses",
        );
        return;
    };

    let mut by_key: HashMap<String, Vec<u8>> = HashMap::new();
    for item in responses {
        let Some(key) = item
            .get("metadata")
            .and_then(|m| m.get("key"))
            .and_then(|k| k.as_str())
        else {
            continue;
        };
        let Some(response) = item.get("response") else {
            continue;
        };
        match serde_json::to_vec(response) {
            Ok(serialized) => {
                by_key.insert(key.to_string(), serialized);
            }
            Err(e) => {
                tracing::error!(batch_id, key, error = %e, "failed to serialize sub-response");
            }
        }
    }

    tracing::info!(batch_id, extracted = by_key.len(), "distributing batch results");

    // The edge recomputes framing headers per caller.
    let mut base_headers = response_headers.clone();
    base_headers.remove(header::CONTENT_LENGTH);
    base_headers.remove(header::TRANSFER_ENCODING);
    base_headers.remove(header::CONNECTION);

    for entry in pending {
        let body = by_key.remove(&entry.key).unwrap_or_else(|| {
            tracing::error!(batch_id, key = %entry.key, "response missing for key");
            format!("{{\"error\":\"Response not found for key: {}\"}}", entry.key).into_bytes()
        });
        let _ = entry.tx.send(BatchReply {
            status: StatusCode::OK,
            headers: base_headers.clone(),
            body,
        });
    }
}

/// FAIL_FANOUT with a fixed text body.
fn fanout_text(pending: Vec<PendingRequest>, status: StatusCode, text: &str) {
    fanout_body(pending, status, text.as_bytes().to_vec());
}

/// FAIL_FANOUT with the upstream body.
fn fanout_body(pending: Vec<PendingRequest>, status: StatusCode, body: impl Into<Vec<u8>>) {
    let body = body.into();
    for entry in pending {
        let _ = entry.tx.send(BatchReply {
            status,
            headers: HeaderMap::new(),
            body: body.clone(),
        });
    }
}

/// Unframe a gzip body, keyed on the magic bytes rather than any header.
pub fn gunzip_if_needed(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return Ok(data.to_vec());
    }
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_in_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(BATCH_OPT_IN_HEADER, "1".parse().unwrap());
        headers
    }

    #[test]
    fn test_eligibility_requires_header_and_target() {
        let target = "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent";
        assert!(is_batch_eligible(&opt_in_headers(), target));

        assert!(!is_batch_eligible(&HeaderMap::new(), target));
        assert!(!is_batch_eligible(
            &opt_in_headers(),
            "https://api.example.com/v1/chat"
        ));

        let mut off = HeaderMap::new();
        off.insert(BATCH_OPT_IN_HEADER, "0".parse().unwrap());
        assert!(!is_batch_eligible(&off, target));
    }

    #[test]
    fn test_batch_payload_shape() {
        let key_a = "req_b_1_i_0".to_string();
        let key_b = "req_b_1_i_1".to_string();
        let req_a = json!({"contents": [{"parts": [{"text": "hello"}]}]});
        let req_b = json!({"contents": [{"parts": [{"text": "world"}]}]});

        let payload =
            build_batch_payload(1, [(&key_a, &req_a), (&key_b, &req_b)].into_iter());

        assert_eq!(payload["batch"]["display_name"], "batch-1");
        let requests = payload["batch"]["input_config"]["requests"]["requests"]
            .as_array()
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["metadata"]["key"], "req_b_1_i_0");
        assert_eq!(requests[1]["metadata"]["key"], "req_b_1_i_1");
        assert_eq!(requests[0]["request"], req_a);
    }

    #[test]
    fn test_gunzip_passthrough_for_plain_data() {
        let data = b"{\"name\":\"x\"}";
        assert_eq!(gunzip_if_needed(data).unwrap(), data);
    }

    #[test]
    fn test_gunzip_unframes_gzip_regardless_of_headers() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"name\":\"job-1\"}").unwrap();
        let framed = encoder.finish().unwrap();

        assert_eq!(gunzip_if_needed(&framed).unwrap(), b"{\"name\":\"job-1\"}");
    }

    #[test]
    fn test_gunzip_rejects_truncated_gzip() {
        let garbage = [0x1f, 0x8b, 0x00];
        assert!(gunzip_if_needed(&garbage).is_err());
    }

    #[test]
    fn test_gunzip_short_input() {
        assert_eq!(gunzip_if_needed(&[0x1f]).unwrap(), vec![0x1f]);
        assert!(gunzip_if_needed(&[]).unwrap().is_empty());
    }
}
