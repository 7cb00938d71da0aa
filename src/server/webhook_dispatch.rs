//! Webhook fan-out with HMAC signatures, bounded concurrency, and a
//! durable delivery log.
//!
//! `trigger_event` is fire-and-forget: matching webhooks are loaded, the
//! payload is marshalled once, and one delivery task per webhook retries
//! with linear backoff. A global semaphore bounds the delivery pool and a
//! per-webhook semaphore serialises deliveries to each target so a single
//! slow endpoint cannot starve the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use entity::webhook;
use ring::hmac;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const USER_AGENT: &str = "Metal-Enrollment-Webhook/1.0";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: i32 = 3;
/// Upper bound on concurrently running deliveries across all webhooks.
const DELIVERY_POOL_PERMITS: usize = 16;
/// Response bodies are truncated to this length in the delivery log.
const RESPONSE_LOG_LIMIT: usize = 4096;

pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, payload).as_ref())
}

pub struct WebhookDispatcher {
    db: DatabaseConnection,
    client: reqwest::Client,
    pool: Arc<Semaphore>,
    per_webhook: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl WebhookDispatcher {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            client: reqwest::Client::new(),
            pool: Arc::new(Semaphore::new(DELIVERY_POOL_PERMITS)),
            per_webhook: Mutex::new(HashMap::new()),
        }
    }

    /// Fire-and-forget entry point used by the API handlers. Failures are
    /// logged, never surfaced to the caller.
    pub fn trigger_event(self: &Arc<Self>, event: &str, data: serde_json::Value) {
        let this = Arc::clone(self);
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.dispatch(&event, data).await {
                tracing::warn!(event, error = %err, "webhook dispatch failed");
            }
        });
    }

    /// Fan an event out to every subscribed webhook and wait for all
    /// deliveries to finish (including retries).
    pub async fn dispatch(self: &Arc<Self>, event: &str, data: serde_json::Value) -> anyhow::Result<()> {
        let hooks: Vec<webhook::Model> = webhook::Entity::find()
            .filter(webhook::Column::Active.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .filter(|hook| hook.subscribes_to(event))
            .collect();

        if hooks.is_empty() {
            return Ok(());
        }

        // One canonical marshalling per fan-out: every webhook receives
        // identical bytes, which is what the signature covers.
        let payload: Arc<Vec<u8>> = Arc::new(serde_json::to_vec(&serde_json::json!({
            "event": event,
            "timestamp": Utc::now(),
            "data": data,
        }))?);

        let mut tasks = JoinSet::new();
        for hook in hooks {
            let this = Arc::clone(self);
            let payload = Arc::clone(&payload);
            let event = event.to_string();
            let gate = this.webhook_gate(&hook.id).await;
            tasks.spawn(async move {
                // Per-webhook gate first, then a pool permit: a slow
                // target queues behind itself without holding pool slots.
                let _gate = gate.acquire_owned().await;
                let _permit = this.pool.clone().acquire_owned().await;
                this.deliver(&hook, &event, &payload).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn webhook_gate(&self, webhook_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_webhook.lock().await;
        map.entry(webhook_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    async fn deliver(&self, hook: &webhook::Model, event: &str, payload: &[u8]) {
        let max_retries = if hook.max_retries > 0 {
            hook.max_retries
        } else {
            DEFAULT_MAX_RETRIES
        };
        let timeout = if hook.timeout_seconds > 0 {
            Duration::from_secs(hook.timeout_seconds as u64)
        } else {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        };

        let created_at = Utc::now();
        let mut attempts = 0;
        let mut last_status: Option<u16> = None;
        let mut last_response: Option<String> = None;
        let mut last_error: Option<String> = None;
        let mut success = false;

        for attempt in 1..=max_retries {
            attempts = attempt;

            let mut request = self
                .client
                .post(&hook.url)
                .timeout(timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::USER_AGENT, USER_AGENT);

            if let Some(headers) = &hook.headers {
                for (name, value) in headers.iter() {
                    // Custom headers may not override the two we set.
                    if name.eq_ignore_ascii_case("content-type")
                        || name.eq_ignore_ascii_case("user-agent")
                    {
                        continue;
                    }
                    request = request.header(name.as_str(), value.as_str());
                }
            }

            if let Some(secret) = hook.secret.as_deref().filter(|s| !s.is_empty()) {
                request = request.header(SIGNATURE_HEADER, sign_payload(payload, secret));
            }

            match request.body(payload.to_vec()).send().await {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());
                    let body = response.text().await.unwrap_or_default();
                    last_response = Some(truncate(&body, RESPONSE_LOG_LIMIT));

                    if status.is_success() {
                        success = true;
                        break;
                    }
                    last_error = Some(format!("HTTP {}", status.as_u16()));
                    tracing::warn!(
                        webhook = %hook.name,
                        attempt,
                        max_retries,
                        status = status.as_u16(),
                        "webhook delivery attempt failed"
                    );
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    tracing::warn!(
                        webhook = %hook.name,
                        attempt,
                        max_retries,
                        error = %err,
                        "webhook delivery attempt failed"
                    );
                }
            }

            if attempt < max_retries {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }

        let now = Utc::now();
        let bookkeeping = webhook::ActiveModel {
            id: Set(hook.id.clone()),
            last_success: if success { Set(Some(now)) } else { Default::default() },
            last_failure: if success { Default::default() } else { Set(Some(now)) },
            ..Default::default()
        };
        if let Err(err) = bookkeeping.update(&self.db).await {
            tracing::warn!(webhook = %hook.name, error = %err, "failed to update webhook status");
        }

        let delivery = entity::webhook_delivery::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            webhook_id: Set(hook.id.clone()),
            event: Set(event.to_string()),
            payload: Set(String::from_utf8_lossy(payload).into_owned()),
            status_code: Set(last_status.map(i32::from).unwrap_or(0)),
            response: Set(last_response),
            error: Set(if success { None } else { last_error }),
            attempts: Set(attempts),
            success: Set(success),
            created_at: Set(created_at),
            completed_at: Set(Some(now)),
        };
        if let Err(err) = delivery.insert(&self.db).await {
            tracing::warn!(webhook = %hook.name, error = %err, "failed to record webhook delivery");
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
