use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bag::ConfigBag;
use crate::error::{HerdError, Result};
use crate::scheduler::{Job, JobEvent, UpdateHandlerSpec};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives job lifecycle events from the controller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &Job, event: JobEvent, progress: f32, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMethod {
    Get,
    Post,
}

/// A fully resolved webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub method: WebhookMethod,
    pub url: String,
    pub body: Option<Value>,
}

impl WebhookRequest {
    /// Resolve a webhook handler config against one event.
    ///
    /// Keys: `url` (required), `method` (`GET` or `POST`, default `POST`),
    /// `full_job_description` (embed the whole job instead of its id).
    pub fn build(
        config: &ConfigBag,
        job: &Job,
        event: JobEvent,
        progress: f32,
        message: &str,
    ) -> Result<Self> {
        let bag_err = |e: crate::bag::BagError| HerdError::Config(e.to_string());

        let url = config.get_str("url", "").map_err(bag_err)?;
        if url.is_empty() {
            return Err(HerdError::Config("no url in webhook config".to_string()));
        }

        let method = match config.get_str("method", "POST").map_err(bag_err)?.as_str() {
            "GET" => WebhookMethod::Get,
            "POST" => WebhookMethod::Post,
            other => {
                return Err(HerdError::Config(format!("unsupported webhook method {other}")));
            }
        };

        let body = match method {
            WebhookMethod::Get => None,
            WebhookMethod::Post => {
                let full_job = config.get_bool("full_job_description", false).map_err(bag_err)?;
                let mut body = json!({
                    "eventName": event.to_string(),
                    "progress": progress,
                    "message": message,
                });
                if full_job {
                    body["job"] = serde_json::to_value(job).map_err(|e| HerdError::Config(e.to_string()))?;
                } else {
                    body["job_id"] = json!(job.id);
                }
                Some(body)
            }
        };

        Ok(Self { method, url, body })
    }
}

/// Runs the update handlers attached to a job.
///
/// Supported handler types are `log` and `webhook`. Webhooks are sent in the
/// background; their outcome is only logged.
#[derive(Debug, Clone)]
pub struct HandlerDispatcher {
    client: reqwest::Client,
}

impl HandlerDispatcher {
    /// # Errors
    ///
    /// Fails if the webhook HTTP client can't be built, e.g. when no TLS
    /// backend can be initialised.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self { client })
    }

    fn dispatch(&self, handler: &UpdateHandlerSpec, job: &Job, event: JobEvent, progress: f32, message: &str) {
        match handler.handler_type.as_str() {
            "log" => {
                tracing::info!(
                    job_id = %job.id,
                    identifier = %job.identifier,
                    event = %event,
                    progress,
                    text = message,
                    "Job event"
                );
            }
            "webhook" => match WebhookRequest::build(&handler.config, job, event, progress, message) {
                Ok(request) => self.spawn_webhook(request, job.id),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Invalid webhook handler");
                }
            },
            other => {
                tracing::warn!(job_id = %job.id, handler_type = other, "Unknown update handler type");
            }
        }
    }

    fn spawn_webhook(&self, request: WebhookRequest, job_id: uuid::Uuid) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let builder = match request.method {
                WebhookMethod::Get => client.get(&request.url),
                WebhookMethod::Post => {
                    let body = request.body.unwrap_or(Value::Null);
                    client.post(&request.url).json(&body)
                }
            };
            match builder.send().await {
                Ok(resp) => {
                    tracing::debug!(job_id = %job_id, url = %request.url, status = resp.status().as_u16(), "Webhook delivered");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, url = %request.url, error = %e, "Webhook failed");
                }
            }
        });
    }
}

#[async_trait]
impl Notifier for HandlerDispatcher {
    async fn notify(&self, job: &Job, event: JobEvent, progress: f32, message: &str) {
        for handler in job.update_handlers.iter().filter(|h| h.listens_to(event)) {
            self.dispatch(handler, job, event, progress, message);
        }
    }
}
