//! Controller side of one agent connection.
//!
//! A session moves through three phases: it waits for the agent's handshake,
//! dispatches agent messages while the node is registered, and finally fails
//! every job still SCHEDULED on the node before deregistering it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::controller::registry::{Node, DEFAULT_SEND_TIMEOUT};
use crate::controller::ControllerContext;
use crate::error::HerdError;
use crate::protocol::{
    spawn_writer, Connection, HandshakeInitial, HandshakeResponse, JobAccepted, JobCancelRequest,
    JobCancelResponse, JobDone, JobUpdate, Message, Outbox, Payload, NODE_TYPE_AGENT,
    OUTBOX_CAPACITY,
};
use crate::scheduler::{JobEvent, JobFilter, JobStatus};

/// Check an agent's first message. Returns the node name and handshake body,
/// or the reason the join is refused.
pub fn validate_handshake(message: Message) -> Result<(String, HandshakeInitial), String> {
    let Payload::HandshakeInitial(handshake) = message.payload else {
        return Err(format!("expected handshake, got {}", message.command()));
    };
    if handshake.node_type != NODE_TYPE_AGENT {
        return Err(format!(
            "only agents can join, got node type {:?}",
            handshake.node_type
        ));
    }
    if message.node_name.is_empty() {
        return Err("node name must not be empty".to_string());
    }
    if handshake.agent_info.capacity == 0 {
        return Err("capacity must be at least 1".to_string());
    }
    Ok((message.node_name, handshake))
}

/// Drive one agent connection to completion.
pub async fn handle_connection<S>(ctx: Arc<ControllerContext>, conn: Connection<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = conn.peer().to_string();
    let (mut reader, writer) = conn.into_split();
    let (outbox, writer_task) = spawn_writer(writer, OUTBOX_CAPACITY);

    let first = match reader.read_message().await {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Connection failed before handshake");
            drop(outbox);
            let _ = writer_task.await;
            return;
        }
    };

    let name = match validate_handshake(first) {
        Ok((name, handshake)) => {
            let node = Node::new(
                name.clone(),
                peer.clone(),
                handshake.capabilities,
                &handshake.agent_info,
                outbox.clone(),
            );
            let welcome = handshake_response(&ctx, None);
            if ctx.registry.register(node, welcome).await {
                name
            } else {
                refuse(&ctx, &outbox, &peer, format!("a node named {name} is already registered")).await;
                drop(outbox);
                let _ = writer_task.await;
                return;
            }
        }
        Err(reason) => {
            refuse(&ctx, &outbox, &peer, reason).await;
            drop(outbox);
            let _ = writer_task.await;
            return;
        }
    };

    tracing::info!(node = %name, peer = %peer, "Handshake complete");

    loop {
        match reader.read_message().await {
            Ok(message) => dispatch(&ctx, &name, &outbox, message).await,
            Err(e) => {
                tracing::info!(node = %name, error = %e, "Agent disconnected");
                break;
            }
        }
    }

    teardown(&ctx, &name).await;
    drop(outbox);
    let _ = writer_task.await;
}

fn handshake_response(ctx: &ControllerContext, refuse_reason: Option<String>) -> Message {
    Message::new(
        ctx.name.clone(),
        HandshakeResponse {
            accepted: refuse_reason.is_none(),
            refuse_reason: refuse_reason.unwrap_or_default(),
        },
    )
}

async fn refuse(ctx: &ControllerContext, outbox: &Outbox, peer: &str, reason: String) {
    tracing::warn!(peer = %peer, reason = %reason, "Refusing agent");
    if let Err(e) = outbox.send(handshake_response(ctx, Some(reason))).await {
        tracing::debug!(peer = %peer, error = %e, "Failed to send refusal");
    }
}

/// Handle one message from a registered agent. Failures are logged, never
/// fatal to the session.
async fn dispatch(ctx: &ControllerContext, node: &str, outbox: &Outbox, message: Message) {
    match message.payload {
        Payload::JobAccepted(accepted) => on_job_accepted(ctx, node, outbox, accepted).await,
        Payload::JobUpdate(update) => on_job_update(ctx, node, update).await,
        Payload::JobDone(done) => on_job_done(ctx, node, done).await,
        Payload::JobCancelResponse(response) => on_cancel_response(ctx, node, response).await,
        other => {
            tracing::warn!(node = %node, command = %other.command(), "Unexpected message from agent");
        }
    }
}

async fn on_job_accepted(ctx: &ControllerContext, node: &str, outbox: &Outbox, msg: JobAccepted) {
    ctx.registry.update_stats(node, &msg.agent_info).await;
    ctx.offers.settle(&msg.job.id);
    let job_id = msg.job.id;

    if !msg.accepted {
        tracing::info!(job_id = %job_id, node = %node, reason = %msg.refuse_reason, "Agent refused job");
        return;
    }

    match ctx.store.update_status(&job_id, JobStatus::Scheduled).await {
        Ok(_) => {}
        Err(HerdError::InvalidTransition { from, .. }) => {
            // Cancelled or placed elsewhere while the offer was in flight.
            tracing::warn!(job_id = %job_id, node = %node, status = %from, "Accepted job is no longer waiting, cancelling");
            let cancel = Message::new(ctx.name.clone(), JobCancelRequest { job: msg.job });
            if let Err(e) = outbox.send_timeout(cancel, DEFAULT_SEND_TIMEOUT).await {
                tracing::warn!(job_id = %job_id, node = %node, error = %e, "Failed to send cancel request");
            }
            return;
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, node = %node, error = %e, "Failed to mark job scheduled");
            return;
        }
    }

    if let Err(e) = ctx.store.update_agent_name(&job_id, node).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to record agent name");
    }
    if let Err(e) = ctx.logs.open(&job_id).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to open job log");
    }

    tracing::info!(job_id = %job_id, identifier = %msg.job.identifier, node = %node, "Job scheduled");
    if let Some(job) = ctx.store.get(&job_id).await {
        ctx.notifier.notify(&job, JobEvent::Create, 0.0, "").await;
    }
}

async fn on_job_update(ctx: &ControllerContext, node: &str, msg: JobUpdate) {
    ctx.registry.update_stats(node, &msg.agent_info).await;
    let job_id = msg.job.id;

    if let Err(e) = ctx.store.update_progress(&job_id, msg.progress).await {
        tracing::warn!(job_id = %job_id, node = %node, error = %e, "Update for unknown job");
        return;
    }
    if !msg.message.is_empty() {
        if let Err(e) = ctx.logs.append(&job_id, &msg.message).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to append to job log");
        }
    }

    tracing::debug!(job_id = %job_id, node = %node, progress = msg.progress, "Job update");
    if let Some(job) = ctx.store.get(&job_id).await {
        ctx.notifier
            .notify(&job, JobEvent::Update, msg.progress, &msg.message)
            .await;
    }
}

async fn on_job_done(ctx: &ControllerContext, node: &str, msg: JobDone) {
    ctx.registry.update_stats(node, &msg.agent_info).await;
    let job_id = msg.job.id;

    let status = if msg.job.status.is_finished() {
        msg.job.status
    } else if msg.success {
        JobStatus::Success
    } else {
        JobStatus::Error
    };

    let job = match ctx.store.update_status(&job_id, status).await {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(job_id = %job_id, node = %node, status = %status, error = %e, "Failed to record job outcome");
            return;
        }
    };
    if let Err(e) = ctx.store.update_progress(&job_id, 1.0).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to record final progress");
    }

    let message = msg.error_message.unwrap_or_default();
    if !message.is_empty() {
        if let Err(e) = ctx.logs.append(&job_id, &message).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to append to job log");
        }
    }
    if let Err(e) = ctx.logs.close(&job_id).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to close job log");
    }

    tracing::info!(job_id = %job_id, identifier = %job.identifier, node = %node, status = %status, "Job finished");
    let job = ctx.store.get(&job_id).await.unwrap_or(job);
    ctx.notifier.notify(&job, JobEvent::Done, 1.0, &message).await;
}

async fn on_cancel_response(ctx: &ControllerContext, node: &str, msg: JobCancelResponse) {
    ctx.registry.update_stats(node, &msg.agent_info).await;
    if msg.cancelled {
        tracing::info!(job_id = %msg.job.id, node = %node, "Agent is cancelling job");
    } else {
        tracing::warn!(job_id = %msg.job.id, node = %node, "Agent could not cancel job");
    }
}

/// Fail every job still SCHEDULED on `node` and remove it from the registry.
async fn teardown(ctx: &ControllerContext, node: &str) {
    let orphaned = ctx
        .store
        .list(&JobFilter::status(JobStatus::Scheduled).on_agent(node))
        .await;

    for job in orphaned {
        let job = match ctx.store.update_status(&job.id, JobStatus::Error).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to fail orphaned job");
                continue;
            }
        };
        let line = format!("agent {node} disconnected while the job was running");
        if let Err(e) = ctx.logs.append(&job.id, &line).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to append to job log");
        }
        if let Err(e) = ctx.logs.close(&job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to close job log");
        }
        tracing::warn!(job_id = %job.id, identifier = %job.identifier, node = %node, "Job failed, agent disconnected");
        ctx.notifier.notify(&job, JobEvent::Done, job.progress, &line).await;
    }

    ctx.registry.deregister(node).await;
}
