use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use uuid::Uuid;

use taskherd::bag::ConfigBag;
use taskherd::controller::{
    handle_connection, CancelOutcome, ControllerContext, Node, NodeRegistry, Notifier,
};
use taskherd::error::{HerdError, ProtocolError};
use taskherd::protocol::{
    spawn_writer, AgentInfo, Connection, HandshakeInitial, JobAccepted, JobCancelResponse, JobDone,
    JobUpdate, Message, Payload, NODE_TYPE_AGENT, OUTBOX_CAPACITY,
};
use taskherd::scheduler::{
    Job, JobEvent, JobFilter, JobSpec, JobStatus, JobStore, OfferBook, Scheduler,
};

/// Notifier that records every event it receives.
#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, JobEvent, String)>>,
}

impl RecordingNotifier {
    fn events_for(&self, id: &Uuid) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, _, _)| job_id == id)
            .map(|(_, event, _)| *event)
            .collect()
    }

    fn messages_for(&self, id: &Uuid, event: JobEvent) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, e, _)| job_id == id && *e == event)
            .map(|(_, _, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job: &Job, event: JobEvent, _progress: f32, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((job.id, event, message.to_string()));
    }
}

struct TestController {
    ctx: Arc<ControllerContext>,
    notifier: Arc<RecordingNotifier>,
    _data_dir: TempDir,
}

/// Creates a controller context backed by a temporary data directory.
async fn create_test_controller() -> TestController {
    let data_dir = TempDir::new().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = ControllerContext::new(
        "controller",
        data_dir.path(),
        Duration::from_secs(30),
        notifier.clone(),
    )
    .await
    .unwrap();
    TestController {
        ctx: Arc::new(ctx),
        notifier,
        _data_dir: data_dir,
    }
}

fn agent_info(capacity: u32, jobs_running: u32) -> AgentInfo {
    AgentInfo {
        capacity,
        jobs_running,
        gpus: Vec::new(),
    }
}

fn hello(name: &str, node_type: &str, capacity: u32) -> Message {
    Message::new(
        name,
        HandshakeInitial {
            node_type: node_type.to_string(),
            capabilities: vec!["linux".to_string()],
            agent_info: agent_info(capacity, 0),
        },
    )
}

fn echo_spec(identifier: &str) -> JobSpec {
    JobSpec {
        identifier: identifier.to_string(),
        driver: "exec".to_string(),
        driver_config: ConfigBag::new().with("cmd", "echo"),
        ..Default::default()
    }
}

/// Opens an in-memory session to the controller and returns the agent's end.
fn connect(ctx: &Arc<ControllerContext>) -> Connection<DuplexStream> {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(handle_connection(
        ctx.clone(),
        Connection::new(controller_side, "agent-peer"),
    ));
    Connection::new(agent_side, "controller")
}

/// Connects and completes the handshake as `name`.
async fn join(ctx: &Arc<ControllerContext>, name: &str, capacity: u32) -> Connection<DuplexStream> {
    let mut conn = connect(ctx);
    conn.write_message(&hello(name, NODE_TYPE_AGENT, capacity))
        .await
        .unwrap();
    match conn.read_message().await.unwrap().payload {
        Payload::HandshakeResponse(response) => assert!(response.accepted, "{}", response.refuse_reason),
        other => panic!("expected handshake response, got {}", other.command()),
    }
    let registry = ctx.registry.clone();
    let name = name.to_string();
    wait_until(|| {
        let registry = registry.clone();
        let name = name.clone();
        async move { registry.contains(&name).await }
    })
    .await;
    conn
}

/// Polls `condition` until it holds, failing the test after two seconds.
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn wait_for_status(ctx: &Arc<ControllerContext>, id: Uuid, status: JobStatus) {
    let store = ctx.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.get(&id).await.map(|j| j.status) == Some(status) }
    })
    .await;
}

async fn wait_for_event(notifier: &Arc<RecordingNotifier>, id: Uuid, event: JobEvent) {
    let notifier = notifier.clone();
    wait_until(|| {
        let found = notifier.events_for(&id).contains(&event);
        async move { found }
    })
    .await;
}

async fn read_offer(conn: &mut Connection<DuplexStream>) -> Job {
    match conn.read_message().await.unwrap().payload {
        Payload::NewJobOffer(offer) => offer.job,
        other => panic!("expected job offer, got {}", other.command()),
    }
}

fn accepted(name: &str, job: &Job, accepted: bool) -> Message {
    Message::new(
        name,
        JobAccepted {
            accepted,
            refuse_reason: if accepted { String::new() } else { "no capacity".to_string() },
            job: job.clone(),
            agent_info: agent_info(2, u32::from(accepted)),
        },
    )
}

fn done(name: &str, job: &Job, success: bool, error_message: Option<&str>) -> Message {
    Message::new(
        name,
        JobDone {
            success,
            job: job.clone(),
            agent_info: agent_info(2, 0),
            error_message: error_message.map(str::to_string),
        },
    )
}

/// Submits a job, offers it to `name` and has the agent accept it.
async fn schedule_one(
    test: &TestController,
    conn: &mut Connection<DuplexStream>,
    name: &str,
) -> Job {
    let job = test.ctx.submit(echo_spec("scheduled")).await.unwrap();
    assert_eq!(test.ctx.scheduler(Duration::from_secs(1)).tick().await, 1);

    let offered = read_offer(conn).await;
    assert_eq!(offered.id, job.id);
    conn.write_message(&accepted(name, &offered, true)).await.unwrap();
    wait_for_event(&test.notifier, job.id, JobEvent::Create).await;
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Scheduled);
    offered
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_handshake_registers_node() {
    let test = create_test_controller().await;
    let _conn = join(&test.ctx, "agent-1", 3).await;

    let nodes = test.ctx.nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "agent-1");
    assert_eq!(nodes[0].capacity, 3);
    assert_eq!(nodes[0].jobs_running, 0);
    assert_eq!(nodes[0].capabilities, vec!["linux"]);
    assert_eq!(nodes[0].address, "agent-peer");
}

#[tokio::test]
async fn test_handshake_refuses_non_agent() {
    let test = create_test_controller().await;
    let mut conn = connect(&test.ctx);

    conn.write_message(&hello("intruder", "controller", 1)).await.unwrap();
    let Payload::HandshakeResponse(response) = conn.read_message().await.unwrap().payload else {
        panic!("expected handshake response");
    };
    assert!(!response.accepted);
    assert!(!response.refuse_reason.is_empty());

    assert!(matches!(
        conn.read_message().await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(test.ctx.registry.is_empty().await);
}

#[tokio::test]
async fn test_handshake_refuses_other_first_message() {
    let test = create_test_controller().await;
    let mut conn = connect(&test.ctx);

    let job = Job::new("x", "exec", ConfigBag::new().with("cmd", "true"));
    let stray = Message::new(
        "agent-1",
        JobCancelResponse {
            job,
            cancelled: false,
            agent_info: agent_info(1, 0),
        },
    );
    conn.write_message(&stray).await.unwrap();

    let Payload::HandshakeResponse(response) = conn.read_message().await.unwrap().payload else {
        panic!("expected handshake response");
    };
    assert!(!response.accepted);
    assert!(response.refuse_reason.contains("JobCancelResponse"));
}

#[tokio::test]
async fn test_handshake_refuses_duplicate_name() {
    let test = create_test_controller().await;
    let _first = join(&test.ctx, "agent-1", 2).await;

    let mut second = connect(&test.ctx);
    second
        .write_message(&hello("agent-1", NODE_TYPE_AGENT, 8))
        .await
        .unwrap();
    let Payload::HandshakeResponse(response) = second.read_message().await.unwrap().payload else {
        panic!("expected handshake response");
    };
    assert!(!response.accepted);
    assert!(response.refuse_reason.contains("already registered"));

    // the first registration is untouched
    let nodes = test.ctx.nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].capacity, 2);
}

// =============================================================================
// Job lifecycle
// =============================================================================

#[tokio::test]
async fn test_offer_accept_update_done() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;

    let job = schedule_one(&test, &mut conn, "agent-1").await;
    let stored = test.ctx.job(&job.id).await.unwrap();
    assert_eq!(stored.agent_name.as_deref(), Some("agent-1"));

    let update = Message::new(
        "agent-1",
        JobUpdate {
            progress: 0.0,
            message: "STDOUT >> hello".to_string(),
            job: job.clone(),
            agent_info: agent_info(2, 1),
        },
    );
    conn.write_message(&update).await.unwrap();
    conn.write_message(&done("agent-1", &job, true, None)).await.unwrap();

    wait_for_event(&test.notifier, job.id, JobEvent::Done).await;
    let finished = test.ctx.job(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Success);
    assert_eq!(finished.progress, 1.0);

    assert_eq!(
        test.notifier.events_for(&job.id),
        vec![JobEvent::Create, JobEvent::Update, JobEvent::Done]
    );
    assert_eq!(test.ctx.job_log(&job.id).await.unwrap(), vec!["STDOUT >> hello"]);

    // load figures follow what the agent reports
    assert_eq!(test.ctx.nodes().await[0].jobs_running, 0);
}

#[tokio::test]
async fn test_failed_job_logs_error_message() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;
    let job = schedule_one(&test, &mut conn, "agent-1").await;

    conn.write_message(&done("agent-1", &job, false, Some("exit status: 3")))
        .await
        .unwrap();

    wait_for_event(&test.notifier, job.id, JobEvent::Done).await;
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Error);
    assert_eq!(test.ctx.job_log(&job.id).await.unwrap(), vec!["exit status: 3"]);
    assert_eq!(
        test.notifier.messages_for(&job.id, JobEvent::Done),
        vec!["exit status: 3"]
    );
}

#[tokio::test]
async fn test_pending_offer_is_not_repeated() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 4).await;
    let scheduler = test.ctx.scheduler(Duration::from_secs(1));

    let job = test.ctx.submit(echo_spec("once")).await.unwrap();
    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(scheduler.tick().await, 0);
    assert!(test.ctx.offers.is_pending(&job.id));

    let offered = read_offer(&mut conn).await;
    conn.write_message(&accepted("agent-1", &offered, false)).await.unwrap();

    let offers = test.ctx.offers.clone();
    wait_until(|| {
        let pending = offers.is_pending(&job.id);
        async move { !pending }
    })
    .await;

    // a refused job is still WAITING and is offered again
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Waiting);
    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(read_offer(&mut conn).await.id, job.id);
}

#[tokio::test]
async fn test_no_offers_without_nodes() {
    let test = create_test_controller().await;
    test.ctx.submit(echo_spec("lonely")).await.unwrap();
    assert_eq!(test.ctx.scheduler(Duration::from_secs(1)).tick().await, 0);
}

#[tokio::test]
async fn test_restricted_job_waits_for_matching_node() {
    let test = create_test_controller().await;
    let _conn = join(&test.ctx, "agent-1", 4).await;

    let mut spec = echo_spec("gpu-only");
    spec.restrict = vec!["gpu".to_string()];
    let job = test.ctx.submit(spec).await.unwrap();

    assert_eq!(test.ctx.scheduler(Duration::from_secs(1)).tick().await, 0);
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_disconnect_fails_scheduled_jobs_once() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;
    let job = schedule_one(&test, &mut conn, "agent-1").await;
    let waiting = test.ctx.submit(echo_spec("never-offered")).await.unwrap();

    drop(conn);

    wait_for_event(&test.notifier, job.id, JobEvent::Done).await;
    let registry = test.ctx.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.is_empty().await }
    })
    .await;

    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Error);
    assert_eq!(
        test.ctx.job_log(&job.id).await.unwrap(),
        vec!["agent agent-1 disconnected while the job was running"]
    );
    let done_events = test
        .notifier
        .events_for(&job.id)
        .into_iter()
        .filter(|e| *e == JobEvent::Done)
        .count();
    assert_eq!(done_events, 1);

    // jobs that were not running there are left alone
    assert_eq!(test.ctx.job(&waiting.id).await.unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_name_is_free_again_after_disconnect() {
    let test = create_test_controller().await;
    let conn = join(&test.ctx, "agent-1", 2).await;
    drop(conn);

    let registry = test.ctx.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { !registry.contains("agent-1").await }
    })
    .await;

    let _again = join(&test.ctx, "agent-1", 5).await;
    assert_eq!(test.ctx.nodes().await[0].capacity, 5);
}

// =============================================================================
// Cancel and delete
// =============================================================================

#[tokio::test]
async fn test_cancel_waiting_job() {
    let test = create_test_controller().await;
    let job = test.ctx.submit(echo_spec("short-lived")).await.unwrap();

    assert_eq!(test.ctx.cancel_job(&job.id).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Cancel);
    assert_eq!(test.notifier.events_for(&job.id), vec![JobEvent::Done]);

    let again = test.ctx.cancel_job(&job.id).await.unwrap_err();
    assert!(matches!(
        again,
        HerdError::InvalidTransition {
            from: JobStatus::Cancel,
            to: JobStatus::Cancel,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_scheduled_job_asks_the_agent() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;
    let job = schedule_one(&test, &mut conn, "agent-1").await;

    assert_eq!(test.ctx.cancel_job(&job.id).await.unwrap(), CancelOutcome::Requested);
    let Payload::JobCancelRequest(request) = conn.read_message().await.unwrap().payload else {
        panic!("expected cancel request");
    };
    assert_eq!(request.job.id, job.id);

    // still running until the agent reports back
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Scheduled);

    let mut cancelled = job.clone();
    cancelled.status = JobStatus::Cancel;
    conn.write_message(&done("agent-1", &cancelled, false, None))
        .await
        .unwrap();
    wait_for_status(&test.ctx, job.id, JobStatus::Cancel).await;
}

#[tokio::test]
async fn test_accept_after_cancel_is_revoked() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;

    let job = test.ctx.submit(echo_spec("too-late")).await.unwrap();
    assert_eq!(test.ctx.scheduler(Duration::from_secs(1)).tick().await, 1);
    let offered = read_offer(&mut conn).await;

    test.ctx.cancel_job(&job.id).await.unwrap();
    conn.write_message(&accepted("agent-1", &offered, true)).await.unwrap();

    let Payload::JobCancelRequest(request) = conn.read_message().await.unwrap().payload else {
        panic!("expected cancel request");
    };
    assert_eq!(request.job.id, job.id);
    assert_eq!(test.ctx.job(&job.id).await.unwrap().status, JobStatus::Cancel);
    assert!(!test.notifier.events_for(&job.id).contains(&JobEvent::Create));
}

#[tokio::test]
async fn test_delete_job() {
    let test = create_test_controller().await;
    let mut conn = join(&test.ctx, "agent-1", 2).await;
    let running = schedule_one(&test, &mut conn, "agent-1").await;
    let waiting = test.ctx.submit(echo_spec("to-delete")).await.unwrap();

    assert!(matches!(
        test.ctx.delete_job(&running.id).await,
        Err(HerdError::InvalidTransition { .. })
    ));

    let deleted = test.ctx.delete_job(&waiting.id).await.unwrap();
    assert_eq!(deleted.status, JobStatus::Delete);

    let listed: Vec<Uuid> = test.ctx.jobs(None).await.iter().map(|j| j.id).collect();
    assert_eq!(listed, vec![running.id]);
    assert!(matches!(
        test.ctx.delete_job(&waiting.id).await,
        Err(HerdError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_unknown_job() {
    let test = create_test_controller().await;
    let id = Uuid::new_v4();

    assert!(matches!(test.ctx.job(&id).await, Err(HerdError::JobNotFound(_))));
    assert!(matches!(test.ctx.cancel_job(&id).await, Err(HerdError::JobNotFound(_))));
    assert!(matches!(test.ctx.delete_job(&id).await, Err(HerdError::JobNotFound(_))));
    assert!(matches!(test.ctx.job_log(&id).await, Err(HerdError::JobNotFound(_))));
}

#[tokio::test]
async fn test_submit_validates() {
    let test = create_test_controller().await;
    let spec = JobSpec {
        identifier: "no-config".to_string(),
        driver: "exec".to_string(),
        ..Default::default()
    };
    assert!(matches!(test.ctx.submit(spec).await, Err(HerdError::InvalidJob(_))));
    assert!(test.ctx.store.is_empty().await);
}

#[tokio::test]
async fn test_stalled_agent_does_not_block_scheduling() {
    let store = Arc::new(JobStore::new());
    let registry = Arc::new(NodeRegistry::with_send_timeout(Duration::from_millis(100)));
    let offers = Arc::new(OfferBook::new(Duration::from_secs(60)));

    // nobody reads the far end, so the writer blocks once the pipe is full
    let (stalled, _peer) = tokio::io::duplex(4096);
    let (_reader, writer) = Connection::new(stalled, "stalled").into_split();
    let (outbox, _writer_task) = spawn_writer(writer, OUTBOX_CAPACITY);
    let node = Node::new("stalled", "stalled", vec![], &agent_info(1000, 0), outbox);
    assert!(registry.register(node, hello("controller", NODE_TYPE_AGENT, 0)).await);

    for i in 0..600 {
        let job = Job::new(format!("job-{i}"), "exec", ConfigBag::new().with("cmd", "true"));
        store.insert(job).await.unwrap();
    }

    let scheduler = Scheduler::new(
        "controller",
        Duration::from_secs(1),
        store.clone(),
        registry.clone(),
        offers.clone(),
    );
    let sent = tokio::time::timeout(Duration::from_secs(5), scheduler.tick())
        .await
        .expect("scheduling pass blocked on a stalled agent");
    assert!(sent > 0 && sent < 600, "sent {sent}");

    // offers that could not be queued are released for the next pass
    let pending = store
        .list(&JobFilter::status(JobStatus::Waiting))
        .await
        .iter()
        .filter(|job| offers.is_pending(&job.id))
        .count();
    assert_eq!(pending, sent);
}
