//! Session driver: spawn a workflow session and talk to it over the
//! submission/event queues.
//!
//! Streaming front-ends consume [`AnalysisSession::next_event`] directly;
//! [`run_blocking`] drives a session to termination from scripted inputs
//! and returns the final state. Both paths share the same engine and the
//! same cancellation semantics: an interrupt (or the session wall-clock
//! deadline) trips the token and the engine stops at the next step
//! boundary without touching state again.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use quarry_protocol::AnalysisState;
use quarry_protocol::Event;
use quarry_protocol::EventMsg;
use quarry_protocol::Op;
use quarry_protocol::Submission;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::client::ModelClient;
use crate::config::AnalysisConfig;
use crate::error::QuarryErr;
use crate::error::Result;
use crate::memory::MemoryStore;
use crate::warehouse::Warehouse;
use crate::workflow::WorkflowEngine;

/// Capacity of the event queue; a stalled consumer applies backpressure
/// rather than growing without bound.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// The stateless collaborators a session coordinates.
#[derive(Clone)]
pub struct SessionServices {
    pub warehouse: Arc<Warehouse>,
    pub model: Arc<ModelClient>,
    pub memory: Arc<dyn MemoryStore>,
}

/// Handle to a running analysis session.
pub struct AnalysisSession {
    session_id: String,
    tx_sub: async_channel::Sender<Submission>,
    rx_event: Mutex<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<AnalysisState>>>,
    next_sub_id: AtomicU64,
}

impl AnalysisSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Submit an operation. `Op::Interrupt` trips the cancellation token
    /// directly so it takes effect even while the engine is mid-step.
    pub async fn submit(&self, op: Op) -> Result<String> {
        let id = self
            .next_sub_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        if matches!(op, Op::Interrupt) {
            self.cancel.cancel();
            return Ok(id);
        }
        self.tx_sub
            .send(Submission { id: id.clone(), op })
            .await
            .map_err(|_| QuarryErr::Internal("session is no longer running".to_string()))?;
        Ok(id)
    }

    /// Next event from the session, or `None` once the engine has finished
    /// and the queue is drained.
    pub async fn next_event(&self) -> Option<Event> {
        self.rx_event.lock().await.recv().await
    }

    /// Cancel the session. The engine stops at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the engine to finish and return the final state.
    pub async fn into_final_state(self) -> Result<AnalysisState> {
        let handle = {
            let mut guard = self.handle.lock().await;
            guard.take()
        };
        let Some(handle) = handle else {
            return Err(QuarryErr::Internal(
                "final state already taken".to_string(),
            ));
        };
        handle
            .await
            .map_err(|err| QuarryErr::Internal(format!("session task failed: {err}")))
    }
}

/// Spawn a session over the given services. The engine starts running
/// immediately; events begin with `SessionConfigured`.
pub fn spawn_session(
    config: AnalysisConfig,
    services: SessionServices,
    project_id: &str,
) -> AnalysisSession {
    let session_id = Uuid::new_v4().to_string();
    let (tx_event, rx_event) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (tx_sub, rx_sub) = async_channel::unbounded();
    let cancel = CancellationToken::new();

    let config = Arc::new(config);
    let deadline_session = config.deadline_session;
    let engine = WorkflowEngine::new(services, config, tx_event, rx_sub, cancel.clone());
    let state = AnalysisState::new(session_id.clone(), project_id);

    let wall_clock = cancel.clone();
    let handle = tokio::spawn(async move {
        let run = engine.run(state);
        tokio::pin!(run);
        tokio::select! {
            state = &mut run => state,
            _ = tokio::time::sleep(deadline_session) => {
                warn!("session wall-clock deadline of {deadline_session:?} reached, cancelling");
                wall_clock.cancel();
                run.await
            }
        }
    });

    AnalysisSession {
        session_id,
        tx_sub,
        rx_event: Mutex::new(rx_event),
        cancel,
        handle: Mutex::new(Some(handle)),
        next_sub_id: AtomicU64::new(0),
    }
}

/// How a blocking run picks its dataset once the listing arrives.
#[derive(Debug, Clone)]
pub enum DatasetChoice {
    Index(usize),
    Name(String),
}

/// Pre-supplied answers for a non-interactive run.
#[derive(Debug, Clone)]
pub struct ScriptedInputs {
    pub dataset: DatasetChoice,
    pub task: String,
}

/// Run a session to termination with scripted inputs and return the final
/// state. Events are consumed internally; use [`spawn_session`] directly
/// for streaming.
pub async fn run_blocking(
    config: AnalysisConfig,
    services: SessionServices,
    project_id: &str,
    inputs: ScriptedInputs,
) -> Result<AnalysisState> {
    let session = spawn_session(config, services, project_id);

    while let Some(event) = session.next_event().await {
        match event.msg {
            EventMsg::DatasetSelectionRequested(request) => {
                let index = match &inputs.dataset {
                    DatasetChoice::Index(index) => *index,
                    DatasetChoice::Name(name) => request
                        .datasets
                        .iter()
                        .position(|dataset| dataset == name)
                        // Out-of-range on purpose: the engine re-asks and
                        // then fails with DATASET_NOT_FOUND.
                        .unwrap_or(usize::MAX),
                };
                session.submit(Op::SelectDataset { index }).await?;
            }
            EventMsg::TaskRequested(_) => {
                session
                    .submit(Op::SubmitTask {
                        task: inputs.task.clone(),
                    })
                    .await?;
            }
            EventMsg::AnalysisComplete(_) => break,
            _ => {}
        }
    }

    session.into_final_state().await
}
