//! Dispatcher actor: moves queued jobs onto the accelerator.

use std::sync::Arc;

use queue_core::JobRecord;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::{DispatcherMessage, OrchestratorMessage};
use crate::orchestrator::Services;

/// State for the dispatcher actor.
pub struct DispatcherState {
    orchestrator: ActorRef<OrchestratorMessage>,
    services: Arc<Services>,
    running: bool,
}

/// Dispatcher actor arguments.
pub struct DispatcherArgs {
    pub orchestrator: ActorRef<OrchestratorMessage>,
    pub services: Arc<Services>,
}

/// Dispatcher actor.
///
/// On every tick it asks the orchestrator for the next job. The
/// orchestrator only hands one out while nothing holds the accelerator, and
/// marks it PENDING in the same message, so two jobs never start together.
pub struct DispatcherActor;

impl Actor for DispatcherActor {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting dispatcher");

        let interval = args.services.config.dispatch_interval;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if myself_clone.send_message(DispatcherMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(DispatcherState {
            orchestrator: args.orchestrator,
            services: args.services,
            running: true,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Tick => {
                if !state.running {
                    return Ok(());
                }

                let result = ractor::rpc::call(
                    &state.orchestrator,
                    |reply| OrchestratorMessage::RequestJob { reply },
                    Some(state.services.config.dequeue_wait),
                )
                .await;

                match result {
                    Ok(ractor::rpc::CallResult::Success(Some(record))) => {
                        launch(&state.services, &state.orchestrator, record).await;
                    }
                    Ok(ractor::rpc::CallResult::Success(None)) => {}
                    Ok(ractor::rpc::CallResult::Timeout) => {
                        tracing::debug!("Dispatch request timed out");
                    }
                    Ok(ractor::rpc::CallResult::SenderError) | Err(_) => {
                        tracing::warn!("Orchestrator unavailable, stopping dispatcher");
                        state.running = false;
                        myself.stop(None);
                    }
                }
            }

            DispatcherMessage::Shutdown => {
                tracing::info!("Shutting down dispatcher");
                state.running = false;
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Start the worker of a PENDING job and report the result to the
/// orchestrator.
pub(crate) async fn launch(
    services: &Services,
    orchestrator: &ActorRef<OrchestratorMessage>,
    record: JobRecord,
) {
    let job_id = record.id;
    let execution_id = ulid::Ulid::new().to_string();

    let message = match services.processes.spawn(&record, &execution_id).await {
        Ok(process) => OrchestratorMessage::Started {
            job_id,
            execution_id,
            process,
        },
        Err(e) => {
            tracing::error!("Failed to start job {}: {}", job_id, e);
            OrchestratorMessage::SpawnFailed {
                job_id,
                error: e.to_string(),
            }
        }
    };

    if let Err(e) = orchestrator.send_message(message) {
        // The worker, if any, keeps running and is adopted at the next start.
        tracing::error!("Cannot report launch of job {}: {}", job_id, e);
    }
}

/// Start the dispatcher for `orchestrator`.
pub async fn start_dispatcher(
    orchestrator: ActorRef<OrchestratorMessage>,
    services: Arc<Services>,
) -> Result<(ActorRef<DispatcherMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(
        None,
        DispatcherActor,
        DispatcherArgs {
            orchestrator,
            services,
        },
    )
    .await
}
