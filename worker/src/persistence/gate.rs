//! StoreGateActor - the single gate in front of the stats backend
//!
//! All database access is funneled through this actor's mailbox, so at most
//! one backend call is in flight at any time. Each call runs on the blocking
//! pool and its result is sent back over an RPC reply port.

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};

use super::store::{CommitBatch, InstallEvent, StatsBackend, StoreError};

/// Actor that serializes access to a [`StatsBackend`]
#[derive(Debug, Default)]
pub struct StoreGateActor;

pub struct StoreGateArguments {
    pub backend: Arc<dyn StatsBackend>,
}

pub struct StoreGateState {
    backend: Arc<dyn StatsBackend>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum StoreGateMsg {
    /// Write one batch in a single transaction
    Commit {
        batch: CommitBatch,
        reply: RpcReplyPort<Result<(), StoreError>>,
    },
    GetCount {
        key: String,
        reply: RpcReplyPort<Result<i64, StoreError>>,
    },
    RecentEvents {
        limit: usize,
        reply: RpcReplyPort<Result<Vec<InstallEvent>, StoreError>>,
    },
}

#[async_trait]
impl Actor for StoreGateActor {
    type Msg = StoreGateMsg;
    type State = StoreGateState;
    type Arguments = StoreGateArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "StoreGateActor starting");

        let backend = Arc::clone(&args.backend);
        run_blocking(move || backend.initialize())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to initialize stats store: {e}")))?;

        Ok(StoreGateState {
            backend: args.backend,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let backend = Arc::clone(&state.backend);
        match message {
            StoreGateMsg::Commit { batch, reply } => {
                let result = run_blocking(move || backend.commit(&batch)).await;
                let _ = reply.send(result);
            }
            StoreGateMsg::GetCount { key, reply } => {
                let result = run_blocking(move || backend.get_count(&key)).await;
                let _ = reply.send(result);
            }
            StoreGateMsg::RecentEvents { limit, reply } => {
                let result = run_blocking(move || backend.recent_events(limit)).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "StoreGateActor stopped");
        Ok(())
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task panicked: {e}")))?
}

// ============================================================================
// Convenience calls
// ============================================================================

pub async fn commit(gate: &ActorRef<StoreGateMsg>, batch: CommitBatch) -> Result<(), StoreError> {
    ractor::call!(gate, |reply| StoreGateMsg::Commit { batch, reply })
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

pub async fn get_count(gate: &ActorRef<StoreGateMsg>, key: &str) -> Result<i64, StoreError> {
    let key = key.to_string();
    ractor::call!(gate, |reply| StoreGateMsg::GetCount { key, reply })
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

pub async fn recent_events(
    gate: &ActorRef<StoreGateMsg>,
    limit: usize,
) -> Result<Vec<InstallEvent>, StoreError> {
    ractor::call!(gate, |reply| StoreGateMsg::RecentEvents { limit, reply })
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}
