//! The finalization scheduler: a bounded event queue, one dispatcher task,
//! and two bounded worker pools.
//!
//! The dispatcher is the only consumer of the queue and the only place that
//! reads an event's kind. FINALIZE work goes to the finalize pool;
//! RESCHEDULE work sleeps in the reschedule pool so the finalize pool is
//! never occupied by waiting tasks; STOP ends the dispatcher. Queue sends
//! block once the queue is full — that is the system's backpressure.

use crate::services::DepositError;
use crate::services::deposit_service::DepositService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// One unit of scheduler work. Transient; never persisted. After a crash the
/// queue is rebuilt from the deposit records on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerEvent {
    Finalize(String),
    Reschedule(String),
    Stop,
}

#[derive(Clone, Debug)]
pub struct FinalizerConfig {
    pub finalizer_workers: usize,
    pub rescheduler_workers: usize,
    pub reschedule_delay: Duration,
}

/// Owns the dispatcher and worker pools; started once at boot, stopped once
/// at shutdown.
pub struct DepositFinalizerManager {
    deposits: DepositService,
    queue: mpsc::Sender<FinalizerEvent>,
    listener: Option<JoinHandle<()>>,
    receiver: Option<mpsc::Receiver<FinalizerEvent>>,
    config: FinalizerConfig,
}

impl DepositFinalizerManager {
    pub fn new(
        deposits: DepositService,
        queue: mpsc::Sender<FinalizerEvent>,
        receiver: mpsc::Receiver<FinalizerEvent>,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            deposits,
            queue,
            listener: None,
            receiver: Some(receiver),
            config,
        }
    }

    /// Start the dispatcher, then rebuild the queue from disk: every deposit
    /// left in UPLOADED or FINALIZING gets exactly one more FINALIZE.
    pub async fn start(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.listener = Some(tokio::spawn(run_dispatcher(
                receiver,
                self.deposits.clone(),
                self.queue.clone(),
                self.config.clone(),
            )));
        }

        let open = self.deposits.open_deposits().await;
        info!("found {} deposits that need to be checked", open.len());

        for deposit in open {
            info!(deposit = %deposit.id, "queueing finalize event for recovered deposit");
            if let Err(err) = self
                .queue
                .send(FinalizerEvent::Finalize(deposit.id.clone()))
                .await
            {
                error!("unable to put recovered deposit on queue: {err}");
            }
        }
    }

    /// Enqueue STOP and wait for the dispatcher to wind down. In-flight
    /// finalize tasks complete; in-flight reschedule sleeps are abandoned,
    /// since a restart re-enqueues their deposits anyway.
    pub async fn stop(mut self) {
        if let Err(err) = self.queue.send(FinalizerEvent::Stop).await {
            error!("unable to put stop event on queue: {err}");
        }
        if let Some(listener) = self.listener.take() {
            if let Err(err) = listener.await {
                error!("dispatcher task failed during shutdown: {err}");
            }
        }
    }
}

async fn run_dispatcher(
    mut receiver: mpsc::Receiver<FinalizerEvent>,
    deposits: DepositService,
    queue: mpsc::Sender<FinalizerEvent>,
    config: FinalizerConfig,
) {
    let finalize_pool = Arc::new(Semaphore::new(config.finalizer_workers.max(1)));
    let reschedule_pool = Arc::new(Semaphore::new(config.rescheduler_workers.max(1)));
    let mut finalize_tasks = JoinSet::new();
    let mut reschedule_tasks = JoinSet::new();

    while let Some(event) = receiver.recv().await {
        info!(?event, "received task from queue");

        // reap finished workers so the join sets stay small
        while finalize_tasks.try_join_next().is_some() {}
        while reschedule_tasks.try_join_next().is_some() {}

        match event {
            FinalizerEvent::Stop => break,

            FinalizerEvent::Finalize(deposit_id) => {
                let Ok(permit) = finalize_pool.clone().acquire_owned().await else {
                    break;
                };
                let deposits = deposits.clone();
                let queue = queue.clone();
                finalize_tasks.spawn(async move {
                    finalize_one(&deposits, &queue, &deposit_id).await;
                    drop(permit);
                });
            }

            FinalizerEvent::Reschedule(deposit_id) => {
                let Ok(permit) = reschedule_pool.clone().acquire_owned().await else {
                    break;
                };
                let queue = queue.clone();
                let delay = config.reschedule_delay;
                reschedule_tasks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = queue.send(FinalizerEvent::Finalize(deposit_id)).await {
                        error!("unable to put rescheduled deposit back on queue: {err}");
                    }
                    drop(permit);
                });
            }
        }
    }

    // graceful for finalize, abrupt for reschedule
    reschedule_tasks.abort_all();
    while finalize_tasks.join_next().await.is_some() {}
    info!("finalizer dispatcher stopped");
}

/// One finalize attempt. Disk-space exhaustion becomes a RESCHEDULE event;
/// every other failure is logged and goes no further.
async fn finalize_one(
    deposits: &DepositService,
    queue: &mpsc::Sender<FinalizerEvent>,
    deposit_id: &str,
) {
    match deposits.finalize_deposit(deposit_id).await {
        Ok(deposit) => info!(deposit = %deposit.id, "finalized deposit"),
        Err(DepositError::OutOfDiskSpace) => {
            warn!(deposit = %deposit_id, "rescheduling deposit, not enough disk space");
            if let Err(err) = queue
                .send(FinalizerEvent::Reschedule(deposit_id.to_string()))
                .await
            {
                error!("unable to put deposit {deposit_id} on reschedule queue: {err}");
            }
        }
        Err(err @ DepositError::DepositNotFound(_)) => {
            error!("unable to finalize deposit {deposit_id} because it could not be found: {err}");
        }
        Err(
            err @ (DepositError::InvalidDeposit(_) | DepositError::InvalidPartialFile(_)),
        ) => {
            error!("unable to finalize deposit {deposit_id} because it is invalid: {err}");
        }
        Err(err @ DepositError::CollectionNotFound(_)) => {
            error!(
                "unable to finalize deposit {deposit_id} because the collection could not be found: {err}"
            );
        }
        Err(err) => {
            // unclassified: the deposit stays exactly as it was
            error!("unknown error while finalizing deposit {deposit_id}: {err}");
        }
    }
}
