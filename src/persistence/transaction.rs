//! Begin/end bookkeeping around one experiment run

use crate::execution::signals::{HandlerId, SignalRegistry};
use crate::persistence::{ExperimentRecord, ExperimentStore, PersistenceError, StoreSession};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

struct TransactionState {
    experiment: ExperimentRecord,
    session: Box<dyn StoreSession>,
}

/// An open experiment transaction
///
/// Clones share the same record and session. The session is closed by the
/// first [`end_transaction`], whether it comes from normal completion or
/// from the termination handler registered by [`begin_transaction`].
#[derive(Clone)]
pub struct Transaction {
    state: Arc<Mutex<TransactionState>>,
    registry: Arc<SignalRegistry>,
    handler: HandlerId,
}

impl Transaction {
    /// Snapshot of the experiment record as last seen by this transaction
    pub async fn experiment(&self) -> ExperimentRecord {
        self.state.lock().await.experiment.clone()
    }

    /// Whether the session has been closed
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.session.is_closed()
    }

    /// End the transaction and drop its termination handler
    pub async fn finish(self) {
        end_transaction(&self).await;
        self.registry.unregister(self.handler);
    }
}

/// Commit attempts made before a stale-data conflict is given up on
const MAX_COMMIT_ATTEMPTS: usize = 5;

/// Persist the experiment, stamp its begin time and guard its end time
///
/// A stale-data conflict is retried against the stored record. If it keeps
/// conflicting, the experiment proceeds with an unstored begin time.
///
/// # Errors
/// Returns the store error if the record cannot be persisted at all.
pub async fn begin_transaction(
    store: &dyn ExperimentStore,
    registry: &Arc<SignalRegistry>,
    record: &ExperimentRecord,
) -> Result<Transaction, PersistenceError> {
    let (stored, mut session) = store.persist_experiment(record).await?;

    let now = Utc::now();
    let experiment = match commit_merged(session.as_mut(), &stored, |r| stamp_begin(r, now)).await {
        Ok(committed) => committed,
        Err(PersistenceError::StaleData { id }) => {
            warn!("Begin of experiment {} was not stored, proceeding", id);
            let mut local = stored;
            stamp_begin(&mut local, now);
            local
        }
        Err(e) => return Err(e),
    };
    debug!("Began experiment {} ({})", experiment.name, experiment.id);

    let state = Arc::new(Mutex::new(TransactionState { experiment, session }));

    // React to external signals
    let guarded = Arc::clone(&state);
    let handler = registry.register(move || async move {
        finalize(&guarded).await;
    });

    Ok(Transaction {
        state,
        registry: Arc::clone(registry),
        handler,
    })
}

/// Stamp the end time and close the session
///
/// Never fails: a closed session or a conflicting writer is logged and the
/// call degrades to a no-op.
pub async fn end_transaction(transaction: &Transaction) {
    finalize(&transaction.state).await;
}

async fn finalize(state: &Mutex<TransactionState>) {
    let mut state = state.lock().await;
    let TransactionState { experiment, session } = &mut *state;

    if session.is_closed() {
        warn!("Could not end experiment {}: session is closed", experiment.id);
        return;
    }

    let now = Utc::now();
    match commit_merged(session.as_mut(), experiment, |r| stamp_end(r, now)).await {
        Ok(committed) => *experiment = committed,
        Err(e) => error!("Could not end experiment {}: {}", experiment.id, e),
    }
    session.close();
    debug!("Ended experiment {} ({})", experiment.name, experiment.id);
}

/// begin = min(begin, now)
fn stamp_begin(record: &mut ExperimentRecord, now: DateTime<Utc>) {
    record.begin = Some(record.begin.map_or(now, |begin| begin.min(now)));
}

/// end = max(end, now)
fn stamp_end(record: &mut ExperimentRecord, now: DateTime<Utc>) {
    record.end = Some(record.end.map_or(now, |end| end.max(now)));
}

/// Apply `merge` to `record` and commit it
///
/// On a stale-data conflict the stored record is re-read and `merge` is
/// applied to it again, so concurrent writers of one record never drop
/// each other's timestamps.
async fn commit_merged<F>(
    session: &mut dyn StoreSession,
    record: &ExperimentRecord,
    merge: F,
) -> Result<ExperimentRecord, PersistenceError>
where
    F: Fn(&mut ExperimentRecord),
{
    let mut attempt = record.clone();
    let mut conflicts = 0;

    loop {
        merge(&mut attempt);
        session.add(&attempt)?;

        match session.commit().await {
            Ok(Some(committed)) => return Ok(committed),
            Ok(None) => return Ok(attempt),
            Err(PersistenceError::StaleData { id }) => {
                error!("Transaction isolation level caused a stale data conflict on experiment {}", id);
                conflicts += 1;
                if conflicts >= MAX_COMMIT_ATTEMPTS {
                    return Err(PersistenceError::StaleData { id });
                }
                attempt = session.refresh(id).await?.ok_or_else(|| {
                    PersistenceError::InvalidRequest(format!("experiment {} is no longer stored", id))
                })?;
            }
            Err(e) => return Err(e),
        }
    }
}
