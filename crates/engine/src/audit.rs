use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use exchange_core::{AuditRequest, ExchangeClient};
use ledger::PositionLedger;
use model::EngineEvent;

/// Position audit loop.
///
/// The ingestor requests an audit on every (re)connect and holds event
/// emission until the ack. The ledger merges in anything the exchange
/// knows that we do not; adopted positions surface as orphan warnings on
/// the event bus.
pub async fn run_position_audit(
    mut audit_rx: mpsc::Receiver<AuditRequest>,
    client: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    event_tx: broadcast::Sender<EngineEvent>,
) {
    while let Some(request) = audit_rx.recv().await {
        match client.open_positions().await {
            Ok(remote) => {
                info!(remote = remote.len(), "running position audit");
                match ledger.reconcile(remote).await {
                    Ok(adopted) => {
                        for position in adopted {
                            warn!(
                                pair = %position.pair,
                                qty = %position.quantity,
                                "orphaned position adopted from exchange"
                            );
                            let _ = event_tx.send(EngineEvent::OrphanedPosition { position });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "audit reconcile could not be persisted");
                        let _ = event_tx.send(EngineEvent::PersistenceDivergence {
                            detail: format!("audit reconcile failed: {e}"),
                        });
                    }
                }
            }
            Err(e) => {
                // The stream still resumes; a missed audit repeats on the
                // next reconnect.
                error!(error = %e, "position audit skipped, exchange unreachable");
            }
        }
        let _ = request.ack.send(());
    }
}
