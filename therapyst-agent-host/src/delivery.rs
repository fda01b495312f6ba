//! Result sender: pushes finished results to the kernel, one at a time.
//!
//! The agent is the requester on the result channel. Each result is sent and
//! its ack awaited before the next one leaves, so results of one node never
//! interleave on the wire. A result whose delivery fails is retried on the
//! next connection the kernel opens; the kernel drops the copy it may already
//! have filed.

use std::sync::Arc;
use std::time::Duration;

use therapyst_wire::{encode_result, result_receipt, Channel, CommandResult, Endpoint};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::stats::Counters;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Drains the result queue until every producer is gone.
pub(crate) async fn run_sender(
    endpoint: Endpoint,
    mut results_rx: mpsc::UnboundedReceiver<CommandResult>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    let mut channel: Option<Channel> = None;
    while let Some(result) = results_rx.recv().await {
        deliver(&endpoint, &mut channel, &result, &counters, &token).await;
    }
    debug!("Result queue closed, sender exiting");
}

async fn deliver(
    endpoint: &Endpoint,
    channel: &mut Option<Channel>,
    result: &CommandResult,
    counters: &Counters,
    token: &CancellationToken,
) {
    let payload = match encode_result(result) {
        Ok(payload) => payload,
        Err(e) => {
            error!(command_id = result.id(), error = %e, "Failed to encode result");
            return;
        }
    };
    let receipt = result_receipt(result.id());

    loop {
        if channel.is_none() {
            let accepted = tokio::select! {
                biased;
                accepted = endpoint.accept() => accepted,
                _ = token.cancelled() => {
                    warn!(command_id = result.id(), "No kernel connected while stopping, dropping result");
                    return;
                }
            };
            match accepted {
                Ok(accepted) => *channel = Some(accepted),
                Err(e) => {
                    warn!(error = %e, "Failed to accept result connection");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            }
        }

        let Some(conn) = channel.as_mut() else { continue };
        match conn.request_text(&payload).await {
            Ok(ack) => {
                if ack != receipt {
                    warn!(command_id = result.id(), ack = %ack, "Unexpected result ack");
                }
                Counters::bump(&counters.results_sent);
                debug!(command_id = result.id(), "Result delivered");
                return;
            }
            Err(e) => {
                warn!(command_id = result.id(), error = %e, "Result delivery failed, waiting for the kernel to reconnect");
                *channel = None;
                if token.is_cancelled() {
                    warn!(command_id = result.id(), "Dropping undelivered result while stopping");
                    return;
                }
            }
        }
    }
}
