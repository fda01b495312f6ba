use thiserror::Error;

use crate::daemon::AgentState;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot {operation} an agent that is {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },

    #[error(transparent)]
    Wire(#[from] therapyst_wire::WireError),
}
