use forge_protocol::{HarnessError, HarnessResult};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Paused,
    /// Session stopped or failed; waiters are released with a cancellation.
    Closed,
}

/// Blocking point for the agent-facing read path.
///
/// Waiters park on a watch channel, so one state change wakes all of them.
#[derive(Debug)]
pub struct PauseGate {
    state: watch::Sender<Gate>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Gate::Open);
        Self { state }
    }

    pub fn get(&self) -> Gate {
        *self.state.borrow()
    }

    pub fn set(&self, gate: Gate) {
        self.state.send_replace(gate);
    }

    /// Resolves once the gate is open; errors if it closes first.
    pub async fn wait_open(&self) -> HarnessResult<()> {
        let mut receiver = self.state.subscribe();
        loop {
            let gate = *receiver.borrow_and_update();
            match gate {
                Gate::Open => return Ok(()),
                Gate::Closed => return Err(HarnessError::cancelled("session is not running")),
                Gate::Paused => {
                    if receiver.changed().await.is_err() {
                        return Err(HarnessError::cancelled("pause gate dropped"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn paused_gate_holds_every_waiter_until_opened() -> Result<()> {
        let gate = Arc::new(PauseGate::new());
        gate.set(Gate::Paused);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait_open().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|waiter| !waiter.is_finished()));

        gate.set(Gate::Open);
        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter).await???;
        }
        Ok(())
    }

    #[tokio::test]
    async fn closing_releases_waiters_with_cancellation() -> Result<()> {
        let gate = Arc::new(PauseGate::new());
        gate.set(Gate::Paused);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.set(Gate::Closed);
        let result = timeout(Duration::from_secs(1), waiter).await??;
        assert!(result.is_err_and(|error| error.is_cancellation()));
        Ok(())
    }
}
