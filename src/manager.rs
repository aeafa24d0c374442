//! Top-level update session driver.

use crate::context::DfuContext;
use crate::error::DfuError;
use crate::package::Package;
use crate::states::Status;
use crate::transport::{GattClient, GattSession};

/// Drives one complete firmware update against a single target.
pub struct DfuManager<C: GattClient> {
    client: C,
    context: DfuContext<C>,
}

impl<C: GattClient> DfuManager<C> {
    pub fn new(client: C, target_name: impl Into<String>, package: Package) -> DfuManager<C> {
        DfuManager {
            client,
            context: DfuContext::new(target_name.into(), package),
        }
    }

    pub fn context(&self) -> &DfuContext<C> {
        &self.context
    }

    /// Run the update to completion.
    ///
    /// Whatever happens, the session is torn down before returning: a failed
    /// transfer sends a best-effort ABORT, and the connection is released
    /// exactly once.
    pub async fn run(&mut self) -> Result<(), DfuError> {
        let result = Self::drive(&self.client, &mut self.context).await;

        if result.is_err() && self.context.session.is_some() {
            log::error!("transfer failed. aborting firmware update...");
            if let Err(err) = self.context.abort().await {
                log::warn!("abort failed: {err}");
            }
        }
        if let Some(session) = self.context.session.take() {
            if let Err(err) = session.disconnect().await {
                log::warn!("disconnect failed: {err}");
            }
        }
        result
    }

    async fn drive(client: &C, cx: &mut DfuContext<C>) -> Result<(), DfuError> {
        let mut status = Status::Init;
        loop {
            match status {
                Status::Init | Status::Handled | Status::Ignored => {
                    let state = cx.state;
                    status = state.handle(cx, client).await?;
                }
                Status::Transitioned => {
                    let (prev, next) = (cx.prev_state, cx.state);
                    prev.exit(cx);
                    status = next.entry(cx, client).await?;
                }
                Status::Complete => return Ok(()),
                Status::Error => return Err(DfuError::InvalidInternalState),
            }
        }
    }
}
