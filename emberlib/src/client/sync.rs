//! Sync lifecycle implementations for [`crate::client::EthereumClient`].

use std::sync::atomic;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;

use ember_sync::error::{SyncError, SyncModeError};
use ember_sync::sync::BackendRequest;
use ember_sync::wallet::SyncMode;

use crate::wallet::error::WalletError;

use super::EthereumClient;
use super::error::ClientError;

// deadline for the back-end task to wind down after a stop
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// The state of the sync task at the last poll.
#[derive(Debug)]
pub enum PollReport {
    /// No sync task exists.
    NoHandle,
    /// The sync task is still running.
    NotReady,
    /// The sync task finished with this outcome.
    Ready(Result<(), SyncError<WalletError>>),
}

impl EthereumClient {
    /// Launches the configured back-end and the event dispatch task.
    ///
    /// Exactly one back-end is live per client; starting twice returns
    /// [`SyncModeError::SyncAlreadyRunning`].
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.sync_mode() != SyncMode::NotRunning {
            return Err(ClientError::SyncModeError(
                SyncModeError::SyncAlreadyRunning,
            ));
        }

        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        let (request_sender, request_receiver) = mpsc::unbounded_channel::<BackendRequest>();

        let streams = self.streams.clone();
        let dispatch_handle = tokio::spawn(async move {
            while let Some(event) = event_receiver.recv().await {
                streams.dispatch(event);
            }
        });

        let source = self.config.sync_source();
        let chain = self.config.chain;
        let address = self.receive_address();
        let tokens = self.tokens.clone();
        let wallet = self.wallet.clone();
        let sync_mode = self.sync_mode.clone();
        let sync_config = self.config.sync_config.clone();
        let sync_handle = tokio::spawn(async move {
            ember_sync::sync(
                source,
                &chain,
                address,
                tokens,
                wallet,
                event_sender,
                request_receiver,
                sync_mode,
                sync_config,
            )
            .await
        });

        self.sync_handle = Some(sync_handle);
        self.dispatch_handle = Some(dispatch_handle);
        self.backend_requests = Some(request_sender);

        Ok(())
    }

    /// Stops the running back-end.
    ///
    /// The back-end closes its transport, persists nothing past the last
    /// acknowledged height and joins within a bounded deadline; in-flight
    /// operation futures resolve with a cancellation error.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        if self.sync_mode() == SyncMode::NotRunning {
            return Err(ClientError::SyncModeError(SyncModeError::SyncNotRunning));
        }

        self.sync_mode
            .store(SyncMode::Shutdown as u8, atomic::Ordering::Release);
        self.backend_requests = None;

        if let Some(sync_handle) = self.sync_handle.take() {
            match tokio::time::timeout(STOP_DEADLINE, sync_handle).await {
                Ok(Ok(Err(error))) => {
                    tracing::warn!("Sync task stopped with error. {error}");
                }
                Ok(Ok(Ok(()))) => {}
                Ok(Err(join_error)) => {
                    tracing::warn!("Sync task panicked. {join_error}");
                }
                Err(_elapsed) => {
                    // deadline expired, abandon the task's resources
                    tracing::warn!("Sync task exceeded the stop deadline, abandoning.");
                }
            }
        }
        if let Some(dispatch_handle) = self.dispatch_handle.take() {
            // ends once the engine's event sender is gone
            let _ignore_outcome =
                tokio::time::timeout(STOP_DEADLINE, dispatch_handle).await;
        }

        self.sync_mode
            .store(SyncMode::NotRunning as u8, atomic::Ordering::Release);

        Ok(())
    }

    /// Brings the next poll or head check forward to now.
    pub fn refresh(&self) -> Result<(), ClientError> {
        self.backend()?
            .send(BackendRequest::Refresh)
            .map_err(|_| ClientError::SyncModeError(SyncModeError::SyncNotRunning))?;

        Ok(())
    }

    /// Stops any running back-end, then wipes the store and resets every
    /// subscription stream to its initial value.
    pub async fn clear(&mut self) -> Result<(), ClientError> {
        if self.sync_mode() != SyncMode::NotRunning {
            self.stop().await?;
        }

        self.wallet.write().await.clear_all();
        self.streams.reset();

        Ok(())
    }

    /// Returns the client's sync mode in non-atomic (enum) form.
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        SyncMode::from_atomic_u8(self.sync_mode.clone())
            .expect("this library does not allow setting of non-valid sync mode variants")
    }

    /// Polls the sync task, returning [`PollReport`].
    pub fn poll_sync(&mut self) -> PollReport {
        if let Some(mut sync_handle) = self.sync_handle.take() {
            if let Some(outcome) = (&mut sync_handle).now_or_never() {
                self.sync_mode
                    .store(SyncMode::NotRunning as u8, atomic::Ordering::Release);
                PollReport::Ready(outcome.expect("task panicked"))
            } else {
                self.sync_handle = Some(sync_handle);
                PollReport::NotReady
            }
        } else {
            PollReport::NoHandle
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_sync::error::SyncModeError;
    use ember_sync::wallet::SyncMode;

    use crate::client::EthereumClient;
    use crate::client::error::ClientError;
    use crate::config::{ChainType, EmberConfig};

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let mut client = EthereumClient::new(
            EmberConfig::build(ChainType::Ropsten).create(),
            &[0x46; 32],
        )
        .unwrap();

        assert_eq!(client.sync_mode(), SyncMode::NotRunning);
        assert!(matches!(
            client.stop().await,
            Err(ClientError::SyncModeError(SyncModeError::SyncNotRunning))
        ));
    }

    #[tokio::test]
    async fn clear_resets_streams_and_store() {
        let mut client = EthereumClient::new(
            EmberConfig::build(ChainType::Ropsten).create(),
            &[0x46; 32],
        )
        .unwrap();

        client
            .streams
            .dispatch(ember_sync::sync::SyncEvent::LastBlockHeight(42));
        assert_eq!(*client.last_block_height_stream().borrow(), Some(42));

        client.clear().await.unwrap();
        assert_eq!(*client.last_block_height_stream().borrow(), None);
        assert!(client.balance().await.is_none());
    }
}
