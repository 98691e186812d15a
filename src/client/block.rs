//! Block attempts
//!
//! One network call for one block, turned into an outcome the segment can
//! feed to its retry tracker. An attempt never returns an error: timeouts,
//! network failures and bad data all become outcomes.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::buffer::{Buffer, BufferFactory};
use crate::domain::ports::BlockNetwork;
use crate::error::{FailureMode, FetchFailureMode, InsertFailureMode};
use crate::keys::ContentKey;

/// Result of one fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Buffer),
    NonFatal(FetchFailureMode),
    Fatal(FetchFailureMode),
}

impl FetchOutcome {
    fn failure(mode: FetchFailureMode) -> Self {
        if mode.is_fatal() {
            FetchOutcome::Fatal(mode)
        } else {
            FetchOutcome::NonFatal(mode)
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NonFatal(_) => "nonfatal",
            FetchOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Result of one insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Success(ContentKey),
    NonFatal(InsertFailureMode),
    Fatal(InsertFailureMode),
}

impl InsertOutcome {
    fn failure(mode: InsertFailureMode) -> Self {
        if mode.is_fatal() {
            InsertOutcome::Fatal(mode)
        } else {
            InsertOutcome::NonFatal(mode)
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InsertOutcome::Success(_) => "success",
            InsertOutcome::NonFatal(_) => "nonfatal",
            InsertOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Fetch one block and verify it against its key.
///
/// A timeout is a nonfatal transfer failure. Data that does not match a
/// content-hash key is a fatal decode error. Cancellation abandons the call.
#[instrument(skip(network, buffers, cancel))]
pub async fn fetch_block(
    network: &dyn BlockNetwork,
    buffers: &dyn BufferFactory,
    key: &ContentKey,
    timeout: Duration,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return FetchOutcome::Fatal(FetchFailureMode::Cancelled),
        result = tokio::time::timeout(timeout, network.fetch(key)) => result,
    };

    match result {
        Err(_) => {
            debug!(?timeout, "Block fetch timed out");
            FetchOutcome::NonFatal(FetchFailureMode::TransferFailed)
        }
        Ok(Err(err)) => {
            trace!(error = %err, "Block fetch failed");
            FetchOutcome::failure(err.mode())
        }
        Ok(Ok(data)) => {
            if !key.verify(&data) {
                debug!(len = data.len(), "Block does not match its key");
                return FetchOutcome::Fatal(FetchFailureMode::BlockDecodeError);
            }
            FetchOutcome::Success(buffers.make_buffer(data))
        }
    }
}

/// Insert one block, optionally under a fixed key.
#[instrument(skip(network, data, cancel), fields(len = data.len()))]
pub async fn insert_block(
    network: &dyn BlockNetwork,
    data: Bytes,
    target: Option<&ContentKey>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> InsertOutcome {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return InsertOutcome::Fatal(InsertFailureMode::Cancelled),
        result = tokio::time::timeout(timeout, network.put(data, target)) => result,
    };

    match result {
        Err(_) => {
            debug!(?timeout, "Block insert timed out");
            InsertOutcome::NonFatal(InsertFailureMode::RouteNotFound)
        }
        Ok(Err(err)) => {
            trace!(error = %err, "Block insert failed");
            InsertOutcome::failure(err.mode())
        }
        Ok(Ok(key)) => InsertOutcome::Success(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_network::{FetchStep, InMemoryNetwork};
    use crate::buffer::InMemoryBufferFactory;
    use crate::domain::ports::{NetworkFetchError, NetworkPutError};
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_fetch_success() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"payload"));
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, FetchOutcome::Success(buf) if buf.as_slice() == b"payload");
    }

    #[tokio::test]
    async fn test_fetch_missing_is_nonfatal() {
        let network = InMemoryNetwork::new();
        let key = ContentKey::chk_for(b"never stored");
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, FetchOutcome::NonFatal(FetchFailureMode::DataNotFound));
    }

    #[tokio::test]
    async fn test_corrupt_block_is_fatal() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"payload"));
        network.script_fetch(&key, [FetchStep::Corrupt]);
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, FetchOutcome::Fatal(FetchFailureMode::BlockDecodeError));
    }

    #[tokio::test]
    async fn test_timeout_is_nonfatal() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"payload"));
        network.script_fetch(&key, [FetchStep::Hang]);
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, FetchOutcome::NonFatal(FetchFailureMode::TransferFailed));
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"payload"));
        network.script_fetch(&key, [FetchStep::Hang]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            TIMEOUT,
            &cancel,
        )
        .await;
        assert_matches!(outcome, FetchOutcome::Fatal(FetchFailureMode::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_error_passthrough() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"payload"));
        network.script_fetch(&key, [FetchStep::Fail(NetworkFetchError::RejectedOverload)]);
        let outcome = fetch_block(
            &network,
            &InMemoryBufferFactory::new(),
            &key,
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, FetchOutcome::NonFatal(FetchFailureMode::RejectedOverload));
    }

    #[tokio::test]
    async fn test_insert_outcomes() {
        let network = InMemoryNetwork::new();
        let cancel = CancellationToken::new();

        let outcome = insert_block(&network, Bytes::from_static(b"x"), None, TIMEOUT, &cancel).await;
        assert_eq!(outcome, InsertOutcome::Success(ContentKey::chk_for(b"x")));

        network.script_put([NetworkPutError::RejectedOverload, NetworkPutError::Collision]);
        let outcome = insert_block(&network, Bytes::from_static(b"y"), None, TIMEOUT, &cancel).await;
        assert_eq!(outcome, InsertOutcome::NonFatal(InsertFailureMode::RejectedOverload));
        let outcome = insert_block(&network, Bytes::from_static(b"y"), None, TIMEOUT, &cancel).await;
        assert_eq!(outcome, InsertOutcome::Fatal(InsertFailureMode::Collision));
    }
}
