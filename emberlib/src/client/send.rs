//! Send implementations for [`crate::client::EthereumClient`].

use num_bigint::BigUint;
use num_traits::Zero;

use ember_sync::ChainParameters;
use ember_sync::primitives::Address;
use ember_sync::sync::BackendRequest;
use ember_sync::transaction::{self, RawTransaction, Transaction};
use ember_sync::wallet::traits::SyncTransactions;
use ember_sync::wallet::{Asset, TransactionRecord};

use crate::utils::{abi_selector, abi_word_address, abi_word_uint};

use super::EthereumClient;
use super::error::ClientError;

impl EthereumClient {
    /// Signs and broadcasts a transfer or contract call.
    ///
    /// The nonce is assigned by the back-end immediately before signing;
    /// concurrent sends are serialised so two transfers never share one.
    /// The returned transaction is recorded as pending until the index or a
    /// proof confirms it.
    pub async fn send(
        &self,
        to: Address,
        value: BigUint,
        data: Vec<u8>,
        gas_price: u64,
        gas_limit: Option<u64>,
    ) -> Result<Transaction, ClientError> {
        let _send_guard = self.send_guard.lock().await;

        let nonce = self
            .backend_request(BackendRequest::TransactionCount)
            .await?;

        let gas_limit = gas_limit.unwrap_or(if data.is_empty() {
            self.config.gas.native_gas_limit
        } else {
            self.config.gas.erc20_gas_limit
        });
        let raw = RawTransaction::new(gas_price, gas_limit, to, value).with_data(data);

        let chain_id = self.config.chain.chain_id();
        let signed = {
            let wallet_guard = self.wallet.read().await;
            transaction::sign(&raw, nonce, chain_id, wallet_guard.account_key())
        };

        let broadcast_hash = self
            .backend_request(|reply| {
                BackendRequest::SendRawTransaction(reply, signed.encoded.clone())
            })
            .await?;
        if broadcast_hash != signed.transaction.hash {
            tracing::warn!(
                "Remote reported hash {broadcast_hash} for transaction {}",
                signed.transaction.hash
            );
        }

        // ERC-20 transfers to a registered token are attributed to it
        let asset = if self.tokens.read().await.contains(&to)
            && signed.transaction.input.starts_with(&abi_selector("transfer(address,uint256)"))
        {
            Asset::Erc20(to)
        } else {
            Asset::Native
        };
        let record = TransactionRecord {
            transaction: signed.transaction.clone(),
            asset,
        };
        super::infallible(self.wallet.write().await.insert_transactions(vec![record]));
        self.streams.dispatch(ember_sync::sync::SyncEvent::Transactions(
            asset,
            vec![signed.transaction.clone()],
        ));

        Ok(signed.transaction)
    }

    /// Transfers `amount` of an ERC-20 token.
    pub async fn erc20_transfer(
        &self,
        contract: Address,
        recipient: Address,
        amount: BigUint,
        gas_price: u64,
        gas_limit: Option<u64>,
    ) -> Result<Transaction, ClientError> {
        let mut data = abi_selector("transfer(address,uint256)").to_vec();
        data.extend_from_slice(&abi_word_address(&recipient));
        data.extend_from_slice(&abi_word_uint(&amount));

        self.send(contract, BigUint::zero(), data, gas_price, gas_limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use tokio::sync::mpsc;

    use ember_sync::error::RequestError;
    use ember_sync::primitives::Address;
    use ember_sync::sync::BackendRequest;

    use crate::client::EthereumClient;
    use crate::client::error::ClientError;
    use crate::config::{ChainType, EmberConfig};

    fn test_client() -> EthereumClient {
        EthereumClient::new(
            EmberConfig::build(ChainType::Ropsten).create(),
            &[0x46; 32],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_without_backend_is_rejected() {
        let client = test_client();
        let result = client
            .send(
                Address::new([0x35; 20]),
                BigUint::from(1u32),
                Vec::new(),
                20_000_000_000,
                None,
            )
            .await;
        assert!(matches!(result, Err(ClientError::SyncModeError(_))));
    }

    #[tokio::test]
    async fn send_assigns_nonce_signs_and_records_pending() {
        let mut client = test_client();

        // a scripted back-end standing in for the sync engine
        let (request_sender, mut requests) = mpsc::unbounded_channel();
        client.backend_requests = Some(request_sender);
        let backend = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                match request {
                    BackendRequest::TransactionCount(reply) => {
                        let _ = reply.send(Ok(9));
                    }
                    BackendRequest::SendRawTransaction(reply, encoded) => {
                        let hash = ember_sync::crypto::keccak256(&encoded);
                        let _ = reply.send(Ok(ember_sync::primitives::Hash32::new(hash)));
                    }
                    _ => {}
                }
            }
        });

        let transaction = client
            .send(
                Address::new([0x35; 20]),
                BigUint::from(1_000_000_000_000_000_000u64),
                Vec::new(),
                20_000_000_000,
                None,
            )
            .await
            .unwrap();

        assert_eq!(transaction.nonce, 9);
        assert_eq!(transaction.from, client.receive_address());
        assert!(transaction.block_height.is_none());
        // the pending record is immediately visible in the log
        assert_eq!(
            client.transaction(transaction.hash).await.unwrap().nonce,
            9
        );

        client.backend_requests = None;
        backend.abort();
    }

    #[tokio::test]
    async fn dropped_backend_surfaces_cancellation() {
        let mut client = test_client();
        let (request_sender, requests) = mpsc::unbounded_channel();
        client.backend_requests = Some(request_sender);
        // back-end goes away with the request in flight
        drop(requests);

        let result = client.gas_price().await;
        assert!(matches!(
            result,
            Err(ClientError::RequestError(RequestError::Cancelled))
        ));
    }
}
