//! Queue fetch requests and serve them over HTTP.

use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::{CallRequest, FetchRequest, LogEntry, LogFilter, TransactionPageRequest};
use crate::crypto::keccak256;
use crate::error::ServerError;
use crate::primitives::{Address, Hash32};
use crate::transaction::Transaction;
use crate::wallet::Asset;

/// Stateless HTTP client pair: a JSON-RPC node and an Etherscan-style
/// transaction index.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    rpc_url: String,
    index_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    /// Builds a client for the given endpoints.
    #[must_use]
    pub fn new(rpc_url: http::Uri, index_url: http::Uri, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.to_string(),
            index_url: index_url.to_string(),
            api_key,
        }
    }
}

/// Receives [`FetchRequest`]s via an [`tokio::sync::mpsc::UnboundedReceiver`]
/// for queueing and fetching from the remote.
/// Returns the data specified in the [`FetchRequest`] variant via the
/// provided [`tokio::sync::oneshot::Sender`].
///
/// Handling all remote requests from a single task keeps one in-flight
/// request per endpoint class.
pub(crate) async fn fetch(
    mut fetch_request_receiver: UnboundedReceiver<FetchRequest>,
    client: ApiClient,
) {
    let mut request_id = 0u64;
    while let Some(fetch_request) = fetch_request_receiver.recv().await {
        request_id += 1;
        fetch_from_remote(&client, fetch_request, request_id).await;
    }
}

async fn fetch_from_remote(client: &ApiClient, fetch_request: FetchRequest, request_id: u64) {
    match fetch_request {
        FetchRequest::BlockNumber(sender) => {
            tracing::debug!("Fetching block number.");
            let height = rpc_u64(client, request_id, "eth_blockNumber", json!([])).await;
            let _ignore_error = sender.send(height);
        }
        FetchRequest::Balance(sender, address) => {
            tracing::debug!("Fetching balance. {}", &address);
            let balance = rpc_biguint(
                client,
                request_id,
                "eth_getBalance",
                json!([address.to_checksum_string(), "latest"]),
            )
            .await;
            let _ignore_error = sender.send(balance);
        }
        FetchRequest::TransactionCount(sender, address) => {
            tracing::debug!("Fetching transaction count. {}", &address);
            let count = rpc_u64(
                client,
                request_id,
                "eth_getTransactionCount",
                json!([address.to_checksum_string(), "pending"]),
            )
            .await;
            let _ignore_error = sender.send(count);
        }
        FetchRequest::GasPrice(sender) => {
            tracing::debug!("Fetching gas price.");
            let gas_price = rpc_u64(client, request_id, "eth_gasPrice", json!([])).await;
            let _ignore_error = sender.send(gas_price);
        }
        FetchRequest::SendRawTransaction(sender, encoded) => {
            tracing::debug!("Broadcasting raw transaction. {} bytes", encoded.len());
            let hash = send_raw_transaction(client, request_id, &encoded).await;
            let _ignore_error = sender.send(hash);
        }
        FetchRequest::Call(sender, request) => {
            tracing::debug!("Calling contract. {}", &request.to);
            let output = eth_call(client, request_id, &request).await;
            let _ignore_error = sender.send(output);
        }
        FetchRequest::EstimateGas(sender, request) => {
            tracing::debug!("Estimating gas. {}", &request.to);
            let estimate = rpc_u64(
                client,
                request_id,
                "eth_estimateGas",
                json!([call_object(&request)]),
            )
            .await;
            let _ignore_error = sender.send(estimate);
        }
        FetchRequest::GetLogs(sender, filter) => {
            tracing::debug!("Fetching logs from block {}.", filter.from_block);
            let logs = get_logs(client, request_id, &filter).await;
            let _ignore_error = sender.send(logs);
        }
        FetchRequest::Erc20Balance(sender, (contract, owner)) => {
            tracing::debug!("Fetching ERC-20 balance. {} for {}", &contract, &owner);
            let request = CallRequest {
                from: None,
                to: contract,
                value: None,
                data: balance_of_data(&owner),
            };
            let balance = eth_call(client, request_id, &request)
                .await
                .map(|output| BigUint::from_bytes_be(&output));
            let _ignore_error = sender.send(balance);
        }
        FetchRequest::TransactionPage(sender, request) => {
            tracing::debug!(
                "Fetching transaction index page {} from block {}.",
                request.page,
                request.start_block
            );
            let transactions = get_transaction_page(client, &request).await;
            let _ignore_error = sender.send(transactions);
        }
    }
}

// `balanceOf(address)` call data.
fn balance_of_data(owner: &Address) -> Vec<u8> {
    let mut data = keccak256(b"balanceOf(address)")[..4].to_vec();
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(owner.as_bytes());

    data
}

async fn rpc_call(
    client: &ApiClient,
    request_id: u64,
    method: &str,
    params: Value,
) -> Result<Value, ServerError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": method,
        "params": params,
    });
    let response: Value = client
        .http
        .post(&client.rpc_url)
        .json(&body)
        .send()
        .await?
        .json()
        .await?;

    if let Some(error) = response.get("error") {
        return Err(ServerError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| ServerError::InvalidResponse("missing result".to_string()))
}

async fn rpc_u64(
    client: &ApiClient,
    request_id: u64,
    method: &str,
    params: Value,
) -> Result<u64, ServerError> {
    let result = rpc_call(client, request_id, method, params).await?;

    hex_quantity_u64(&result)
}

async fn rpc_biguint(
    client: &ApiClient,
    request_id: u64,
    method: &str,
    params: Value,
) -> Result<BigUint, ServerError> {
    let result = rpc_call(client, request_id, method, params).await?;
    let digits = hex_str(&result)?;

    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| ServerError::InvalidResponse(format!("bad hex quantity {digits}")))
}

async fn send_raw_transaction(
    client: &ApiClient,
    request_id: u64,
    encoded: &[u8],
) -> Result<Hash32, ServerError> {
    let result = rpc_call(
        client,
        request_id,
        "eth_sendRawTransaction",
        json!([format!("0x{}", hex::encode(encoded))]),
    )
    .await?;
    let hash = hex_str(&result)?;

    Hash32::parse(&hash).map_err(|_| ServerError::InvalidResponse(format!("bad tx hash {hash}")))
}

fn call_object(request: &CallRequest) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(
        "to".to_string(),
        json!(request.to.to_checksum_string()),
    );
    object.insert(
        "data".to_string(),
        json!(format!("0x{}", hex::encode(&request.data))),
    );
    if let Some(from) = &request.from {
        object.insert("from".to_string(), json!(from.to_checksum_string()));
    }
    if let Some(value) = &request.value {
        object.insert("value".to_string(), json!(format!("0x{value:x}")));
    }

    Value::Object(object)
}

async fn eth_call(
    client: &ApiClient,
    request_id: u64,
    request: &CallRequest,
) -> Result<Vec<u8>, ServerError> {
    let result = rpc_call(
        client,
        request_id,
        "eth_call",
        json!([call_object(request), "latest"]),
    )
    .await?;
    let output = hex_str(&result)?;

    hex::decode(output).map_err(|e| ServerError::InvalidResponse(e.to_string()))
}

async fn get_logs(
    client: &ApiClient,
    request_id: u64,
    filter: &LogFilter,
) -> Result<Vec<LogEntry>, ServerError> {
    let mut object = serde_json::Map::new();
    object.insert(
        "fromBlock".to_string(),
        json!(format!("0x{:x}", filter.from_block)),
    );
    object.insert(
        "toBlock".to_string(),
        match filter.to_block {
            Some(to_block) => json!(format!("0x{to_block:x}")),
            None => json!("latest"),
        },
    );
    if let Some(address) = &filter.address {
        object.insert("address".to_string(), json!(address.to_checksum_string()));
    }
    if !filter.topics.is_empty() {
        object.insert(
            "topics".to_string(),
            json!(
                filter
                    .topics
                    .iter()
                    .map(|topic| topic.to_string())
                    .collect::<Vec<_>>()
            ),
        );
    }

    let result = rpc_call(client, request_id, "eth_getLogs", json!([object])).await?;
    let entries = result
        .as_array()
        .ok_or_else(|| ServerError::InvalidResponse("logs result is not an array".to_string()))?;

    entries.iter().map(parse_log_entry).collect()
}

fn parse_log_entry(entry: &Value) -> Result<LogEntry, ServerError> {
    let topics = entry
        .get("topics")
        .and_then(Value::as_array)
        .map(|topics| {
            topics
                .iter()
                .map(|topic| {
                    Hash32::parse(&hex_str(topic)?)
                        .map_err(|e| ServerError::InvalidResponse(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(LogEntry {
        address: parse_address_field(entry, "address")?,
        topics,
        data: entry
            .get("data")
            .map(|data| {
                hex::decode(hex_str(data)?)
                    .map_err(|e| ServerError::InvalidResponse(e.to_string()))
            })
            .transpose()?
            .unwrap_or_default(),
        block_height: entry
            .get("blockNumber")
            .map(hex_quantity_u64)
            .transpose()?
            .unwrap_or_default(),
        transaction_hash: entry
            .get("transactionHash")
            .map(|hash| {
                Hash32::parse(&hex_str(hash)?)
                    .map_err(|e| ServerError::InvalidResponse(e.to_string()))
            })
            .transpose()?
            .unwrap_or_default(),
    })
}

fn parse_address_field(entry: &Value, field: &str) -> Result<Address, ServerError> {
    let raw = entry
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::InvalidResponse(format!("missing {field}")))?;

    Address::parse(raw).map_err(|e| ServerError::InvalidResponse(e.to_string()))
}

fn hex_str(value: &Value) -> Result<String, ServerError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ServerError::InvalidResponse("expected hex string".to_string()))?;

    Ok(raw.strip_prefix("0x").unwrap_or(raw).to_string())
}

fn hex_quantity_u64(value: &Value) -> Result<u64, ServerError> {
    let digits = hex_str(value)?;

    u64::from_str_radix(&digits, 16)
        .map_err(|_| ServerError::InvalidResponse(format!("bad hex quantity {digits}")))
}

#[derive(Debug, Deserialize)]
struct IndexEnvelope {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
struct IndexRecord {
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
    hash: String,
    nonce: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    gas: String,
    #[serde(rename = "gasPrice")]
    gas_price: String,
    #[serde(default)]
    input: String,
}

async fn get_transaction_page(
    client: &ApiClient,
    request: &TransactionPageRequest,
) -> Result<Vec<Transaction>, ServerError> {
    let action = match request.asset {
        Asset::Native => "txlist",
        Asset::Erc20(_) => "tokentx",
    };
    let mut query: Vec<(&str, String)> = vec![
        ("module", "account".to_string()),
        ("action", action.to_string()),
        ("address", request.address.to_checksum_string()),
        ("startblock", request.start_block.to_string()),
        ("endblock", "latest".to_string()),
        ("page", request.page.to_string()),
        ("offset", request.offset.to_string()),
        ("sort", "asc".to_string()),
    ];
    if let Asset::Erc20(contract) = request.asset {
        query.push(("contractaddress", contract.to_checksum_string()));
    }
    if let Some(api_key) = &client.api_key {
        query.push(("apikey", api_key.clone()));
    }

    let envelope: IndexEnvelope = client
        .http
        .get(&client.index_url)
        .query(&query)
        .send()
        .await?
        .json()
        .await?;

    if envelope.status != "1" {
        if envelope.message.contains("No transactions found") {
            return Ok(Vec::new());
        }
        if envelope
            .result
            .as_str()
            .is_some_and(|result| result.contains("Invalid API Key"))
        {
            return Err(ServerError::InvalidApiKey);
        }
        return Err(ServerError::InvalidResponse(envelope.message));
    }

    let records: Vec<IndexRecord> = serde_json::from_value(envelope.result)
        .map_err(|e| ServerError::InvalidResponse(e.to_string()))?;

    records.iter().map(index_record_to_transaction).collect()
}

fn index_record_to_transaction(record: &IndexRecord) -> Result<Transaction, ServerError> {
    let invalid = |field: &str| ServerError::InvalidResponse(format!("bad index field {field}"));

    let to = if record.to.is_empty() {
        Address::default()
    } else {
        Address::parse(&record.to).map_err(|_| invalid("to"))?
    };
    let input = if record.input.starts_with("0x") {
        hex::decode(&record.input[2..]).map_err(|_| invalid("input"))?
    } else {
        Vec::new()
    };

    Ok(Transaction {
        hash: Hash32::parse(&record.hash).map_err(|_| invalid("hash"))?,
        nonce: record.nonce.parse().map_err(|_| invalid("nonce"))?,
        from: Address::parse(&record.from).map_err(|_| invalid("from"))?,
        to,
        value: BigUint::parse_bytes(record.value.as_bytes(), 10).ok_or_else(|| invalid("value"))?,
        gas_price: record.gas_price.parse().map_err(|_| invalid("gasPrice"))?,
        gas_limit: record.gas.parse().map_err(|_| invalid("gas"))?,
        input,
        timestamp: record.time_stamp.parse().map_err(|_| invalid("timeStamp"))?,
        block_height: Some(
            record
                .block_number
                .parse()
                .map_err(|_| invalid("blockNumber"))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{IndexRecord, hex_quantity_u64, index_record_to_transaction};

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(hex_quantity_u64(&json!("0x4f5a40")).unwrap(), 5_200_448);
        assert_eq!(hex_quantity_u64(&json!("0x0")).unwrap(), 0);
        assert!(hex_quantity_u64(&json!("0xzz")).is_err());
        assert!(hex_quantity_u64(&json!(12)).is_err());
    }

    #[test]
    fn converts_index_records() {
        let record: IndexRecord = serde_json::from_value(json!({
            "blockNumber": "5199999",
            "timeStamp": "1529971200",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "nonce": "4",
            "from": "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed",
            "to": "0x3535353535353535353535353535353535353535",
            "value": "1000000000000000000",
            "gas": "21000",
            "gasPrice": "20000000000",
            "input": "0x"
        }))
        .unwrap();

        let transaction = index_record_to_transaction(&record).unwrap();
        assert_eq!(transaction.block_height, Some(5_199_999));
        assert_eq!(transaction.nonce, 4);
        assert!(transaction.input.is_empty());
    }
}
