//! JSON-RPC server over a Unix domain socket.
//!
//! Listens on a Unix socket, accepts connections, and dispatches line-delimited
//! JSON-RPC requests to the [`Dht`] handle shared by the process. Method names
//! mirror the API exposed upward per the external interfaces the DHT core
//! supports: friend tracking, bootstrap, routing, and persistence.

use std::path::PathBuf;
use std::sync::Arc;

use dht_core::FriendIpResult;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::NodeState;

/// JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// JSON-RPC success/error response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    pub fn error(id: serde_json::Value, error: RpcError) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: None, error: Some(error) }
    }
}

impl RpcError {
    pub fn parse_error() -> Self {
        Self { code: -32700, message: "PARSE_ERROR".to_string(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: "METHOD_NOT_FOUND".to_string(),
            data: Some(serde_json::json!({"method": method})),
        }
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self {
            code: -32602,
            message: "INVALID_PARAMS".to_string(),
            data: Some(serde_json::json!({"detail": detail})),
        }
    }

    pub fn internal_error(detail: &str) -> Self {
        Self {
            code: -32603,
            message: "INTERNAL_ERROR".to_string(),
            data: Some(serde_json::json!({"detail": detail})),
        }
    }
}

/// The RPC server.
pub struct RpcServer {
    state: Arc<NodeState>,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(state: Arc<NodeState>, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("RPC server listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            warn!("RPC connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("RPC accept error: {}", e),
            }
        }
    }
}

async fn handle_connection(state: Arc<NodeState>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => dispatch(&state, request).await,
            Err(_) => RpcResponse::error(serde_json::Value::Null, RpcError::parse_error()),
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn dispatch(state: &Arc<NodeState>, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    let method = request.method.as_str();
    debug!("dispatching RPC method: {}", method);

    let result = match method {
        "add_friend" => add_friend(state, &request.params).await,
        "del_friend" => del_friend(state, &request.params).await,
        "getfriendip" => getfriendip(state, &request.params).await,
        "bootstrap" => bootstrap(state, &request.params).await,
        "bootstrap_from_address" => bootstrap_from_address(state, &request.params).await,
        "route_to_friend" => route_to_friend(state, &request.params).await,
        "ipport_self_copy" => ipport_self_copy(state).await,
        "size" => size(state).await,
        "save_now" => save_now(state).await,
        _ => Err(RpcError::method_not_found(method)),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(err) => RpcResponse::error(id, err),
    }
}

fn parse_key(s: &str) -> Result<[u8; 32], RpcError> {
    let bytes = hex::decode(s).map_err(|_| RpcError::invalid_params("key must be hex"))?;
    bytes
        .try_into()
        .map_err(|_| RpcError::invalid_params("key must be 32 bytes"))
}

async fn add_friend(state: &Arc<NodeState>, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing public_key"))?;
    let key = parse_key(key_hex)?;

    let events = state.events.clone();
    let on_ip_found = Box::new(move |ep: dht_core::wire::IpPort| {
        crate::events::friend_ip_found(&events, crate::unix_now(), &key, ep.addr.ip(), ep.addr.port());
    });

    let mut dht = state.dht.lock().await;
    let lock_id = dht
        .add_friend(key, Some(on_ip_found))
        .map_err(|e| RpcError::internal_error(&e.to_string()))?;
    Ok(serde_json::json!({ "lock_id": lock_id }))
}

async fn del_friend(state: &Arc<NodeState>, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing public_key"))?;
    let key = parse_key(key_hex)?;
    let lock_id = params
        .get("lock_id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("missing lock_id"))? as u32;

    let mut dht = state.dht.lock().await;
    dht.del_friend(&key, lock_id)
        .map_err(|e| RpcError::internal_error(&e.to_string()))?;
    Ok(serde_json::json!(true))
}

async fn getfriendip(state: &Arc<NodeState>, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing public_key"))?;
    let key = parse_key(key_hex)?;

    let dht = state.dht.lock().await;
    let result = match dht.getfriendip(&key) {
        FriendIpResult::NotAFriend => serde_json::json!({ "status": "not_a_friend" }),
        FriendIpResult::NotFoundYet => serde_json::json!({ "status": "not_found_yet" }),
        FriendIpResult::Found(ep) => serde_json::json!({
            "status": "found",
            "ip": ep.addr.ip().to_string(),
            "port": ep.addr.port(),
        }),
    };
    Ok(result)
}

async fn bootstrap(state: &Arc<NodeState>, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing public_key"))?;
    let key = parse_key(key_hex)?;
    let addr: std::net::SocketAddr = params
        .get("addr")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing addr"))?
        .parse()
        .map_err(|_| RpcError::invalid_params("addr must be host:port"))?;

    let mut dht = state.dht.lock().await;
    dht.bootstrap(key, dht_core::wire::IpPort::udp(addr));
    Ok(serde_json::json!(true))
}

async fn bootstrap_from_address(
    state: &Arc<NodeState>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing public_key"))?;
    let key = parse_key(key_hex)?;
    let host = params
        .get("host")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing host"))?;
    let port = params
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params("missing port"))? as u16;
    let ipv6_enabled = params.get("ipv6_enabled").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut dht = state.dht.lock().await;
    dht.bootstrap_from_address(host, ipv6_enabled, port, key)
        .map_err(|e| RpcError::internal_error(&e.to_string()))?;
    Ok(serde_json::json!(true))
}

async fn route_to_friend(state: &Arc<NodeState>, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let key_hex = params
        .get("friend_public_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing friend_public_key"))?;
    let key = parse_key(key_hex)?;
    let payload_hex = params
        .get("payload")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing payload"))?;
    let payload = hex::decode(payload_hex).map_err(|_| RpcError::invalid_params("payload must be hex"))?;

    let mut dht = state.dht.lock().await;
    let sent = dht.route_to_friend(&key, &payload);
    Ok(serde_json::json!({ "recipients": sent.len() }))
}

async fn ipport_self_copy(state: &Arc<NodeState>) -> Result<serde_json::Value, RpcError> {
    let dht = state.dht.lock().await;
    let kind = match dht.ipport_self_copy() {
        dht_core::SelfAddressKind::Unknown => "unknown",
        dht_core::SelfAddressKind::Wan => "wan",
        dht_core::SelfAddressKind::Lan => "lan",
    };
    Ok(serde_json::json!({ "kind": kind }))
}

async fn size(state: &Arc<NodeState>) -> Result<serde_json::Value, RpcError> {
    let dht = state.dht.lock().await;
    Ok(serde_json::json!({ "size": dht.size() }))
}

async fn save_now(state: &Arc<NodeState>) -> Result<serde_json::Value, RpcError> {
    let dht = state.dht.lock().await;
    let data = dht.save();
    let path = state.config.save_path();
    std::fs::write(&path, &data).map_err(|e| RpcError::internal_error(&e.to_string()))?;
    Ok(serde_json::json!({ "bytes": data.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_codes() {
        let err = RpcError::method_not_found("frobnicate");
        assert_eq!(err.code, -32601);
        let err = RpcError::invalid_params("bad key");
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn test_rpc_response_success_and_error() {
        let ok = RpcResponse::success(serde_json::json!(1), serde_json::json!({"size": 3}));
        assert!(ok.result.is_some());
        assert!(ok.error.is_none());

        let err = RpcResponse::error(serde_json::json!(1), RpcError::internal_error("boom"));
        assert!(err.result.is_none());
        assert!(err.error.is_some());
    }

    #[test]
    fn test_parse_key_rejects_wrong_length() {
        assert!(parse_key("aabb").is_err());
        assert!(parse_key(&"00".repeat(32)).is_ok());
    }
}
