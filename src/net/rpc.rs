//! Wire messages for peer-to-peer RPC and pubsub payloads.
//!
//! Pubsub messages carry a CBOR-encoded `PushLogRequest` directly; direct
//! RPC wraps the same request in the `RpcRequest` envelope. Both paths land
//! in the same push handler.

use serde::{Deserialize, Serialize};

use super::NetError;
use crate::dag::Cid;
use crate::events::Update;
use crate::keys::{DocKey, SchemaId};
use crate::peers::PeerId;

/// Push one commit block to a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushLogRequest {
    pub doc_key: DocKey,
    pub cid: Cid,
    pub schema_id: SchemaId,
    /// Peer that originally created the log.
    pub creator: PeerId,
    /// Raw encoded commit block.
    pub block: Vec<u8>,
}

impl PushLogRequest {
    pub fn from_update(update: &Update, creator: PeerId) -> Self {
        Self {
            doc_key: update.doc_key.clone(),
            cid: update.cid,
            schema_id: update.schema_id.clone(),
            creator,
            block: update.block.clone(),
        }
    }
}

/// Empty reply; errors travel as RPC status.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushLogReply {}

// Reserved anti-entropy surface. Declared so the wire protocol is stable;
// handlers return empty replies.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetDocGraphRequest {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetDocGraphReply {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushDocGraphRequest {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushDocGraphReply {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetLogRequest {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetLogReply {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetHeadLogRequest {}
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetHeadLogReply {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    PushLog(PushLogRequest),
    GetDocGraph(GetDocGraphRequest),
    PushDocGraph(PushDocGraphRequest),
    GetLog(GetLogRequest),
    GetHeadLog(GetHeadLogRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcReply {
    PushLog(PushLogReply),
    GetDocGraph(GetDocGraphReply),
    PushDocGraph(PushDocGraphReply),
    GetLog(GetLogReply),
    GetHeadLog(GetHeadLogReply),
}

pub(crate) fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>, NetError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| NetError::WireEncode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, NetError> {
    ciborium::from_reader(data).map_err(|e| NetError::WireDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_log_request_round_trips_through_the_wire() {
        let req = PushLogRequest {
            doc_key: DocKey::from_string("doc-1"),
            cid: Cid::from_content(b"block"),
            schema_id: "schema-1".into(),
            creator: PeerId::random(),
            block: b"raw block".to_vec(),
        };
        let wire = encode_message(&RpcRequest::PushLog(req.clone())).unwrap();
        let decoded: RpcRequest = decode_message(&wire).unwrap();
        match decoded {
            RpcRequest::PushLog(got) => {
                assert_eq!(got.doc_key, req.doc_key);
                assert_eq!(got.cid, req.cid);
                assert_eq!(got.block, req.block);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
