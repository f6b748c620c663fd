//! CBOR framing of protocol messages.
//!
//! A frame is one CBOR map: the message's own fields plus an integer `_tag`
//! entry naming the message kind. Decoding reads `_tag` first and then
//! deserializes the remaining entries as that kind.

use bytes::Bytes;
use ciborium::value::{Integer, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::messages::{Msg, Tag};

/// Name of the discriminant entry.
pub const TAG_KEY: &str = "_tag";

/// Encode a message into a frame.
pub fn encode(msg: &Msg) -> Result<Bytes> {
    let body = match msg {
        Msg::ApplyChanges(m) => to_value(m)?,
        Msg::GetChanges(m) => to_value(m)?,
        Msg::EstablishOutboundStream(m) => to_value(m)?,
        Msg::AckChanges(m) => to_value(m)?,
        Msg::ReceiveStreamingChanges(m) => to_value(m)?,
        Msg::ApplyChangesResponse(m) => to_value(m)?,
    };

    let mut entries = body
        .into_map()
        .map_err(|_| SyncError::Codec("message body is not a map".into()))?;
    entries.insert(
        0,
        (
            Value::Text(TAG_KEY.to_string()),
            Value::Integer(Integer::from(msg.tag().to_u8())),
        ),
    );

    let mut buf = Vec::new();
    ciborium::into_writer(&Value::Map(entries), &mut buf)
        .map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a frame into a message.
pub fn decode(frame: &[u8]) -> Result<Msg> {
    let value: Value =
        ciborium::from_reader(frame).map_err(|e| SyncError::Codec(e.to_string()))?;
    let entries = value
        .into_map()
        .map_err(|_| SyncError::Codec("frame is not a map".into()))?;

    let mut tag = None;
    let mut fields = Vec::with_capacity(entries.len());
    for (key, val) in entries {
        if key.as_text() == Some(TAG_KEY) {
            tag = Some(val);
        } else {
            fields.push((key, val));
        }
    }

    let tag = tag.ok_or_else(|| SyncError::Codec("missing _tag".into()))?;
    let tag = tag
        .as_integer()
        .and_then(|i| u8::try_from(i).ok())
        .and_then(Tag::from_u8)
        .ok_or_else(|| SyncError::Codec(format!("unknown _tag: {:?}", tag)))?;

    let body = Value::Map(fields);
    Ok(match tag {
        Tag::ApplyChanges => Msg::ApplyChanges(from_value(body)?),
        Tag::GetChanges => Msg::GetChanges(from_value(body)?),
        Tag::EstablishOutboundStream => Msg::EstablishOutboundStream(from_value(body)?),
        Tag::AckChanges => Msg::AckChanges(from_value(body)?),
        Tag::ReceiveStreamingChanges => Msg::ReceiveStreamingChanges(from_value(body)?),
        Tag::ApplyChangesResponse => Msg::ApplyChangesResponse(from_value(body)?),
    })
}

fn to_value<T: Serialize>(msg: &T) -> Result<Value> {
    Value::serialized(msg).map_err(|e| SyncError::Codec(e.to_string()))
}

fn from_value<T: DeserializeOwned>(body: Value) -> Result<T> {
    body.deserialized()
        .map_err(|e| SyncError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use rowsync_core::{
        ClientServerChange, ColumnValue, DbId, PeerChange, QueryId, Seq, WireChange,
    };

    fn tag_of(frame: &[u8]) -> Value {
        let value: Value = ciborium::from_reader(frame).unwrap();
        value
            .into_map()
            .unwrap()
            .into_iter()
            .find(|(k, _)| k.as_text() == Some(TAG_KEY))
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn test_frame_carries_integer_tag() {
        let msg = Msg::AckChanges(AckChangesMsg { seq_end: Seq(10, 2) });
        let frame = encode(&msg).unwrap();
        assert_eq!(tag_of(&frame), Value::Integer(Integer::from(3u8)));
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_apply_changes_with_both_change_shapes() {
        let site = DbId::from_bytes([9; 16]);
        let msg = Msg::ApplyChanges(ApplyChangesMsg {
            to_dbid: DbId::from_bytes([1; 16]),
            from_dbid: DbId::from_bytes([2; 16]),
            schema_version: "7".into(),
            seq_start: Seq(4, 0),
            changes: vec![
                WireChange::ClientServer(ClientServerChange {
                    table: "todo".into(),
                    pk: "1".into(),
                    cid: "title".into(),
                    val: ColumnValue::Text("milk".into()),
                    col_version: 2,
                    db_version: 4,
                }),
                WireChange::Peer(PeerChange {
                    table: "todo".into(),
                    pk: "'x'".into(),
                    cid: "blob".into(),
                    val: ColumnValue::Blob(vec![0, 255]),
                    col_version: 1,
                    db_version: 4,
                    site_id: site,
                }),
            ],
        });

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_optional_query_ids() {
        let msg = Msg::GetChanges(GetChangesMsg {
            dbid: DbId::ZERO,
            since: Seq::ZERO,
            schema_version: "1".into(),
            query_ids: Some(vec![QueryId::new("open-todos")]),
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let frame = {
            let map = Value::Map(vec![(
                Value::Text(TAG_KEY.into()),
                Value::Integer(Integer::from(42u8)),
            )]);
            let mut buf = Vec::new();
            ciborium::into_writer(&map, &mut buf).unwrap();
            buf
        };
        assert!(matches!(decode(&frame), Err(SyncError::Codec(_))));
    }

    #[test]
    fn test_rejects_missing_tag_and_garbage() {
        let mut buf = Vec::new();
        ciborium::into_writer(&Value::Map(vec![]), &mut buf).unwrap();
        assert!(matches!(decode(&buf), Err(SyncError::Codec(_))));
        assert!(matches!(decode(&[0xff, 0x00]), Err(SyncError::Codec(_))));
    }

    #[test]
    fn test_response_status_round_trip() {
        let msg = Msg::ApplyChangesResponse(ApplyChangesResponse {
            status: ApplyStatus::OutOfOrder,
            last_applied: Some(Seq(5, 0)),
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_decode_never_panics(frame in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode(&frame);
            }

            #[test]
            fn prop_ack_frames_keep_their_position(v in 0u64..1 << 40, s in any::<u32>()) {
                let msg = Msg::AckChanges(AckChangesMsg { seq_end: Seq(v, s) });
                prop_assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
            }
        }
    }
}
