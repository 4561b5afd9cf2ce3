use crate::error::{CoordinatorError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEADER_LEN: usize = 10;

/// Encodes a payload as a 10-byte zero-padded decimal length header followed
/// by its JSON body.
pub fn encode_frame<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    if body.len() >= 10_usize.pow(HEADER_LEN as u32) {
        return Err(CoordinatorError::Protocol(format!(
            "payload of {} bytes does not fit a {}-digit length header",
            body.len(),
            HEADER_LEN
        )));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(format!("{:0width$}", body.len(), width = HEADER_LEN).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Writes a payload frame to `writer`.
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(payload)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads one frame as a raw JSON value. Returns `Ok(None)` for the "peer
/// closed" sentinel: the stream ended cleanly before any byte of a new frame
/// arrived. A close partway through a header or body is a protocol error,
/// not the clean-close sentinel.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if !fill_or_detect_close(reader, &mut header).await? {
        return Ok(None);
    }

    let header_str = std::str::from_utf8(&header)
        .map_err(|_| CoordinatorError::Protocol("non-utf8 length header".into()))?;
    let body_len: usize = header_str
        .trim()
        .parse()
        .map_err(|_| CoordinatorError::Protocol(format!("invalid length header: {header_str:?}")))?;

    let mut body = vec![0u8; body_len];
    if !fill_or_detect_close(reader, &mut body).await? {
        return Err(CoordinatorError::Protocol(
            "connection closed mid-frame".into(),
        ));
    }

    let value: Value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Reads and decodes one frame into `T` in one step.
pub async fn read_frame_as<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Fills `buf` completely, looping across partial reads (a normal case, not
/// an error). Returns `Ok(true)` if `buf` was filled, `Ok(false)` if the
/// stream closed before a single byte arrived.
async fn fill_or_detect_close<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CoordinatorError::Protocol(
                "connection closed mid-frame".into(),
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Serde helpers implementing the wire's datetime extension:
/// `{"__datetime__": <utc unix seconds>}`. Used via `#[serde(with = "...")]`
/// on individual fields rather than walking the JSON tree blindly, so a
/// legitimate info map that happens to contain the key `__datetime__` is
/// never misread.
pub mod datetime_ext {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::{json, Value};

    pub fn to_value(dt: &DateTime<Utc>) -> Value {
        json!({ "__datetime__": dt.timestamp() })
    }

    pub fn from_value(value: &Value) -> Option<DateTime<Utc>> {
        let secs = value.get("__datetime__")?.as_i64()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_value(dt).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        from_value(&value)
            .ok_or_else(|| DeError::custom("expected {\"__datetime__\": <seconds>}"))
    }

    pub mod option {
        use super::{from_value, to_value};
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use serde_json::Value;

        pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match dt {
                Some(dt) => to_value(dt).serialize(serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<Value>::deserialize(deserializer)? {
                None | Some(Value::Null) => Ok(None),
                Some(v) => Ok(from_value(&v)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timestamped {
        #[serde(with = "datetime_ext")]
        t: chrono::DateTime<chrono::Utc>,
    }

    /// encode_frame produces a header whose decimal value equals the body length.
    #[test]
    fn header_reports_body_length() {
        let payload = serde_json::json!({"command": "GET_STATUS"});
        let bytes = encode_frame(&payload).unwrap();
        let header = std::str::from_utf8(&bytes[..HEADER_LEN]).unwrap();
        let declared: usize = header.parse().unwrap();
        assert_eq!(declared, bytes.len() - HEADER_LEN);
    }

    /// write_frame then read_frame round-trips an arbitrary JSON value.
    #[tokio::test]
    async fn round_trip_value() {
        let payload = serde_json::json!({"command": "DONE_ID", "resourceinfo": {"k": "v"}});
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    /// datetime_ext round-trips through the `{"__datetime__": secs}` extension.
    #[tokio::test]
    async fn datetime_extension_round_trips() {
        let original = Timestamped {
            t: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &original).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let value = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(value["t"]["__datetime__"], original.t.timestamp());
        let decoded: Timestamped = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, original);
    }

    /// A clean close before any bytes arrive yields the peer-closed sentinel.
    #[tokio::test]
    async fn clean_close_before_header_is_sentinel() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    /// A close partway through the header is a protocol error, not the sentinel.
    #[tokio::test]
    async fn close_mid_header_is_error() {
        let mut cursor = Cursor::new(vec![b'0', b'0', b'0']);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
