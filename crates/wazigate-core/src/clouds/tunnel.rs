// Remote tunnel frames carried over the cloud MQTT session.
//
// Request:  method | uri | headers (JSON) | body, each with a 3-byte
//           big-endian length prefix.
// Response: 2-byte big-endian status, then headers (JSON) and body with
//           3-byte length prefixes.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::bridge::{Request, Response};
use crate::error::CoreError;

const MAX_FIELD: usize = 0x00FF_FFFF;

pub const TUNNEL_DOWN: &str = "tunnel-down";
pub const TUNNEL_UP: &str = "tunnel-up";

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn field(&mut self, name: &str) -> Result<&'a [u8], CoreError> {
        let Some((len, rest)) = self.buf.split_first_chunk::<3>() else {
            return Err(CoreError::validation(format!("tunnel frame: missing {name} length")));
        };
        let len = usize::from(len[0]) << 16 | usize::from(len[1]) << 8 | usize::from(len[2]);
        if rest.len() < len {
            return Err(CoreError::validation(format!(
                "tunnel frame: {name} needs {len} bytes, {} left",
                rest.len()
            )));
        }
        let (field, rest) = rest.split_at(len);
        self.buf = rest;
        Ok(field)
    }

    fn text(&mut self, name: &str) -> Result<String, CoreError> {
        let raw = self.field(name)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::validation(format!("tunnel frame: {name} is not UTF-8")))
    }
}

/// Parse a tunnel request frame.
pub fn decode_request(frame: &[u8]) -> Result<Request, CoreError> {
    let mut reader = Reader { buf: frame };
    let method = reader.text("method")?;
    let uri = reader.text("uri")?;
    let raw_headers = reader.field("headers")?;
    let headers: BTreeMap<String, Vec<String>> = if raw_headers.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_slice(raw_headers)?
    };
    let body = Bytes::copy_from_slice(reader.field("body")?);

    Ok(Request {
        method,
        uri,
        headers,
        body,
        remote: None,
    })
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    let len = field.len().min(MAX_FIELD);
    let [_, a, b, c] = u32::try_from(len).unwrap_or(0).to_be_bytes();
    buf.put_slice(&[a, b, c]);
    buf.put_slice(&field[..len]);
}

/// Build a tunnel response frame. Fields longer than 16 MiB are cut.
pub fn encode_response(response: &Response) -> Bytes {
    let headers = serde_json::to_vec(&response.headers).unwrap_or_else(|_| b"{}".to_vec());
    let mut buf = BytesMut::with_capacity(2 + 3 + headers.len() + 3 + response.body.len());
    buf.put_u16(response.status);
    put_field(&mut buf, &headers);
    put_field(&mut buf, &response.body);
    buf.freeze()
}

/// Last topic segment of a `.../tunnel-down/{ref}` topic.
pub fn reference(topic: &str) -> Option<&str> {
    let (prefix, reference) = topic.rsplit_once('/')?;
    prefix
        .ends_with(TUNNEL_DOWN)
        .then_some(reference)
        .filter(|r| !r.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(fields: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for field in fields {
            put_field(&mut buf, field);
        }
        buf.to_vec()
    }

    #[test]
    fn request_frame_is_decoded() {
        let raw = frame(&[
            b"POST",
            b"/devices/d1/sensors/s1/value",
            br#"{"Content-Type":["application/json"]}"#,
            b"21.5",
        ]);
        let req = decode_request(&raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/devices/d1/sensors/s1/value");
        assert_eq!(
            req.headers.get("Content-Type"),
            Some(&vec!["application/json".to_owned()])
        );
        assert_eq!(&req.body[..], b"21.5");
    }

    #[test]
    fn empty_header_field_is_allowed() {
        let req = decode_request(&frame(&[b"GET", b"/devices", b"", b""])).unwrap();
        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut raw = frame(&[b"GET", b"/devices", b"{}", b"body"]);
        raw.truncate(raw.len() - 2);
        assert_eq!(decode_request(&raw).unwrap_err().code(), 400);
        assert!(decode_request(&[0, 0]).is_err());
    }

    #[test]
    fn response_frame_layout() {
        let mut headers = BTreeMap::new();
        headers.insert("X".to_owned(), vec!["1".to_owned()]);
        let encoded = encode_response(&Response {
            status: 201,
            headers,
            body: Bytes::from_static(b"ok"),
        });
        let json = br#"{"X":["1"]}"#;
        let mut expected = vec![0, 201, 0, 0, u8::try_from(json.len()).unwrap()];
        expected.extend_from_slice(json);
        expected.extend_from_slice(&[0, 0, 2]);
        expected.extend_from_slice(b"ok");
        assert_eq!(encoded.to_vec(), expected);
    }

    #[test]
    fn reference_is_last_segment() {
        assert_eq!(reference("devices/gw/tunnel-down/42"), Some("42"));
        assert_eq!(reference("devices/gw/tunnel-down/"), None);
        assert_eq!(reference("devices/gw/actuators/a/value"), None);
    }
}
