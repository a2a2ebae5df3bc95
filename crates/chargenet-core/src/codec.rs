//! Envelope wire codec
//!
//! JSON envelopes travel in text frames as a positional array, binary envelopes in
//! binary frames with a fixed-order big-endian layout:
//!
//! ```text
//! [2, requestId, destination, networkPath, action, payload, meta]
//! [3, requestId, destination, networkPath, payload, meta]
//! [4|5, requestId, destination, networkPath, errorCode, description, details, meta]
//!
//! u8 type | str16 requestId | str16 destination | u8 hops, str16 × hops
//! request:  str16 action | u64 timestamp | u32 timeoutMs
//! response: u64 timestamp | u8 result
//! u32 payloadLength, payload | u8 signatures, (str16 keyId | str8 algorithm | u16 len, value) × n
//! ```
//!
//! Encoding is canonical: JSON objects are emitted with sorted keys and no
//! whitespace, so re-encoding a decoded envelope reproduces the same bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use core::time::Duration;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::envelope::{
    Action, BinaryRequest, BinaryResponse, Envelope, ErrorInfo, Header, JsonRequest,
    JsonRequestError, JsonResponse, JsonResponseError, MessageTypeId, Signature,
    SignatureAlgorithm, DEFAULT_REQUEST_TIMEOUT,
};
use crate::errors::FormationError;
use crate::outcome::{ErrorCode, ResultCode};
use crate::types::{NetworkPath, NodeId, RequestId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Domain separation tag mixed into every signing digest
pub const SIGNING_CONTEXT: &[u8] = b"chargenet-envelope-v1";

/// Largest frame accepted by default (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One transport-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Envelope Codec
// ----------------------------------------------------------------------------

/// Encodes and decodes envelopes to and from frames
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Encode an envelope into the frame kind it travels in
    pub fn encode(envelope: &Envelope) -> Result<Frame, FormationError> {
        match envelope {
            Envelope::BinaryRequest(_) | Envelope::BinaryResponse(_) => {
                Ok(Frame::Binary(encode_binary(envelope)?))
            }
            _ => Ok(Frame::Text(encode_json(envelope)?.to_string())),
        }
    }

    /// Decode a frame without a size limit
    pub fn decode(frame: &Frame) -> Result<Envelope, FormationError> {
        match frame {
            Frame::Text(text) => Self::decode_text(text),
            Frame::Binary(bytes) => Self::decode_binary(bytes),
        }
    }

    /// Decode a frame, refusing anything larger than `max_frame_size`
    pub fn decode_with_limit(frame: &Frame, max_frame_size: usize) -> Result<Envelope, FormationError> {
        if frame.len() > max_frame_size {
            return Err(FormationError::FrameTooLarge {
                size: frame.len(),
                max: max_frame_size,
            });
        }
        Self::decode(frame)
    }

    pub fn decode_text(text: &str) -> Result<Envelope, FormationError> {
        if text.trim().is_empty() {
            return Err(FormationError::EmptyFrame);
        }
        let value: Value = serde_json::from_str(text).map_err(|e| FormationError::InvalidJson {
            reason: e.to_string(),
        })?;
        decode_json(&value)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Envelope, FormationError> {
        if bytes.is_empty() {
            return Err(FormationError::EmptyFrame);
        }
        let mut reader = ByteReader::new(bytes);
        let envelope = decode_binary_fields(&mut reader)?;
        reader.finish()?;
        Ok(envelope)
    }

    /// Best-effort extraction of the request id from a frame that failed to decode,
    /// so the sender can still be told about the formation violation
    pub fn peek_request_id(frame: &Frame) -> Option<RequestId> {
        match frame {
            Frame::Text(text) => {
                let value: Value = serde_json::from_str(text).ok()?;
                let id = value.as_array()?.get(1)?.as_str()?;
                RequestId::new(id).ok()
            }
            Frame::Binary(bytes) => {
                let mut reader = ByteReader::new(bytes);
                reader.u8("messageTypeId").ok()?;
                RequestId::new(reader.str16("requestId").ok()?).ok()
            }
        }
    }

    /// Bytes covered by signatures
    ///
    /// Excludes the signature list, the request id, the network path and the timeout
    /// budget. Relays change all of them while a message is in flight: a request id
    /// only names the call on one connection.
    pub fn canonical_bytes(envelope: &Envelope) -> Result<Vec<u8>, FormationError> {
        let mut unsigned = envelope.clone();
        {
            let header = unsigned.header_mut();
            header.signatures.clear();
            header.request_id = RequestId::blank();
            header.network_path = NetworkPath::empty();
        }
        unsigned.set_timeout(Duration::ZERO);

        let mut bytes = SIGNING_CONTEXT.to_vec();
        match Self::encode(&unsigned)? {
            Frame::Text(text) => bytes.extend_from_slice(text.as_bytes()),
            Frame::Binary(binary) => bytes.extend_from_slice(&binary),
        }
        Ok(bytes)
    }

    /// SHA-256 digest of the canonical bytes
    pub fn signing_digest(envelope: &Envelope) -> Result<[u8; 32], FormationError> {
        let mut hasher = Sha256::new();
        hasher.update(Self::canonical_bytes(envelope)?);
        Ok(hasher.finalize().into())
    }
}

// ----------------------------------------------------------------------------
// JSON Encoding
// ----------------------------------------------------------------------------

/// Peers only accept object payloads, so nothing else is written
fn object_payload(payload: &Value) -> Result<Value, FormationError> {
    if !payload.is_object() {
        return Err(FormationError::invalid_field("payload", "expected an object"));
    }
    Ok(payload.clone())
}

fn encode_json(envelope: &Envelope) -> Result<Value, FormationError> {
    let header = envelope.header();
    let type_id = envelope.message_type().as_u8();
    let path: Vec<Value> = header
        .network_path
        .iter()
        .map(|hop| Value::String(hop.as_str().to_string()))
        .collect();

    let mut items = vec![
        json!(type_id),
        json!(header.request_id.as_str()),
        json!(header.destination.as_str()),
        Value::Array(path),
    ];

    match envelope {
        Envelope::JsonRequest(m) => {
            items.push(json!(m.action.as_str()));
            items.push(object_payload(&m.payload)?);
            items.push(encode_meta(header, Some(m.timeout), None));
        }
        Envelope::JsonResponse(m) => {
            items.push(object_payload(&m.payload)?);
            items.push(encode_meta(header, None, Some(m.result)));
        }
        Envelope::JsonRequestError(JsonRequestError { error, .. })
        | Envelope::JsonResponseError(JsonResponseError { error, .. }) => {
            items.push(json!(error.code.as_str()));
            items.push(json!(error.description));
            items.push(error.details.clone());
            items.push(encode_meta(header, None, None));
        }
        Envelope::BinaryRequest(_) | Envelope::BinaryResponse(_) => {
            return Err(FormationError::WrongFrameKind {
                message_type: type_id,
                frame: "text",
            })
        }
    }

    Ok(Value::Array(items))
}

fn encode_meta(header: &Header, timeout: Option<Duration>, result: Option<ResultCode>) -> Value {
    let mut meta = Map::new();
    meta.insert("timestamp".into(), json!(header.timestamp.as_millis()));
    if let Some(timeout) = timeout {
        meta.insert("timeoutMs".into(), json!(timeout.as_millis() as u64));
    }
    if let Some(result) = result {
        if result != ResultCode::Ok {
            meta.insert("result".into(), json!(result.as_str()));
        }
    }
    if !header.signatures.is_empty() {
        let signatures = header
            .signatures
            .iter()
            .map(|s| {
                json!({
                    "keyId": s.key_id,
                    "algorithm": s.algorithm.as_str(),
                    "value": BASE64.encode(&s.value),
                })
            })
            .collect();
        meta.insert("signatures".into(), Value::Array(signatures));
    }
    Value::Object(meta)
}

// ----------------------------------------------------------------------------
// JSON Decoding
// ----------------------------------------------------------------------------

struct JsonFields<'a> {
    items: &'a [Value],
    pos: usize,
}

impl<'a> JsonFields<'a> {
    fn next(&mut self, field: &'static str) -> Result<&'a Value, FormationError> {
        let value = self
            .items
            .get(self.pos)
            .ok_or(FormationError::MissingField { field })?;
        self.pos += 1;
        Ok(value)
    }

    fn string(&mut self, field: &'static str) -> Result<&'a str, FormationError> {
        self.next(field)?
            .as_str()
            .ok_or_else(|| FormationError::invalid_field(field, "expected a string"))
    }

    fn object(&mut self, field: &'static str) -> Result<Value, FormationError> {
        let value = self.next(field)?;
        if !value.is_object() {
            return Err(FormationError::invalid_field(field, "expected an object"));
        }
        Ok(value.clone())
    }

    fn optional(&mut self) -> Option<&'a Value> {
        let value = self.items.get(self.pos);
        if value.is_some() {
            self.pos += 1;
        }
        value
    }

    fn finish(&self) -> Result<(), FormationError> {
        if self.pos < self.items.len() {
            return Err(FormationError::invalid_field(
                "frame",
                format!("{} unexpected trailing elements", self.items.len() - self.pos),
            ));
        }
        Ok(())
    }
}

struct Meta {
    timestamp: Timestamp,
    timeout: Duration,
    result: ResultCode,
    signatures: Vec<Signature>,
}

fn decode_json(value: &Value) -> Result<Envelope, FormationError> {
    let items = value
        .as_array()
        .ok_or_else(|| FormationError::invalid_field("frame", "expected a JSON array"))?;
    let type_id = items
        .first()
        .ok_or(FormationError::MissingField {
            field: "messageTypeId",
        })?
        .as_u64()
        .ok_or_else(|| FormationError::invalid_field("messageTypeId", "expected an integer"))?;
    let message_type = MessageTypeId::from_u64(type_id)?;

    let mut fields = JsonFields { items, pos: 1 };
    let request_id = RequestId::new(fields.string("requestId")?)?;
    let destination = NodeId::new(fields.string("destination")?)?;
    let network_path = decode_json_path(fields.next("networkPath")?)?;

    let mut header = Header {
        request_id,
        destination,
        network_path,
        timestamp: Timestamp::default(),
        signatures: Vec::new(),
    };

    let envelope = match message_type {
        MessageTypeId::Request => {
            let action = Action::new(fields.string("action")?)?;
            let payload = fields.object("payload")?;
            let meta = decode_meta(fields.optional())?;
            apply_meta(&mut header, &meta);
            Envelope::JsonRequest(JsonRequest {
                header,
                action,
                payload,
                timeout: meta.timeout,
            })
        }
        MessageTypeId::Response => {
            let payload = fields.object("payload")?;
            let meta = decode_meta(fields.optional())?;
            apply_meta(&mut header, &meta);
            Envelope::JsonResponse(JsonResponse {
                header,
                payload,
                result: meta.result,
            })
        }
        MessageTypeId::RequestError | MessageTypeId::ResponseError => {
            let code = ErrorCode::parse(fields.string("errorCode")?);
            let description = fields.string("errorDescription")?.to_string();
            let details = fields.next("errorDetails")?.clone();
            let meta = decode_meta(fields.optional())?;
            apply_meta(&mut header, &meta);
            let error = ErrorInfo {
                code,
                description,
                details,
            };
            if message_type == MessageTypeId::RequestError {
                Envelope::JsonRequestError(JsonRequestError { header, error })
            } else {
                Envelope::JsonResponseError(JsonResponseError { header, error })
            }
        }
    };

    fields.finish()?;
    Ok(envelope)
}

fn decode_json_path(value: &Value) -> Result<NetworkPath, FormationError> {
    let hops = value
        .as_array()
        .ok_or_else(|| FormationError::invalid_field("networkPath", "expected an array"))?;
    hops.iter()
        .map(|hop| {
            hop.as_str()
                .ok_or_else(|| FormationError::invalid_field("networkPath", "hops must be strings"))
                .and_then(NodeId::new)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(NetworkPath::from_hops)
}

fn apply_meta(header: &mut Header, meta: &Meta) {
    header.timestamp = meta.timestamp;
    header.signatures = meta.signatures.clone();
}

fn decode_meta(value: Option<&Value>) -> Result<Meta, FormationError> {
    let mut meta = Meta {
        timestamp: Timestamp::default(),
        timeout: DEFAULT_REQUEST_TIMEOUT,
        result: ResultCode::Ok,
        signatures: Vec::new(),
    };
    let object = match value {
        None => return Ok(meta),
        Some(value) => value
            .as_object()
            .ok_or_else(|| FormationError::invalid_field("meta", "expected an object"))?,
    };

    if let Some(timestamp) = object.get("timestamp") {
        let millis = timestamp
            .as_u64()
            .ok_or_else(|| FormationError::invalid_field("timestamp", "expected an integer"))?;
        meta.timestamp = Timestamp::new(millis);
    }
    if let Some(timeout) = object.get("timeoutMs") {
        let millis = timeout
            .as_u64()
            .ok_or_else(|| FormationError::invalid_field("timeoutMs", "expected an integer"))?;
        meta.timeout = Duration::from_millis(millis);
    }
    if let Some(result) = object.get("result") {
        meta.result = result
            .as_str()
            .ok_or_else(|| FormationError::invalid_field("result", "expected a string"))?
            .parse()?;
    }
    if let Some(signatures) = object.get("signatures") {
        let list = signatures
            .as_array()
            .ok_or_else(|| FormationError::invalid_field("signatures", "expected an array"))?;
        for entry in list {
            meta.signatures.push(decode_json_signature(entry)?);
        }
    }
    Ok(meta)
}

fn decode_json_signature(value: &Value) -> Result<Signature, FormationError> {
    let field = |name: &'static str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| FormationError::invalid_field("signatures", format!("missing {}", name)))
    };
    let key_id = field("keyId")?;
    let algorithm = SignatureAlgorithm::parse(field("algorithm")?);
    let signature = BASE64
        .decode(field("value")?)
        .map_err(|e| FormationError::invalid_field("signatures", e.to_string()))?;
    Ok(Signature::new(key_id, algorithm, signature))
}

// ----------------------------------------------------------------------------
// Binary Encoding
// ----------------------------------------------------------------------------

fn put_str16(bytes: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), FormationError> {
    put_bytes16(bytes, field, value.as_bytes())
}

fn put_bytes16(bytes: &mut Vec<u8>, field: &'static str, value: &[u8]) -> Result<(), FormationError> {
    let len = u16::try_from(value.len())
        .map_err(|_| FormationError::invalid_field(field, "longer than 65535 bytes"))?;
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(value);
    Ok(())
}

fn put_str8(bytes: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), FormationError> {
    let len = u8::try_from(value.len())
        .map_err(|_| FormationError::invalid_field(field, "longer than 255 bytes"))?;
    bytes.push(len);
    bytes.extend_from_slice(value.as_bytes());
    Ok(())
}

fn encode_binary(envelope: &Envelope) -> Result<Vec<u8>, FormationError> {
    let header = envelope.header();
    let mut bytes = Vec::with_capacity(64);

    // Discriminant (1 byte)
    bytes.push(envelope.message_type().as_u8());

    put_str16(&mut bytes, "requestId", header.request_id.as_str())?;
    put_str16(&mut bytes, "destination", header.destination.as_str())?;

    let hops = u8::try_from(header.network_path.len())
        .map_err(|_| FormationError::invalid_field("networkPath", "more than 255 hops"))?;
    bytes.push(hops);
    for hop in header.network_path.iter() {
        put_str16(&mut bytes, "networkPath", hop.as_str())?;
    }

    let payload = match envelope {
        Envelope::BinaryRequest(m) => {
            put_str16(&mut bytes, "action", m.action.as_str())?;
            bytes.extend_from_slice(&header.timestamp.as_millis().to_be_bytes());
            let timeout = u32::try_from(m.timeout.as_millis())
                .map_err(|_| FormationError::invalid_field("timeoutMs", "exceeds u32 range"))?;
            bytes.extend_from_slice(&timeout.to_be_bytes());
            &m.payload
        }
        Envelope::BinaryResponse(m) => {
            bytes.extend_from_slice(&header.timestamp.as_millis().to_be_bytes());
            bytes.push(m.result.as_u8());
            &m.payload
        }
        _ => {
            return Err(FormationError::WrongFrameKind {
                message_type: envelope.message_type().as_u8(),
                frame: "binary",
            })
        }
    };

    let payload_len = u32::try_from(payload.len())
        .map_err(|_| FormationError::invalid_field("payload", "larger than 4 GiB"))?;
    bytes.extend_from_slice(&payload_len.to_be_bytes());
    bytes.extend_from_slice(payload);

    let signature_count = u8::try_from(header.signatures.len())
        .map_err(|_| FormationError::invalid_field("signatures", "more than 255 signatures"))?;
    bytes.push(signature_count);
    for signature in &header.signatures {
        put_str16(&mut bytes, "keyId", &signature.key_id)?;
        put_str8(&mut bytes, "algorithm", signature.algorithm.as_str())?;
        put_bytes16(&mut bytes, "signature", &signature.value)?;
    }

    Ok(bytes)
}

// ----------------------------------------------------------------------------
// Binary Decoding
// ----------------------------------------------------------------------------

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], FormationError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FormationError::Truncated { field })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, FormationError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FormationError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2, field)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FormationError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, FormationError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, field)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn str16(&mut self, field: &'static str) -> Result<&'a str, FormationError> {
        let len = self.u16(field)? as usize;
        let raw = self.take(len, field)?;
        core::str::from_utf8(raw).map_err(|_| FormationError::invalid_field(field, "invalid UTF-8"))
    }

    fn str8(&mut self, field: &'static str) -> Result<&'a str, FormationError> {
        let len = self.u8(field)? as usize;
        let raw = self.take(len, field)?;
        core::str::from_utf8(raw).map_err(|_| FormationError::invalid_field(field, "invalid UTF-8"))
    }

    fn bytes16(&mut self, field: &'static str) -> Result<&'a [u8], FormationError> {
        let len = self.u16(field)? as usize;
        self.take(len, field)
    }

    fn finish(&self) -> Result<(), FormationError> {
        if self.pos != self.bytes.len() {
            return Err(FormationError::TrailingBytes {
                count: self.bytes.len() - self.pos,
            });
        }
        Ok(())
    }
}

fn decode_binary_fields(reader: &mut ByteReader<'_>) -> Result<Envelope, FormationError> {
    let message_type = MessageTypeId::from_u64(reader.u8("messageTypeId")? as u64)?;
    if !matches!(message_type, MessageTypeId::Request | MessageTypeId::Response) {
        return Err(FormationError::WrongFrameKind {
            message_type: message_type.as_u8(),
            frame: "binary",
        });
    }

    let request_id = RequestId::new(reader.str16("requestId")?)?;
    let destination = NodeId::new(reader.str16("destination")?)?;
    let hop_count = reader.u8("networkPath")?;
    let mut hops = Vec::with_capacity(hop_count as usize);
    for _ in 0..hop_count {
        hops.push(NodeId::new(reader.str16("networkPath")?)?);
    }

    let mut header = Header {
        request_id,
        destination,
        network_path: NetworkPath::from_hops(hops),
        timestamp: Timestamp::default(),
        signatures: Vec::new(),
    };

    let envelope = if message_type == MessageTypeId::Request {
        let action = Action::new(reader.str16("action")?)?;
        header.timestamp = Timestamp::new(reader.u64("timestamp")?);
        let timeout = Duration::from_millis(reader.u32("timeoutMs")? as u64);
        let payload = read_payload(reader)?;
        header.signatures = read_signatures(reader)?;
        Envelope::BinaryRequest(BinaryRequest {
            header,
            action,
            payload,
            timeout,
        })
    } else {
        header.timestamp = Timestamp::new(reader.u64("timestamp")?);
        let result = ResultCode::from_u8(reader.u8("result")?)?;
        let payload = read_payload(reader)?;
        header.signatures = read_signatures(reader)?;
        Envelope::BinaryResponse(BinaryResponse {
            header,
            payload,
            result,
        })
    };

    Ok(envelope)
}

fn read_payload(reader: &mut ByteReader<'_>) -> Result<Vec<u8>, FormationError> {
    let len = reader.u32("payload")? as usize;
    Ok(reader.take(len, "payload")?.to_vec())
}

fn read_signatures(reader: &mut ByteReader<'_>) -> Result<Vec<Signature>, FormationError> {
    let count = reader.u8("signatures")?;
    let mut signatures = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_id = reader.str16("keyId")?;
        let algorithm = SignatureAlgorithm::parse(reader.str8("algorithm")?);
        let value = reader.bytes16("signature")?.to_vec();
        signatures.push(Signature::new(key_id, algorithm, value));
    }
    Ok(signatures)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
