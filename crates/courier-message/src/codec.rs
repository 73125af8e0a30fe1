// Binary codec for messages and properties. The journal stores exactly
// these bytes, so the encoding must round-trip every property kind
// byte-for-byte. All integers are little-endian.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_common::ids::{ConnectionId, MessageId};

use crate::{Message, MessageError, PropertyStore, PropertyValue, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_SHORT: u8 = 3;
const TAG_INT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_DOUBLE: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_BYTES: u8 = 9;

const FLAG_DURABLE: u8 = 0x01;
const FLAG_HAS_EXPIRATION: u8 = 0x02;

// Validate length before every read so a short buffer surfaces as
// Incomplete instead of a panic.
fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(MessageError::Incomplete);
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MessageError::InvalidUtf8)
}

pub fn encode_value(buf: &mut BytesMut, value: &PropertyValue) {
    match value {
        PropertyValue::Null => buf.put_u8(TAG_NULL),
        PropertyValue::Bool(v) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*v));
        }
        PropertyValue::Byte(v) => {
            buf.put_u8(TAG_BYTE);
            buf.put_i8(*v);
        }
        PropertyValue::Short(v) => {
            buf.put_u8(TAG_SHORT);
            buf.put_i16_le(*v);
        }
        PropertyValue::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i32_le(*v);
        }
        PropertyValue::Long(v) => {
            buf.put_u8(TAG_LONG);
            buf.put_i64_le(*v);
        }
        PropertyValue::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            // Bit pattern, not text, so NaN and -0.0 survive.
            buf.put_u32_le(v.to_bits());
        }
        PropertyValue::Double(v) => {
            buf.put_u8(TAG_DOUBLE);
            buf.put_u64_le(v.to_bits());
        }
        PropertyValue::Str(v) => {
            buf.put_u8(TAG_STRING);
            put_str(buf, v);
        }
        PropertyValue::Bytes(v) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
    }
}

pub fn decode_value(buf: &mut Bytes) -> Result<PropertyValue> {
    ensure(buf, 1)?;
    let tag = buf.get_u8();
    match tag {
        TAG_NULL => Ok(PropertyValue::Null),
        TAG_BOOL => {
            ensure(buf, 1)?;
            Ok(PropertyValue::Bool(buf.get_u8() != 0))
        }
        TAG_BYTE => {
            ensure(buf, 1)?;
            Ok(PropertyValue::Byte(buf.get_i8()))
        }
        TAG_SHORT => {
            ensure(buf, 2)?;
            Ok(PropertyValue::Short(buf.get_i16_le()))
        }
        TAG_INT => {
            ensure(buf, 4)?;
            Ok(PropertyValue::Int(buf.get_i32_le()))
        }
        TAG_LONG => {
            ensure(buf, 8)?;
            Ok(PropertyValue::Long(buf.get_i64_le()))
        }
        TAG_FLOAT => {
            ensure(buf, 4)?;
            Ok(PropertyValue::Float(f32::from_bits(buf.get_u32_le())))
        }
        TAG_DOUBLE => {
            ensure(buf, 8)?;
            Ok(PropertyValue::Double(f64::from_bits(buf.get_u64_le())))
        }
        TAG_STRING => Ok(PropertyValue::Str(get_str(buf)?)),
        TAG_BYTES => {
            ensure(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            ensure(buf, len)?;
            Ok(PropertyValue::Bytes(buf.split_to(len)))
        }
        other => Err(MessageError::UnknownTag(other)),
    }
}

impl PropertyStore {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for name in self.names() {
            put_str(buf, name);
            // names() only yields stored keys, so the lookup cannot miss.
            if let Some(value) = self.get_object(name) {
                encode_value(buf, value);
            }
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, 4)?;
        let count = buf.get_u32_le();
        let mut store = PropertyStore::new();
        for _ in 0..count {
            let name = get_str(buf)?;
            let value = decode_value(buf)?;
            store.put(name, value);
        }
        Ok(store)
    }
}

impl Message {
    /// Encode the whole message, properties and body included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body().len());
        buf.put_u64_le(self.id().as_u64());
        let mut flags = 0u8;
        if self.durable() {
            flags |= FLAG_DURABLE;
        }
        if self.expiration().is_some() {
            flags |= FLAG_HAS_EXPIRATION;
        }
        buf.put_u8(flags);
        buf.put_u8(self.priority());
        if let Some(at) = self.expiration() {
            buf.put_u64_le(at);
        }
        buf.put_u64_le(self.timestamp());
        buf.put_u64_le(self.origin().as_u64());
        self.properties().encode(&mut buf);
        buf.put_u32_le(self.body().len() as u32);
        buf.put_slice(self.body());
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, 8 + 1 + 1)?;
        let id = MessageId::from_raw(buf.get_u64_le());
        let flags = buf.get_u8();
        let priority = buf.get_u8();
        let expiration = if flags & FLAG_HAS_EXPIRATION != 0 {
            ensure(buf, 8)?;
            Some(buf.get_u64_le())
        } else {
            None
        };
        ensure(buf, 8 + 8)?;
        let timestamp = buf.get_u64_le();
        let origin = ConnectionId::from_raw(buf.get_u64_le());
        let properties = PropertyStore::decode(buf)?;
        ensure(buf, 4)?;
        let body_len = buf.get_u32_le() as usize;
        ensure(buf, body_len)?;
        let body = buf.split_to(body_len);

        let mut builder = crate::MessageBuilder::new(body)
            .durable(flags & FLAG_DURABLE != 0)
            .priority(priority)
            .origin(origin);
        if let Some(at) = expiration {
            builder = builder.expiration(at);
        }
        let mut message = builder.finish(id, timestamp);
        message.properties = properties;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageBuilder;

    fn sample_properties() -> PropertyStore {
        let mut props = PropertyStore::new();
        props.put("bool", PropertyValue::Bool(true));
        props.put("byte", PropertyValue::Byte(-4));
        props.put("short", PropertyValue::Short(-1000));
        props.put("int", PropertyValue::Int(123_456));
        props.put("long", PropertyValue::Long(-9_000_000_000));
        props.put("float", PropertyValue::Float(6.5));
        props.put("double", PropertyValue::Double(-0.125));
        props.put("string", PropertyValue::Str("hello".into()));
        props.put("bytes", PropertyValue::Bytes(Bytes::from_static(&[0, 255, 7])));
        props.put("null", PropertyValue::Null);
        props
    }

    #[test]
    fn message_round_trip_preserves_everything() {
        let props = sample_properties();
        let mut draft = MessageBuilder::new(Bytes::from_static(b"payload"))
            .durable(true)
            .priority(7)
            .expiration(987_654_321)
            .origin(ConnectionId::from_raw(12));
        for (name, value) in props.names().map(|n| (n.to_string(), props.get_object(n).cloned())) {
            draft = draft.property(name, value.expect("value"));
        }
        let message = draft.finish(MessageId::from_raw(777), 123_456_789);

        let mut encoded = message.encode();
        let decoded = Message::decode(&mut encoded).expect("decode");
        assert_eq!(decoded, message);
        assert!(encoded.is_empty(), "decode must consume the full frame");
    }

    #[test]
    fn properties_round_trip_byte_for_byte() {
        let props = sample_properties();
        let mut buf = BytesMut::new();
        props.encode(&mut buf);
        let mut raw = buf.freeze();
        let decoded = PropertyStore::decode(&mut raw).expect("decode");
        assert_eq!(decoded, props);
    }

    #[test]
    fn float_bit_patterns_survive() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &PropertyValue::Double(f64::NAN));
        let mut raw = buf.freeze();
        match decode_value(&mut raw).expect("decode") {
            PropertyValue::Double(v) => assert!(v.is_nan()),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn truncated_input_is_incomplete_not_a_panic() {
        let message = MessageBuilder::new(Bytes::from_static(b"payload"))
            .finish(MessageId::from_raw(1), 5);
        let encoded = message.encode();
        for cut in 0..encoded.len() {
            let mut short = encoded.slice(0..cut);
            let err = Message::decode(&mut short).expect_err("short frame");
            assert!(matches!(err, MessageError::Incomplete));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut raw = Bytes::from_static(&[42]);
        let err = decode_value(&mut raw).expect_err("bad tag");
        assert!(matches!(err, MessageError::UnknownTag(42)));
    }
}
