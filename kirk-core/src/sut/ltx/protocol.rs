//! LTX wire format: single-byte tagged msgpack arrays.

use rmpv::Value;

pub const TAG_ERROR: u8 = 0xff;
pub const TAG_VERSION: u8 = 0x00;
pub const TAG_PING: u8 = 0x01;
pub const TAG_PONG: u8 = 0x02;
pub const TAG_GET_FILE: u8 = 0x03;
pub const TAG_SET_FILE: u8 = 0x04;
pub const TAG_ENV: u8 = 0x05;
pub const TAG_CWD: u8 = 0x06;
pub const TAG_EXEC: u8 = 0x07;
pub const TAG_RESULT: u8 = 0x08;
pub const TAG_LOG: u8 = 0x09;
pub const TAG_DATA: u8 = 0xa0;
pub const TAG_KILL: u8 = 0xa1;

/// Execution slots are addressed 0..=126. 127 is the broadcast id: `env`/`cwd` sent with it
/// set a default inherited by every future execution instead of targeting one slot.
pub const ALL_SLOTS: u8 = 127;
/// Highest real (non-broadcast) slot id.
pub const MAX_SLOT: u8 = 126;

pub fn pack_version() -> Vec<u8> {
    rmpv::Value::Array(vec![Value::from(TAG_VERSION)]).to_vec_packed()
}

pub fn pack_ping() -> Vec<u8> {
    Value::Array(vec![Value::from(TAG_PING)]).to_vec_packed()
}

pub fn pack_get_file(path: &str) -> Vec<u8> {
    Value::Array(vec![Value::from(TAG_GET_FILE), Value::from(path)]).to_vec_packed()
}

pub fn pack_set_file(path: &str, data: &[u8]) -> Vec<u8> {
    Value::Array(vec![
        Value::from(TAG_SET_FILE),
        Value::from(path),
        Value::from(data.to_vec()),
    ])
    .to_vec_packed()
}

pub fn pack_env(slot: u8, key: &str, value: &str) -> Vec<u8> {
    Value::Array(vec![
        Value::from(TAG_ENV),
        Value::from(slot),
        Value::from(key),
        Value::from(value),
    ])
    .to_vec_packed()
}

pub fn pack_cwd(slot: u8, path: &str) -> Vec<u8> {
    Value::Array(vec![Value::from(TAG_CWD), Value::from(slot), Value::from(path)]).to_vec_packed()
}

pub fn pack_exec(slot: u8, command: &str) -> Vec<u8> {
    Value::Array(vec![Value::from(TAG_EXEC), Value::from(slot), Value::from(command)]).to_vec_packed()
}

pub fn pack_kill(slot: u8) -> Vec<u8> {
    Value::Array(vec![Value::from(TAG_KILL), Value::from(slot)]).to_vec_packed()
}

trait ToVecPacked {
    fn to_vec_packed(&self) -> Vec<u8>;
}

impl ToVecPacked for Value {
    fn to_vec_packed(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, self).expect("encoding an in-memory Value cannot fail");
        buf
    }
}

/// A decoded inbound message: the tag byte plus its array elements (tag excluded).
#[derive(Debug)]
pub struct Inbound {
    pub tag: u8,
    pub fields: Vec<Value>,
}

impl Inbound {
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Array(mut items) = value else {
            return None;
        };
        if items.is_empty() {
            return None;
        }
        let tag = items.remove(0).as_u64()? as u8;
        Some(Self { tag, fields: items })
    }

    pub fn field_u8(&self, idx: usize) -> Option<u8> {
        self.fields.get(idx).and_then(Value::as_u64).map(|v| v as u8)
    }

    pub fn field_i64(&self, idx: usize) -> Option<i64> {
        self.fields.get(idx).and_then(Value::as_i64)
    }

    pub fn field_str(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).and_then(Value::as_str)
    }

    pub fn field_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.fields.get(idx).and_then(Value::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Inbound {
        let value = rmpv::decode::read_value(&mut std::io::Cursor::new(bytes)).unwrap();
        Inbound::from_value(value).unwrap()
    }

    #[test]
    fn exec_packs_tag_slot_and_command() {
        let msg = decode(&pack_exec(5, "echo hi"));
        assert_eq!(msg.tag, TAG_EXEC);
        assert_eq!(msg.field_u8(0), Some(5));
        assert_eq!(msg.field_str(1), Some("echo hi"));
    }

    #[test]
    fn set_file_packs_path_and_raw_bytes() {
        let msg = decode(&pack_set_file("/tmp/x", b"payload"));
        assert_eq!(msg.tag, TAG_SET_FILE);
        assert_eq!(msg.field_str(0), Some("/tmp/x"));
        assert_eq!(msg.field_bytes(1), Some(b"payload".as_slice()));
    }

    #[test]
    fn ping_has_no_payload() {
        let msg = decode(&pack_ping());
        assert_eq!(msg.tag, TAG_PING);
        assert!(msg.fields.is_empty());
    }
}
