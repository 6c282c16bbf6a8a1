//! Pluggable serializers mapping [`Object`] trees to byte blobs.
//!
//! A process-wide registry maps serializer names to implementations of the
//! two-function [`Serializer`] interface. `msgpack`, `json` and `yaml` are
//! registered out of the box; `msgpack` is the wire default.
//!
//! Descriptors and shared-memory handles travel out-of-band: the binary
//! codec encodes them as extension values carrying the attachment *index*
//! within the frame, which the connection resolves back into live
//! descriptors on ingress. The textual codecs refuse them outright.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Result, RpcError};
use crate::object::{FdValue, Object, ShmemValue, Tag};

/// A named codec mapping Object trees to byte blobs and back.
pub trait Serializer: Send + Sync {
    fn load(&self, frame: &[u8]) -> Result<Object>;
    fn dump(&self, obj: &Object) -> Result<Vec<u8>>;
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<dyn Serializer>>>> = LazyLock::new(|| {
    let mut map: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
    map.insert("msgpack".to_owned(), Arc::new(MsgpackSerializer));
    map.insert("json".to_owned(), Arc::new(JsonSerializer));
    map.insert("yaml".to_owned(), Arc::new(YamlSerializer));
    RwLock::new(map)
});

/// Register (or replace) a serializer under `name`.
pub fn register(name: &str, serializer: Arc<dyn Serializer>) {
    REGISTRY.write().insert(name.to_owned(), serializer);
}

/// Whether a serializer with the given name is registered.
pub fn exists(name: &str) -> bool {
    REGISTRY.read().contains_key(name)
}

/// Look up a serializer by name.
pub fn find(name: &str) -> Result<Arc<dyn Serializer>> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| RpcError::not_found(format!("unknown serializer {:?}", name)))
}

/// Load an Object from a serialized blob.
pub fn load(name: &str, frame: &[u8]) -> Result<Object> {
    find(name)?.load(frame)
}

/// Dump an Object into its serialized blob form.
pub fn dump(name: &str, obj: &Object) -> Result<Vec<u8>> {
    find(name)?.dump(obj)
}

// Extension type tags used by the msgpack codec.
const EXT_DATE: i8 = 1;
const EXT_FD: i8 = 2;
const EXT_SHMEM: i8 = 3;
const EXT_ERROR: i8 = 4;

struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn load(&self, frame: &[u8]) -> Result<Object> {
        let value = rmpv::decode::read_value(&mut &frame[..])
            .map_err(|e| RpcError::invalid_arguments(format!("malformed msgpack frame: {}", e)))?;
        from_rmpv(value)
    }

    fn dump(&self, obj: &Object) -> Result<Vec<u8>> {
        // The attachment counter assigns indices in the same pre-order the
        // connection uses when collecting descriptors for the frame.
        let mut attachment = 0u32;
        let value = to_rmpv(obj, &mut attachment)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|e| RpcError::internal(format!("msgpack encoding failed: {}", e)))?;
        Ok(buf)
    }
}

fn next_attachment(fd: &FdValue, attachment: &mut u32) -> u32 {
    // Re-dumping an unresolved ingress value keeps its original index.
    match fd.as_index() {
        Some(idx) => idx,
        None => {
            let idx = *attachment;
            *attachment += 1;
            idx
        }
    }
}

fn to_rmpv(obj: &Object, attachment: &mut u32) -> Result<rmpv::Value> {
    Ok(match obj.tag() {
        Tag::Null => rmpv::Value::Nil,
        Tag::Bool => rmpv::Value::from(obj.as_bool()?),
        Tag::Int64 => rmpv::Value::from(obj.as_i64()?),
        Tag::Uint64 => rmpv::Value::from(obj.as_u64()?),
        Tag::Double => rmpv::Value::from(obj.as_f64()?),
        Tag::Date => rmpv::Value::Ext(EXT_DATE, obj.as_date()?.to_le_bytes().to_vec()),
        Tag::String => rmpv::Value::from(obj.as_str()?),
        Tag::Binary => rmpv::Value::Binary(obj.as_bytes()?.to_vec()),
        Tag::Fd => {
            let fd = obj.as_fd()?;
            let idx = next_attachment(&fd, attachment);
            rmpv::Value::Ext(EXT_FD, idx.to_le_bytes().to_vec())
        }
        Tag::Shmem => {
            let shmem = obj.as_shmem()?;
            let idx = next_attachment(shmem.fd(), attachment);
            let mut data = Vec::with_capacity(20);
            data.extend_from_slice(&idx.to_le_bytes());
            data.extend_from_slice(&(shmem.size() as u64).to_le_bytes());
            data.extend_from_slice(&(shmem.offset() as u64).to_le_bytes());
            rmpv::Value::Ext(EXT_SHMEM, data)
        }
        Tag::Array => {
            let mut items = Vec::new();
            for item in obj.array_iter()? {
                items.push(to_rmpv(&item?, attachment)?);
            }
            rmpv::Value::Array(items)
        }
        Tag::Dictionary => {
            let mut entries = Vec::new();
            for entry in obj.dict_iter()? {
                let (key, item) = entry?;
                entries.push((rmpv::Value::from(key.as_str()), to_rmpv(&item, attachment)?));
            }
            rmpv::Value::Map(entries)
        }
        Tag::Error => {
            let extra = match obj.error_extra()? {
                Some(extra) => to_rmpv(&extra, attachment)?,
                None => rmpv::Value::Nil,
            };
            let mut stack = Vec::new();
            for frame in obj.error_stack()? {
                stack.push(to_rmpv(&frame, attachment)?);
            }
            let composite = rmpv::Value::Array(vec![
                rmpv::Value::from(obj.error_code()?),
                rmpv::Value::from(obj.error_message()?.as_str()),
                extra,
                rmpv::Value::Array(stack),
            ]);
            let mut data = Vec::new();
            rmpv::encode::write_value(&mut data, &composite)
                .map_err(|e| RpcError::internal(format!("msgpack encoding failed: {}", e)))?;
            rmpv::Value::Ext(EXT_ERROR, data)
        }
    })
}

fn from_rmpv(value: rmpv::Value) -> Result<Object> {
    Ok(match value {
        rmpv::Value::Nil => Object::null(),
        rmpv::Value::Boolean(v) => Object::boolean(v),
        rmpv::Value::Integer(v) => {
            if let Some(u) = v.as_u64() {
                Object::uint64(u)
            } else if let Some(i) = v.as_i64() {
                Object::int64(i)
            } else {
                return Err(RpcError::invalid_arguments(
                    "msgpack integer out of 64-bit range",
                ));
            }
        }
        rmpv::Value::F32(v) => Object::double(v as f64),
        rmpv::Value::F64(v) => Object::double(v),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Object::string(s),
            None => {
                return Err(RpcError::invalid_arguments(
                    "msgpack string is not valid UTF-8",
                ));
            }
        },
        rmpv::Value::Binary(b) => Object::binary(Bytes::from(b)),
        rmpv::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_rmpv(item)?);
            }
            Object::array(out)
        }
        rmpv::Value::Map(entries) => {
            let dict = Object::dictionary();
            for (key, item) in entries {
                let key = match key {
                    rmpv::Value::String(s) => s.into_str().ok_or_else(|| {
                        RpcError::invalid_arguments("msgpack map key is not valid UTF-8")
                    })?,
                    other => {
                        return Err(RpcError::invalid_arguments(format!(
                            "msgpack map key must be a string, found {}",
                            other
                        )));
                    }
                };
                dict.set_key(&key, from_rmpv(item)?)?;
            }
            dict
        }
        rmpv::Value::Ext(EXT_DATE, data) => {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| RpcError::invalid_arguments("malformed date extension"))?;
            Object::date(i64::from_le_bytes(bytes))
        }
        rmpv::Value::Ext(EXT_FD, data) => {
            let bytes: [u8; 4] = data
                .try_into()
                .map_err(|_| RpcError::invalid_arguments("malformed fd extension"))?;
            Object::fd_value(FdValue::index(u32::from_le_bytes(bytes)))
        }
        rmpv::Value::Ext(EXT_SHMEM, data) => {
            if data.len() != 20 {
                return Err(RpcError::invalid_arguments("malformed shmem extension"));
            }
            let idx = u32::from_le_bytes(data[0..4].try_into().unwrap());
            let size = u64::from_le_bytes(data[4..12].try_into().unwrap()) as usize;
            let offset = u64::from_le_bytes(data[12..20].try_into().unwrap()) as usize;
            Object::shmem_value(ShmemValue {
                fd: FdValue::index(idx),
                size,
                offset,
            })
        }
        rmpv::Value::Ext(EXT_ERROR, data) => {
            let composite = rmpv::decode::read_value(&mut &data[..]).map_err(|e| {
                RpcError::invalid_arguments(format!("malformed error extension: {}", e))
            })?;
            let rmpv::Value::Array(mut fields) = composite else {
                return Err(RpcError::invalid_arguments("malformed error extension"));
            };
            if fields.len() != 4 {
                return Err(RpcError::invalid_arguments("malformed error extension"));
            }
            let stack_value = fields.pop().unwrap();
            let extra_value = fields.pop().unwrap();
            let message = from_rmpv(fields.pop().unwrap())?;
            let code = from_rmpv(fields.pop().unwrap())?;

            let extra = match extra_value {
                rmpv::Value::Nil => None,
                other => Some(from_rmpv(other)?),
            };
            let stack = match from_rmpv(stack_value)? {
                stack if stack.tag() == Tag::Array => {
                    stack.array_iter()?.collect::<Result<Vec<_>>>()?
                }
                _ => Vec::new(),
            };

            Object::error_full(
                code.as_i64()?,
                message.as_str()?.to_owned(),
                extra,
                stack,
            )
        }
        rmpv::Value::Ext(tag, _) => {
            return Err(RpcError::invalid_arguments(format!(
                "unknown msgpack extension type {}",
                tag
            )));
        }
    })
}

// Single-key maps tagging values the textual codecs cannot express natively.
// Literal dictionary keys starting with '!' are escaped with a second '!'.
const TAG_DATE: &str = "!date";
const TAG_BINARY: &str = "!binary";
const TAG_ERROR: &str = "!error";

struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn load(&self, frame: &[u8]) -> Result<Object> {
        let value: serde_json::Value = serde_json::from_slice(frame)
            .map_err(|e| RpcError::invalid_arguments(format!("malformed json frame: {}", e)))?;
        from_json(&value)
    }

    fn dump(&self, obj: &Object) -> Result<Vec<u8>> {
        let value = to_json(obj)?;
        serde_json::to_vec(&value)
            .map_err(|e| RpcError::internal(format!("json encoding failed: {}", e)))
    }
}

fn tagged_json(tag: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(tag.to_owned(), value);
    serde_json::Value::Object(map)
}

fn to_json(obj: &Object) -> Result<serde_json::Value> {
    Ok(match obj.tag() {
        Tag::Null => serde_json::Value::Null,
        Tag::Bool => serde_json::Value::from(obj.as_bool()?),
        Tag::Int64 => serde_json::Value::from(obj.as_i64()?),
        Tag::Uint64 => serde_json::Value::from(obj.as_u64()?),
        Tag::Double => {
            let v = obj.as_f64()?;
            serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    RpcError::unsupported_type("json cannot represent a non-finite double")
                })?
        }
        Tag::Date => tagged_json(TAG_DATE, serde_json::Value::from(obj.as_date()?)),
        Tag::String => serde_json::Value::from(obj.as_str()?),
        Tag::Binary => tagged_json(
            TAG_BINARY,
            serde_json::Value::from(BASE64.encode(obj.as_bytes()?)),
        ),
        Tag::Fd | Tag::Shmem => {
            return Err(RpcError::unsupported_type(format!(
                "json cannot carry {} values",
                obj.tag()
            )));
        }
        Tag::Array => {
            let mut items = Vec::new();
            for item in obj.array_iter()? {
                items.push(to_json(&item?)?);
            }
            serde_json::Value::Array(items)
        }
        Tag::Dictionary => {
            let mut map = serde_json::Map::new();
            for entry in obj.dict_iter()? {
                let (key, item) = entry?;
                let key = if key.starts_with('!') {
                    format!("!{}", key)
                } else {
                    key
                };
                map.insert(key, to_json(&item)?);
            }
            serde_json::Value::Object(map)
        }
        Tag::Error => {
            let mut fields = serde_json::Map::new();
            fields.insert("code".to_owned(), serde_json::Value::from(obj.error_code()?));
            fields.insert(
                "message".to_owned(),
                serde_json::Value::from(obj.error_message()?),
            );
            if let Some(extra) = obj.error_extra()? {
                fields.insert("extra".to_owned(), to_json(&extra)?);
            }
            let mut stack = Vec::new();
            for frame in obj.error_stack()? {
                stack.push(to_json(&frame)?);
            }
            fields.insert("stack".to_owned(), serde_json::Value::Array(stack));
            tagged_json(TAG_ERROR, serde_json::Value::Object(fields))
        }
    })
}

fn from_json(value: &serde_json::Value) -> Result<Object> {
    Ok(match value {
        serde_json::Value::Null => Object::null(),
        serde_json::Value::Bool(v) => Object::boolean(*v),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Object::uint64(u)
            } else if let Some(i) = n.as_i64() {
                Object::int64(i)
            } else {
                Object::double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Object::string(s.as_str()),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item)?);
            }
            Object::array(out)
        }
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                let (key, inner) = map.iter().next().unwrap();
                match key.as_str() {
                    TAG_DATE => {
                        return inner
                            .as_i64()
                            .map(Object::date)
                            .ok_or_else(|| RpcError::invalid_arguments("malformed date tag"));
                    }
                    TAG_BINARY => {
                        let text = inner
                            .as_str()
                            .ok_or_else(|| RpcError::invalid_arguments("malformed binary tag"))?;
                        let bytes = BASE64.decode(text).map_err(|e| {
                            RpcError::invalid_arguments(format!("malformed base64 payload: {}", e))
                        })?;
                        return Ok(Object::binary(Bytes::from(bytes)));
                    }
                    TAG_ERROR => return error_from_json(inner),
                    _ => {}
                }
            }

            let dict = Object::dictionary();
            for (key, item) in map {
                let key = key.strip_prefix('!').filter(|k| k.starts_with('!')).unwrap_or(key);
                dict.set_key(key, from_json(item)?)?;
            }
            dict
        }
    })
}

fn error_from_json(value: &serde_json::Value) -> Result<Object> {
    let fields = value
        .as_object()
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let code = fields
        .get("code")
        .and_then(|c| c.as_i64())
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let message = fields
        .get("message")
        .and_then(|m| m.as_str())
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let extra = match fields.get("extra") {
        Some(extra) => Some(from_json(extra)?),
        None => None,
    };
    let stack = match fields.get("stack") {
        Some(serde_json::Value::Array(frames)) => frames
            .iter()
            .map(from_json)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    Ok(Object::error_full(code, message, extra, stack))
}

struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn load(&self, frame: &[u8]) -> Result<Object> {
        let value: serde_yaml::Value = serde_yaml::from_slice(frame)
            .map_err(|e| RpcError::invalid_arguments(format!("malformed yaml frame: {}", e)))?;
        from_yaml(&value)
    }

    fn dump(&self, obj: &Object) -> Result<Vec<u8>> {
        let value = to_yaml(obj)?;
        let text = serde_yaml::to_string(&value)
            .map_err(|e| RpcError::internal(format!("yaml encoding failed: {}", e)))?;
        Ok(text.into_bytes())
    }
}

fn tagged_yaml(tag: &str, value: serde_yaml::Value) -> serde_yaml::Value {
    let mut map = serde_yaml::Mapping::new();
    map.insert(serde_yaml::Value::String(tag.to_owned()), value);
    serde_yaml::Value::Mapping(map)
}

fn to_yaml(obj: &Object) -> Result<serde_yaml::Value> {
    Ok(match obj.tag() {
        Tag::Null => serde_yaml::Value::Null,
        Tag::Bool => serde_yaml::Value::Bool(obj.as_bool()?),
        Tag::Int64 => serde_yaml::Value::Number(serde_yaml::Number::from(obj.as_i64()?)),
        Tag::Uint64 => serde_yaml::Value::Number(serde_yaml::Number::from(obj.as_u64()?)),
        Tag::Double => serde_yaml::Value::Number(serde_yaml::Number::from(obj.as_f64()?)),
        Tag::Date => tagged_yaml(
            TAG_DATE,
            serde_yaml::Value::Number(serde_yaml::Number::from(obj.as_date()?)),
        ),
        Tag::String => serde_yaml::Value::String(obj.as_str()?.to_owned()),
        Tag::Binary => tagged_yaml(
            TAG_BINARY,
            serde_yaml::Value::String(BASE64.encode(obj.as_bytes()?)),
        ),
        Tag::Fd | Tag::Shmem => {
            return Err(RpcError::unsupported_type(format!(
                "yaml cannot carry {} values",
                obj.tag()
            )));
        }
        Tag::Array => {
            let mut items = Vec::new();
            for item in obj.array_iter()? {
                items.push(to_yaml(&item?)?);
            }
            serde_yaml::Value::Sequence(items)
        }
        Tag::Dictionary => {
            let mut map = serde_yaml::Mapping::new();
            for entry in obj.dict_iter()? {
                let (key, item) = entry?;
                let key = if key.starts_with('!') {
                    format!("!{}", key)
                } else {
                    key
                };
                map.insert(serde_yaml::Value::String(key), to_yaml(&item)?);
            }
            serde_yaml::Value::Mapping(map)
        }
        Tag::Error => {
            let mut fields = serde_yaml::Mapping::new();
            fields.insert(
                serde_yaml::Value::String("code".to_owned()),
                serde_yaml::Value::Number(serde_yaml::Number::from(obj.error_code()?)),
            );
            fields.insert(
                serde_yaml::Value::String("message".to_owned()),
                serde_yaml::Value::String(obj.error_message()?),
            );
            if let Some(extra) = obj.error_extra()? {
                fields.insert(
                    serde_yaml::Value::String("extra".to_owned()),
                    to_yaml(&extra)?,
                );
            }
            let mut stack = Vec::new();
            for frame in obj.error_stack()? {
                stack.push(to_yaml(&frame)?);
            }
            fields.insert(
                serde_yaml::Value::String("stack".to_owned()),
                serde_yaml::Value::Sequence(stack),
            );
            tagged_yaml(TAG_ERROR, serde_yaml::Value::Mapping(fields))
        }
    })
}

fn from_yaml(value: &serde_yaml::Value) -> Result<Object> {
    Ok(match value {
        serde_yaml::Value::Null => Object::null(),
        serde_yaml::Value::Bool(v) => Object::boolean(*v),
        serde_yaml::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Object::uint64(u)
            } else if let Some(i) = n.as_i64() {
                Object::int64(i)
            } else {
                Object::double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_yaml::Value::String(s) => Object::string(s.as_str()),
        serde_yaml::Value::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_yaml(item)?);
            }
            Object::array(out)
        }
        serde_yaml::Value::Mapping(map) => {
            if map.len() == 1 {
                let (key, inner) = map.iter().next().unwrap();
                if let serde_yaml::Value::String(key) = key {
                    match key.as_str() {
                        TAG_DATE => {
                            return inner
                                .as_i64()
                                .map(Object::date)
                                .ok_or_else(|| RpcError::invalid_arguments("malformed date tag"));
                        }
                        TAG_BINARY => {
                            let text = inner.as_str().ok_or_else(|| {
                                RpcError::invalid_arguments("malformed binary tag")
                            })?;
                            let bytes = BASE64.decode(text).map_err(|e| {
                                RpcError::invalid_arguments(format!(
                                    "malformed base64 payload: {}",
                                    e
                                ))
                            })?;
                            return Ok(Object::binary(Bytes::from(bytes)));
                        }
                        TAG_ERROR => return error_from_yaml(inner),
                        _ => {}
                    }
                }
            }

            let dict = Object::dictionary();
            for (key, item) in map {
                let serde_yaml::Value::String(key) = key else {
                    return Err(RpcError::invalid_arguments(
                        "yaml mapping key must be a string",
                    ));
                };
                let key = key
                    .strip_prefix('!')
                    .filter(|k| k.starts_with('!'))
                    .unwrap_or(key.as_str());
                dict.set_key(key, from_yaml(item)?)?;
            }
            dict
        }
        serde_yaml::Value::Tagged(_) => {
            return Err(RpcError::invalid_arguments(
                "foreign yaml tags are not supported",
            ));
        }
    })
}

fn yaml_field<'a>(
    fields: &'a serde_yaml::Mapping,
    name: &str,
) -> Option<&'a serde_yaml::Value> {
    fields.iter().find_map(|(key, value)| match key {
        serde_yaml::Value::String(key) if key == name => Some(value),
        _ => None,
    })
}

fn error_from_yaml(value: &serde_yaml::Value) -> Result<Object> {
    let fields = value
        .as_mapping()
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let code = yaml_field(fields, "code")
        .and_then(|c| c.as_i64())
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let message = yaml_field(fields, "message")
        .and_then(|m| m.as_str())
        .ok_or_else(|| RpcError::invalid_arguments("malformed error tag"))?;
    let extra = match yaml_field(fields, "extra") {
        Some(extra) => Some(from_yaml(extra)?),
        None => None,
    };
    let stack = match yaml_field(fields, "stack") {
        Some(serde_yaml::Value::Sequence(frames)) => frames
            .iter()
            .map(from_yaml)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    Ok(Object::error_full(code, message, extra, stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn composite() -> Object {
        Object::dict_from([
            ("null", Object::null()),
            ("bool", Object::boolean(true)),
            ("int", Object::int64(-42)),
            ("uint", Object::uint64(0x80808080)),
            ("double", Object::double(1.25)),
            ("date", Object::date(1_500_000_000_000_000)),
            ("string", Object::string("hello")),
            ("binary", Object::binary(Bytes::from_static(b"\x00\x01\x02"))),
            (
                "array",
                Object::array(vec![Object::int64(1), Object::string("two")]),
            ),
            (
                "nested",
                Object::dict_from([("inner", Object::array(vec![Object::boolean(false)]))]),
            ),
        ])
    }

    #[test]
    fn registry_has_mandatory_serializers() {
        assert!(exists("msgpack"));
        assert!(exists("json"));
        assert!(exists("yaml"));
        assert!(!exists("cbor"));
    }

    #[test]
    fn msgpack_roundtrip() {
        let obj = composite();
        let blob = dump("msgpack", &obj).unwrap();
        let back = load("msgpack", &blob).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn yaml_roundtrip() {
        let obj = composite();
        let blob = dump("yaml", &obj).unwrap();
        let back = load("yaml", &blob).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn json_roundtrip_without_binary_precision() {
        // Binary is representable in json through base64 tagging.
        let obj = composite();
        let blob = dump("json", &obj).unwrap();
        let back = load("json", &blob).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn json_refuses_descriptors() {
        let obj = Object::fd(1, false);
        let err = dump("json", &obj).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);
    }

    #[test]
    fn msgpack_error_roundtrip() {
        let err_obj = Object::error(38, "It broke!");
        err_obj.error_append_frame("handler.rs", 10, "fun_a").unwrap();
        err_obj.error_append_frame("dispatch.rs", 20, "dispatch").unwrap();

        let blob = dump("msgpack", &err_obj).unwrap();
        let back = load("msgpack", &blob).unwrap();

        assert_eq!(back.error_code().unwrap(), 38);
        assert_eq!(back.error_message().unwrap(), "It broke!");
        assert_eq!(back.error_stack().unwrap().len(), 2);
        assert_eq!(back, err_obj);
    }

    #[test]
    fn msgpack_fd_encodes_attachment_index() {
        let obj = Object::array(vec![
            Object::fd_value(FdValue::index(0)),
            Object::fd_value(FdValue::index(1)),
        ]);
        let blob = dump("msgpack", &obj).unwrap();
        let back = load("msgpack", &blob).unwrap();

        assert_eq!(back.get_index(0).unwrap().as_fd().unwrap().as_index(), Some(0));
        assert_eq!(back.get_index(1).unwrap().as_fd().unwrap().as_index(), Some(1));
    }

    #[test]
    fn msgpack_shmem_carries_geometry() {
        let obj = Object::shmem_value(ShmemValue {
            fd: FdValue::index(0),
            size: 1 << 20,
            offset: 4096,
        });
        let blob = dump("msgpack", &obj).unwrap();
        let back = load("msgpack", &blob).unwrap();

        let shmem = back.as_shmem().unwrap();
        assert_eq!(shmem.size(), 1 << 20);
        assert_eq!(shmem.offset(), 4096);
        assert_eq!(shmem.fd().as_index(), Some(0));
    }

    #[test]
    fn dictionary_keys_with_tag_prefix_are_escaped() {
        let obj = Object::dict_from([("!date", Object::string("not a date"))]);
        for codec in ["json", "yaml"] {
            let blob = dump(codec, &obj).unwrap();
            let back = load(codec, &blob).unwrap();
            assert_eq!(back, obj, "codec {}", codec);
        }
    }

    #[test]
    fn unknown_serializer_fails() {
        let err = dump("cbor", &Object::null()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn custom_serializer_can_be_registered() {
        struct Passthrough;
        impl Serializer for Passthrough {
            fn load(&self, frame: &[u8]) -> Result<Object> {
                Ok(Object::binary(Bytes::copy_from_slice(frame)))
            }
            fn dump(&self, obj: &Object) -> Result<Vec<u8>> {
                Ok(obj.as_bytes()?.to_vec())
            }
        }

        register("passthrough", Arc::new(Passthrough));
        assert!(exists("passthrough"));

        let blob = dump("passthrough", &Object::binary(Bytes::from_static(b"raw"))).unwrap();
        assert_eq!(blob, b"raw");
    }
}
