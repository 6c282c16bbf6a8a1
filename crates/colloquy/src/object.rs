//! Tagged, reference-counted dynamic values.
//!
//! [`Object`] is the payload type of every call and event in the runtime: a
//! cheaply clonable handle to a tagged value tree. Leaves cover the usual
//! scalars plus binary blobs, file descriptors and shared-memory handles;
//! containers are arrays and insertion-ordered dictionaries. Containers are
//! mutable in place behind the handle, everything else is immutable once
//! constructed.
//!
//! Two threads may read a container concurrently; mutation demands external
//! synchronisation. Iterators detect mutation of the underlying container and
//! fail with `concurrent-mutation` instead of yielding torn state.

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{ErrorKind, Result, RpcError, set_last_error};

/// The closed set of value tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Null,
    Bool,
    Int64,
    Uint64,
    Double,
    Date,
    String,
    Binary,
    Fd,
    Shmem,
    Array,
    Dictionary,
    Error,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Null => "null",
            Tag::Bool => "bool",
            Tag::Int64 => "int64",
            Tag::Uint64 => "uint64",
            Tag::Double => "double",
            Tag::Date => "date",
            Tag::String => "string",
            Tag::Binary => "binary",
            Tag::Fd => "fd",
            Tag::Shmem => "shmem",
            Tag::Array => "array",
            Tag::Dictionary => "dictionary",
            Tag::Error => "error",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duplicate a raw descriptor with `F_DUPFD_CLOEXEC`.
pub(crate) fn dup_fd(raw: RawFd) -> Result<OwnedFd> {
    let duped = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
    if duped < 0 {
        return Err(RpcError::internal(format!(
            "cannot duplicate descriptor {}: {}",
            raw,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: fcntl returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// A transferable file descriptor.
///
/// On the wire a descriptor is replaced by its position in the frame's
/// out-of-band attachment list; the connection resolves that index back into
/// a live descriptor on ingress. An unresolved value only ever exists inside
/// the serializer and connection internals.
#[derive(Clone)]
pub struct FdValue {
    repr: Arc<FdRepr>,
}

enum FdRepr {
    /// Attachment index, pending resolution on ingress.
    Index(u32),
    /// Descriptor owned by someone else; not closed on drop.
    Borrowed(RawFd),
    /// Descriptor owned by this value; closed when the last clone drops.
    Owned(OwnedFd),
}

impl FdValue {
    pub(crate) fn index(idx: u32) -> Self {
        FdValue {
            repr: Arc::new(FdRepr::Index(idx)),
        }
    }

    pub fn borrowed(raw: RawFd) -> Self {
        FdValue {
            repr: Arc::new(FdRepr::Borrowed(raw)),
        }
    }

    pub fn owned(fd: OwnedFd) -> Self {
        FdValue {
            repr: Arc::new(FdRepr::Owned(fd)),
        }
    }

    /// The raw descriptor number. Fails on a value that has not been
    /// resolved against its frame's attachments.
    pub fn raw(&self) -> Result<RawFd> {
        match &*self.repr {
            FdRepr::Index(idx) => Err(RpcError::internal(format!(
                "descriptor attachment {} has not been resolved",
                idx
            ))),
            FdRepr::Borrowed(raw) => Ok(*raw),
            FdRepr::Owned(fd) => Ok(fd.as_raw_fd()),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(&*self.repr, FdRepr::Owned(_))
    }

    pub(crate) fn as_index(&self) -> Option<u32> {
        match &*self.repr {
            FdRepr::Index(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Duplicate the underlying descriptor for out-of-band transfer.
    pub(crate) fn dup(&self) -> Result<OwnedFd> {
        dup_fd(self.raw()?)
    }
}

impl PartialEq for FdValue {
    fn eq(&self, other: &Self) -> bool {
        match (&*self.repr, &*other.repr) {
            (FdRepr::Index(a), FdRepr::Index(b)) => a == b,
            (FdRepr::Index(_), _) | (_, FdRepr::Index(_)) => false,
            (a, b) => raw_of(a) == raw_of(b),
        }
    }
}

fn raw_of(repr: &FdRepr) -> RawFd {
    match repr {
        FdRepr::Index(_) => -1,
        FdRepr::Borrowed(raw) => *raw,
        FdRepr::Owned(fd) => fd.as_raw_fd(),
    }
}

impl fmt::Debug for FdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.repr {
            FdRepr::Index(idx) => write!(f, "fd#{}", idx),
            FdRepr::Borrowed(raw) => write!(f, "fd {} (borrowed)", raw),
            FdRepr::Owned(fd) => write!(f, "fd {}", fd.as_raw_fd()),
        }
    }
}

/// Handle to a mappable shared-memory region: a backing descriptor plus an
/// immutable size and offset.
#[derive(Clone, Debug, PartialEq)]
pub struct ShmemValue {
    pub(crate) fd: FdValue,
    pub(crate) size: usize,
    pub(crate) offset: usize,
}

impl ShmemValue {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn fd(&self) -> &FdValue {
        &self.fd
    }
}

struct ErrorValue {
    code: i64,
    message: String,
    extra: Option<Object>,
    /// Stack frames are appended as the error crosses named boundaries;
    /// existing frames are never rewritten.
    stack: RwLock<Vec<Object>>,
}

struct ArrayRepr {
    items: RwLock<Vec<Object>>,
    version: AtomicU64,
}

struct DictRepr {
    entries: RwLock<IndexMap<String, Object>>,
    version: AtomicU64,
}

enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    /// Microseconds since the Unix epoch.
    Date(i64),
    String(String),
    Binary(Bytes),
    Fd(FdValue),
    Shmem(ShmemValue),
    Array(ArrayRepr),
    Dictionary(DictRepr),
    Error(ErrorValue),
}

/// A tagged, reference-counted dynamic value.
///
/// Cloning an `Object` is cheap: clones share the same underlying value.
/// [`Object::refcount`] exposes the number of live handles.
#[derive(Clone)]
pub struct Object {
    value: Arc<Value>,
}

impl Object {
    fn from_value(value: Value) -> Self {
        Object {
            value: Arc::new(value),
        }
    }

    pub fn null() -> Self {
        Self::from_value(Value::Null)
    }

    pub fn boolean(v: bool) -> Self {
        Self::from_value(Value::Bool(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::from_value(Value::Int64(v))
    }

    pub fn uint64(v: u64) -> Self {
        Self::from_value(Value::Uint64(v))
    }

    pub fn double(v: f64) -> Self {
        Self::from_value(Value::Double(v))
    }

    /// An absolute instant, in microseconds since the Unix epoch.
    pub fn date(micros: i64) -> Self {
        Self::from_value(Value::Date(micros))
    }

    pub fn date_now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self::date(micros)
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::from_value(Value::String(v.into()))
    }

    pub fn binary(v: impl Into<Bytes>) -> Self {
        Self::from_value(Value::Binary(v.into()))
    }

    /// Wrap a raw descriptor. With `owned` set, the descriptor is closed when
    /// the last handle drops.
    pub fn fd(raw: RawFd, owned: bool) -> Self {
        let value = if owned {
            // SAFETY: the caller asserts ownership of `raw`.
            FdValue::owned(unsafe { OwnedFd::from_raw_fd(raw) })
        } else {
            FdValue::borrowed(raw)
        };
        Self::from_value(Value::Fd(value))
    }

    pub fn fd_owned(fd: OwnedFd) -> Self {
        Self::from_value(Value::Fd(FdValue::owned(fd)))
    }

    pub(crate) fn fd_value(value: FdValue) -> Self {
        Self::from_value(Value::Fd(value))
    }

    pub(crate) fn shmem_value(value: ShmemValue) -> Self {
        Self::from_value(Value::Shmem(value))
    }

    pub fn array(items: Vec<Object>) -> Self {
        Self::from_value(Value::Array(ArrayRepr {
            items: RwLock::new(items),
            version: AtomicU64::new(0),
        }))
    }

    pub fn dictionary() -> Self {
        Self::from_value(Value::Dictionary(DictRepr {
            entries: RwLock::new(IndexMap::new()),
            version: AtomicU64::new(0),
        }))
    }

    pub fn dict_from<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Object)>) -> Self {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<IndexMap<String, Object>>();
        Self::from_value(Value::Dictionary(DictRepr {
            entries: RwLock::new(entries),
            version: AtomicU64::new(0),
        }))
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self::error_full(code, message, None, Vec::new())
    }

    pub fn error_with_extra(code: i64, message: impl Into<String>, extra: Object) -> Self {
        Self::error_full(code, message, Some(extra), Vec::new())
    }

    pub(crate) fn error_full(
        code: i64,
        message: impl Into<String>,
        extra: Option<Object>,
        stack: Vec<Object>,
    ) -> Self {
        Self::from_value(Value::Error(ErrorValue {
            code,
            message: message.into(),
            extra,
            stack: RwLock::new(stack),
        }))
    }

    pub fn tag(&self) -> Tag {
        match &*self.value {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::Int64(_) => Tag::Int64,
            Value::Uint64(_) => Tag::Uint64,
            Value::Double(_) => Tag::Double,
            Value::Date(_) => Tag::Date,
            Value::String(_) => Tag::String,
            Value::Binary(_) => Tag::Binary,
            Value::Fd(_) => Tag::Fd,
            Value::Shmem(_) => Tag::Shmem,
            Value::Array(_) => Tag::Array,
            Value::Dictionary(_) => Tag::Dictionary,
            Value::Error(_) => Tag::Error,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(&*self.value, Value::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(&*self.value, Value::Error(_))
    }

    /// Number of live handles to this value.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.value)
    }

    fn mismatch(&self, wanted: &str) -> RpcError {
        let err = RpcError::type_mismatch(format!("expected {}, found {}", wanted, self.tag()));
        set_last_error(err.clone());
        err
    }

    pub fn as_bool(&self) -> Result<bool> {
        match &*self.value {
            Value::Bool(v) => Ok(*v),
            _ => Err(self.mismatch("bool")),
        }
    }

    /// Signed integer accessor. Unsigned values are accepted as long as they
    /// are representable: self-describing codecs do not preserve signedness
    /// of non-negative integers.
    pub fn as_i64(&self) -> Result<i64> {
        match &*self.value {
            Value::Int64(v) => Ok(*v),
            Value::Uint64(v) if *v <= i64::MAX as u64 => Ok(*v as i64),
            _ => Err(self.mismatch("int64")),
        }
    }

    /// Unsigned integer accessor; accepts non-negative signed values.
    pub fn as_u64(&self) -> Result<u64> {
        match &*self.value {
            Value::Uint64(v) => Ok(*v),
            Value::Int64(v) if *v >= 0 => Ok(*v as u64),
            _ => Err(self.mismatch("uint64")),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match &*self.value {
            Value::Double(v) => Ok(*v),
            _ => Err(self.mismatch("double")),
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn as_date(&self) -> Result<i64> {
        match &*self.value {
            Value::Date(v) => Ok(*v),
            _ => Err(self.mismatch("date")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match &*self.value {
            Value::String(v) => Ok(v.as_str()),
            _ => Err(self.mismatch("string")),
        }
    }

    pub fn as_bytes(&self) -> Result<Bytes> {
        match &*self.value {
            Value::Binary(v) => Ok(v.clone()),
            _ => Err(self.mismatch("binary")),
        }
    }

    pub fn as_fd(&self) -> Result<FdValue> {
        match &*self.value {
            Value::Fd(v) => Ok(v.clone()),
            _ => Err(self.mismatch("fd")),
        }
    }

    pub fn fd_raw(&self) -> Result<RawFd> {
        self.as_fd()?.raw()
    }

    pub fn as_shmem(&self) -> Result<ShmemValue> {
        match &*self.value {
            Value::Shmem(v) => Ok(v.clone()),
            _ => Err(self.mismatch("shmem")),
        }
    }

    /// Element or entry count of a container.
    pub fn len(&self) -> Result<usize> {
        match &*self.value {
            Value::Array(repr) => Ok(repr.items.read().len()),
            Value::Dictionary(repr) => Ok(repr.entries.read().len()),
            _ => Err(self.mismatch("array or dictionary")),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn append(&self, item: Object) -> Result<()> {
        match &*self.value {
            Value::Array(repr) => {
                repr.items.write().push(item);
                repr.version.fetch_add(1, Ordering::Release);
                Ok(())
            }
            _ => Err(self.mismatch("array")),
        }
    }

    /// Replace the element at `idx`; `idx == len` appends.
    pub fn set_index(&self, idx: usize, item: Object) -> Result<()> {
        match &*self.value {
            Value::Array(repr) => {
                let mut items = repr.items.write();
                if idx < items.len() {
                    items[idx] = item;
                } else if idx == items.len() {
                    items.push(item);
                } else {
                    return Err(RpcError::invalid_arguments(format!(
                        "index {} out of bounds for array of {} elements",
                        idx,
                        items.len()
                    )));
                }
                repr.version.fetch_add(1, Ordering::Release);
                Ok(())
            }
            _ => Err(self.mismatch("array")),
        }
    }

    /// Remove the element at `idx`, shifting subsequent elements left.
    pub fn remove_index(&self, idx: usize) -> Result<Object> {
        match &*self.value {
            Value::Array(repr) => {
                let mut items = repr.items.write();
                if idx >= items.len() {
                    return Err(RpcError::invalid_arguments(format!(
                        "index {} out of bounds for array of {} elements",
                        idx,
                        items.len()
                    )));
                }
                let removed = items.remove(idx);
                repr.version.fetch_add(1, Ordering::Release);
                Ok(removed)
            }
            _ => Err(self.mismatch("array")),
        }
    }

    pub fn get_index(&self, idx: usize) -> Option<Object> {
        match &*self.value {
            Value::Array(repr) => repr.items.read().get(idx).cloned(),
            _ => None,
        }
    }

    pub fn set_key(&self, key: &str, item: Object) -> Result<()> {
        match &*self.value {
            Value::Dictionary(repr) => {
                repr.entries.write().insert(key.to_owned(), item);
                repr.version.fetch_add(1, Ordering::Release);
                Ok(())
            }
            _ => Err(self.mismatch("dictionary")),
        }
    }

    pub fn get_key(&self, key: &str) -> Option<Object> {
        match &*self.value {
            Value::Dictionary(repr) => repr.entries.read().get(key).cloned(),
            _ => None,
        }
    }

    /// Remove an entry, preserving the relative order of the others.
    pub fn remove_key(&self, key: &str) -> Result<Option<Object>> {
        match &*self.value {
            Value::Dictionary(repr) => {
                let removed = repr.entries.write().shift_remove(key);
                repr.version.fetch_add(1, Ordering::Release);
                Ok(removed)
            }
            _ => Err(self.mismatch("dictionary")),
        }
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        match &*self.value {
            Value::Dictionary(repr) => Ok(repr.entries.read().keys().cloned().collect()),
            _ => Err(self.mismatch("dictionary")),
        }
    }

    pub fn array_iter(&self) -> Result<ArrayIter> {
        match &*self.value {
            Value::Array(repr) => Ok(ArrayIter {
                obj: self.clone(),
                pos: 0,
                version: repr.version.load(Ordering::Acquire),
                failed: false,
            }),
            _ => Err(self.mismatch("array")),
        }
    }

    pub fn dict_iter(&self) -> Result<DictIter> {
        match &*self.value {
            Value::Dictionary(repr) => Ok(DictIter {
                obj: self.clone(),
                pos: 0,
                version: repr.version.load(Ordering::Acquire),
                failed: false,
            }),
            _ => Err(self.mismatch("dictionary")),
        }
    }

    pub fn error_code(&self) -> Result<i64> {
        match &*self.value {
            Value::Error(e) => Ok(e.code),
            _ => Err(self.mismatch("error")),
        }
    }

    pub fn error_message(&self) -> Result<String> {
        match &*self.value {
            Value::Error(e) => Ok(e.message.clone()),
            _ => Err(self.mismatch("error")),
        }
    }

    pub fn error_extra(&self) -> Result<Option<Object>> {
        match &*self.value {
            Value::Error(e) => Ok(e.extra.clone()),
            _ => Err(self.mismatch("error")),
        }
    }

    pub fn error_stack(&self) -> Result<Vec<Object>> {
        match &*self.value {
            Value::Error(e) => Ok(e.stack.read().clone()),
            _ => Err(self.mismatch("error")),
        }
    }

    /// Append a `{file, line, function}` frame to an error's stack.
    pub fn error_append_frame(&self, file: &str, line: u64, function: &str) -> Result<()> {
        match &*self.value {
            Value::Error(e) => {
                let frame = Object::dict_from([
                    ("file", Object::string(file)),
                    ("line", Object::uint64(line)),
                    ("function", Object::string(function)),
                ]);
                e.stack.write().push(frame);
                Ok(())
            }
            _ => Err(self.mismatch("error")),
        }
    }

    /// Convert an error object into an [`RpcError`], recovering the kind from
    /// the `extra.kind` entry when present.
    pub fn to_rpc_error(&self) -> Result<RpcError> {
        match &*self.value {
            Value::Error(e) => {
                let kind = e
                    .extra
                    .as_ref()
                    .and_then(|extra| extra.get_key("kind"))
                    .and_then(|k| k.as_str().ok().and_then(ErrorKind::parse))
                    .unwrap_or(ErrorKind::Internal);
                Ok(RpcError::new(kind, e.message.clone()))
            }
            _ => Err(self.mismatch("error")),
        }
    }

    /// Structural FNV-1a hash.
    ///
    /// Descriptors, shared memory handles and binary blobs have no stable
    /// identity and refuse with `unsupported-type`. Array children are
    /// combined in iteration order, dictionary children in sorted-key order.
    pub fn hash(&self) -> Result<u64> {
        self.hash_fold(FNV_OFFSET)
    }

    fn hash_fold(&self, mut h: u64) -> Result<u64> {
        // Integers hash through a canonical form so that int64(n) and
        // uint64(n), which compare equal, also hash equal.
        match &*self.value {
            Value::Int64(v) if *v >= 0 => {
                h = fnv1a(h, &[Tag::Uint64 as u8]);
                return Ok(fnv1a(h, &(*v as u64).to_le_bytes()));
            }
            Value::Uint64(v) => {
                h = fnv1a(h, &[Tag::Uint64 as u8]);
                return Ok(fnv1a(h, &v.to_le_bytes()));
            }
            _ => {}
        }
        h = fnv1a(h, &[self.tag() as u8]);
        match &*self.value {
            Value::Null => Ok(h),
            Value::Bool(v) => Ok(fnv1a(h, &[*v as u8])),
            Value::Int64(v) => Ok(fnv1a(h, &v.to_le_bytes())),
            Value::Uint64(v) => Ok(fnv1a(h, &v.to_le_bytes())),
            Value::Double(v) => Ok(fnv1a(h, &v.to_bits().to_le_bytes())),
            Value::Date(v) => Ok(fnv1a(h, &v.to_le_bytes())),
            Value::String(v) => Ok(fnv1a(h, v.as_bytes())),
            Value::Binary(_) | Value::Fd(_) | Value::Shmem(_) => Err(RpcError::unsupported_type(
                format!("{} values are not hashable", self.tag()),
            )),
            Value::Array(repr) => {
                let items = repr.items.read().clone();
                for item in &items {
                    h = item.hash_fold(h)?;
                }
                Ok(h)
            }
            Value::Dictionary(repr) => {
                let entries = repr.entries.read().clone();
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                for key in keys {
                    h = fnv1a(h, key.as_bytes());
                    h = entries[key.as_str()].hash_fold(h)?;
                }
                Ok(h)
            }
            Value::Error(e) => {
                h = fnv1a(h, &e.code.to_le_bytes());
                h = fnv1a(h, e.message.as_bytes());
                if let Some(extra) = &e.extra {
                    h = extra.hash_fold(h)?;
                }
                Ok(h)
            }
        }
    }

    /// Render a human-readable description of the value tree.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out);
        out
    }

    fn describe_into(&self, out: &mut String) {
        use std::fmt::Write;

        match &*self.value {
            Value::Null => out.push_str("null"),
            Value::Bool(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::Int64(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::Uint64(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::Double(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::Date(v) => {
                let _ = write!(out, "<date {}us>", v);
            }
            Value::String(v) => {
                let _ = write!(out, "{:?}", v);
            }
            Value::Binary(v) => {
                let _ = write!(out, "<binary {} bytes>", v.len());
            }
            Value::Fd(v) => {
                let _ = write!(out, "<{:?}>", v);
            }
            Value::Shmem(v) => {
                let _ = write!(out, "<shmem {} bytes at {}>", v.size, v.offset);
            }
            Value::Array(repr) => {
                out.push('[');
                let items = repr.items.read().clone();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.describe_into(out);
                }
                out.push(']');
            }
            Value::Dictionary(repr) => {
                out.push('{');
                let entries = repr.entries.read().clone();
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{:?}: ", key);
                    item.describe_into(out);
                }
                out.push('}');
            }
            Value::Error(e) => {
                let _ = write!(out, "<error {} {:?}", e.code, e.message);
                let stack = e.stack.read();
                if !stack.is_empty() {
                    let _ = write!(out, ", {} stack frames", stack.len());
                }
                out.push('>');
            }
        }
    }

    /// Collect duplicated descriptors for out-of-band transfer, in pre-order.
    ///
    /// The traversal order here must match the index assignment performed by
    /// the msgpack serializer.
    pub(crate) fn collect_attachments(&self, out: &mut Vec<OwnedFd>) -> Result<()> {
        match &*self.value {
            Value::Fd(fd) => {
                out.push(fd.dup()?);
                Ok(())
            }
            Value::Shmem(shmem) => {
                out.push(shmem.fd.dup()?);
                Ok(())
            }
            Value::Array(repr) => {
                let items = repr.items.read().clone();
                for item in &items {
                    item.collect_attachments(out)?;
                }
                Ok(())
            }
            Value::Dictionary(repr) => {
                let entries = repr.entries.read().clone();
                for item in entries.values() {
                    item.collect_attachments(out)?;
                }
                Ok(())
            }
            Value::Error(e) => {
                if let Some(extra) = &e.extra {
                    extra.collect_attachments(out)?;
                }
                let stack = e.stack.read().clone();
                for frame in &stack {
                    frame.collect_attachments(out)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rebuild the tree, replacing descriptor attachment indices with the
    /// descriptors received out-of-band.
    pub(crate) fn resolve_attachments(&self, fds: &mut [Option<OwnedFd>]) -> Result<Object> {
        match &*self.value {
            Value::Fd(fd) => match fd.as_index() {
                Some(idx) => Ok(Object::fd_value(FdValue::owned(take_attachment(fds, idx)?))),
                None => Ok(self.clone()),
            },
            Value::Shmem(shmem) => match shmem.fd.as_index() {
                Some(idx) => Ok(Object::shmem_value(ShmemValue {
                    fd: FdValue::owned(take_attachment(fds, idx)?),
                    size: shmem.size,
                    offset: shmem.offset,
                })),
                None => Ok(self.clone()),
            },
            Value::Array(repr) => {
                let items = repr.items.read().clone();
                let resolved = items
                    .iter()
                    .map(|item| item.resolve_attachments(fds))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Object::array(resolved))
            }
            Value::Dictionary(repr) => {
                let entries = repr.entries.read().clone();
                let dict = Object::dictionary();
                for (key, item) in entries.iter() {
                    dict.set_key(key, item.resolve_attachments(fds)?)?;
                }
                Ok(dict)
            }
            Value::Error(e) => {
                let extra = match &e.extra {
                    Some(extra) => Some(extra.resolve_attachments(fds)?),
                    None => None,
                };
                let stack = e
                    .stack
                    .read()
                    .iter()
                    .map(|frame| frame.resolve_attachments(fds))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Object::error_full(e.code, e.message.clone(), extra, stack))
            }
            _ => Ok(self.clone()),
        }
    }
}

fn take_attachment(fds: &mut [Option<OwnedFd>], idx: u32) -> Result<OwnedFd> {
    fds.get_mut(idx as usize)
        .and_then(|slot| slot.take())
        .ok_or_else(|| {
            RpcError::internal(format!("frame is missing descriptor attachment {}", idx))
        })
}

impl From<RpcError> for Object {
    fn from(err: RpcError) -> Self {
        let extra = Object::dict_from([("kind", Object::string(err.kind().as_str()))]);
        Object::error_with_extra(err.kind().wire_code(), err.message(), extra)
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (&*self.value, &*other.value) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Uint64(a), Value::Uint64(b)) => a == b,
            // Self-describing codecs cannot preserve signedness of
            // non-negative integers, so the two integer tags compare by value.
            (Value::Int64(a), Value::Uint64(b)) => *a >= 0 && *a as u64 == *b,
            (Value::Uint64(a), Value::Int64(b)) => *b >= 0 && *b as u64 == *a,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Fd(a), Value::Fd(b)) => a == b,
            (Value::Shmem(a), Value::Shmem(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                let a = a.items.read().clone();
                let b = b.items.read().clone();
                a == b
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                // Dictionaries compare as unordered key-value maps.
                let a = a.entries.read().clone();
                let b = b.entries.read().clone();
                a.len() == b.len()
                    && a.iter().all(|(key, item)| b.get(key).is_some_and(|o| o == item))
            }
            (Value::Error(a), Value::Error(b)) => {
                a.code == b.code
                    && a.message == b.message
                    && a.extra == b.extra
                    && *a.stack.read() == *b.stack.read()
            }
            _ => false,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Object::boolean(v)
    }
}

impl From<i32> for Object {
    fn from(v: i32) -> Self {
        Object::int64(v as i64)
    }
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Object::int64(v)
    }
}

impl From<u64> for Object {
    fn from(v: u64) -> Self {
        Object::uint64(v)
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Object::double(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Object::string(v)
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Object::string(v)
    }
}

impl From<Bytes> for Object {
    fn from(v: Bytes) -> Self {
        Object::binary(v)
    }
}

impl From<Vec<Object>> for Object {
    fn from(v: Vec<Object>) -> Self {
        Object::array(v)
    }
}

/// Iterator over array elements.
///
/// Yields `Err(concurrent-mutation)` once, then stops, if the array is
/// mutated between `next` calls.
pub struct ArrayIter {
    obj: Object,
    pos: usize,
    version: u64,
    failed: bool,
}

impl Iterator for ArrayIter {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Value::Array(repr) = &*self.obj.value else {
            return None;
        };
        let items = repr.items.read();
        if repr.version.load(Ordering::Acquire) != self.version {
            self.failed = true;
            let err = RpcError::concurrent_mutation("array mutated during iteration");
            set_last_error(err.clone());
            return Some(Err(err));
        }
        let item = items.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(item))
    }
}

/// Iterator over dictionary entries in insertion order.
pub struct DictIter {
    obj: Object,
    pos: usize,
    version: u64,
    failed: bool,
}

impl Iterator for DictIter {
    type Item = Result<(String, Object)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Value::Dictionary(repr) = &*self.obj.value else {
            return None;
        };
        let entries = repr.entries.read();
        if repr.version.load(Ordering::Acquire) != self.version {
            self.failed = true;
            let err = RpcError::concurrent_mutation("dictionary mutated during iteration");
            set_last_error(err.clone());
            return Some(Err(err));
        }
        let (key, item) = entries.get_index(self.pos)?;
        let out = (key.clone(), item.clone());
        self.pos += 1;
        Some(Ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_accessors() {
        assert!(Object::null().is_null());
        assert!(Object::boolean(true).as_bool().unwrap());
        assert_eq!(Object::int64(-5).as_i64().unwrap(), -5);
        assert_eq!(Object::uint64(7).as_u64().unwrap(), 7);
        assert_eq!(Object::double(1.5).as_f64().unwrap(), 1.5);
        assert_eq!(Object::date(123).as_date().unwrap(), 123);
        assert_eq!(Object::string("hi").as_str().unwrap(), "hi");
        assert_eq!(
            Object::binary(Bytes::from_static(b"abc")).as_bytes().unwrap(),
            Bytes::from_static(b"abc")
        );
    }

    #[test]
    fn accessor_type_mismatch() {
        let err = Object::string("nope").as_i64().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(last_error_kind(), Some(ErrorKind::TypeMismatch));
    }

    fn last_error_kind() -> Option<ErrorKind> {
        crate::error::last_error().map(|e| e.kind())
    }

    #[test]
    fn integer_accessors_cross_signedness() {
        assert_eq!(Object::uint64(5).as_i64().unwrap(), 5);
        assert_eq!(Object::int64(5).as_u64().unwrap(), 5);
        assert!(Object::uint64(u64::MAX).as_i64().is_err());
        assert!(Object::int64(-1).as_u64().is_err());
    }

    #[test]
    fn array_operations() {
        let arr = Object::array(vec![Object::int64(1), Object::int64(2)]);
        arr.append(Object::int64(3)).unwrap();
        assert_eq!(arr.len().unwrap(), 3);

        arr.set_index(0, Object::boolean(true)).unwrap();
        assert!(arr.get_index(0).unwrap().as_bool().unwrap());

        let removed = arr.remove_index(0).unwrap();
        assert!(removed.as_bool().unwrap());
        assert_eq!(arr.get_index(0).unwrap().as_i64().unwrap(), 2);

        assert!(arr.set_index(10, Object::null()).is_err());
        assert!(arr.remove_index(10).is_err());
    }

    #[test]
    fn dictionary_operations() {
        let dict = Object::dictionary();
        dict.set_key("a", Object::int64(1)).unwrap();
        dict.set_key("b", Object::int64(2)).unwrap();

        assert_eq!(dict.get_key("a").unwrap().as_i64().unwrap(), 1);
        assert_eq!(dict.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        assert!(dict.remove_key("a").unwrap().is_some());
        assert!(dict.get_key("a").is_none());
        assert!(dict.remove_key("a").unwrap().is_none());
    }

    #[test]
    fn dictionary_preserves_insertion_order() {
        let dict = Object::dictionary();
        dict.set_key("z", Object::int64(1)).unwrap();
        dict.set_key("a", Object::int64(2)).unwrap();
        dict.set_key("m", Object::int64(3)).unwrap();

        let keys: Vec<String> = dict
            .dict_iter()
            .unwrap()
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn structural_equality() {
        let a = Object::dict_from([
            ("x", Object::int64(1)),
            ("y", Object::array(vec![Object::string("s"), Object::null()])),
        ]);
        let b = Object::dict_from([
            ("y", Object::array(vec![Object::string("s"), Object::null()])),
            ("x", Object::int64(1)),
        ]);
        // Dictionaries compare unordered.
        assert_eq!(a, b);

        let c = Object::array(vec![Object::int64(1), Object::int64(2)]);
        let d = Object::array(vec![Object::int64(2), Object::int64(1)]);
        // Arrays compare element-wise in order.
        assert_ne!(c, d);
    }

    #[test]
    fn integer_tags_compare_by_value() {
        assert_eq!(Object::int64(42), Object::uint64(42));
        assert_ne!(Object::int64(-1), Object::uint64(u64::MAX));
    }

    #[test]
    fn refcount_tracks_handles() {
        let obj = Object::string("shared");
        assert_eq!(obj.refcount(), 1);
        let clone = obj.clone();
        assert_eq!(obj.refcount(), 2);
        drop(clone);
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn child_refcount_drops_with_parent() {
        let child = Object::string("child");
        let arr = Object::array(vec![child.clone()]);
        assert_eq!(child.refcount(), 2);
        drop(arr);
        assert_eq!(child.refcount(), 1);
    }

    #[test]
    fn hash_stable_and_order_sensitive() {
        let a = Object::array(vec![Object::int64(1), Object::int64(2)]);
        let b = Object::array(vec![Object::int64(1), Object::int64(2)]);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());

        let c = Object::array(vec![Object::int64(2), Object::int64(1)]);
        assert_ne!(a.hash().unwrap(), c.hash().unwrap());
    }

    #[test]
    fn hash_dictionary_key_order_independent() {
        let a = Object::dict_from([("x", Object::int64(1)), ("y", Object::int64(2))]);
        let b = Object::dict_from([("y", Object::int64(2)), ("x", Object::int64(1))]);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn hash_refuses_identityless_values() {
        let err = Object::binary(Bytes::from_static(b"x")).hash().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);
    }

    #[test]
    fn iteration_detects_mutation() {
        let arr = Object::array(vec![Object::int64(1), Object::int64(2), Object::int64(3)]);
        let mut iter = arr.array_iter().unwrap();

        assert!(iter.next().unwrap().is_ok());
        arr.append(Object::int64(4)).unwrap();

        let err = iter.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);
        assert!(iter.next().is_none());
    }

    #[test]
    fn error_stack_appends() {
        let err = Object::error(38, "It broke!");
        err.error_append_frame("a.rs", 10, "fun_a").unwrap();
        err.error_append_frame("b.rs", 20, "fun_b").unwrap();

        let stack = err.error_stack().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(
            stack[0].get_key("function").unwrap().as_str().unwrap(),
            "fun_a"
        );
        assert_eq!(err.error_code().unwrap(), 38);
        assert_eq!(err.error_message().unwrap(), "It broke!");
    }

    #[test]
    fn rpc_error_object_roundtrip() {
        let obj: Object = RpcError::not_found("no such method").into();
        let err = obj.to_rpc_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "no such method");
    }

    #[test]
    fn describe_renders_tree() {
        let obj = Object::dict_from([
            ("hello", Object::string("world")),
            ("n", Object::array(vec![Object::int64(1), Object::boolean(false)])),
        ]);
        let s = obj.describe();
        assert!(s.contains("\"hello\""));
        assert!(s.contains("\"world\""));
        assert!(s.contains("[1, false]"));
    }
}
