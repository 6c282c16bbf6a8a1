//! Textual pack/unpack format for building and destructuring [`Object`] trees.
//!
//! A format string describes a shape; `pack` consumes a list of raw arguments
//! and returns a freshly built tree, `unpack` walks an existing tree and
//! writes decoded leaves back into caller-provided slots.
//!
//! Tokens:
//!
//! | token | meaning |
//! |---|---|
//! | `n` | null |
//! | `b` | bool |
//! | `i` | int64 |
//! | `u` | uint64 |
//! | `d` | double |
//! | `s` | UTF-8 string |
//! | `f` | file descriptor |
//! | `v` | Object, verbatim |
//! | `'text'` | inline string literal, consumes no argument |
//! | `[ ... ]` | array of the listed tokens |
//! | `{ ... }` | dictionary; `key:tok` pairs, bare tokens take their key from the preceding argument |
//! | `<name>tok` | apply the registered typed schema `name` to the following token |
//! | `N:tok` | (array context) place the element at explicit index N |

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::error::{Result, RpcError, set_last_error};
use crate::object::Object;

/// One raw argument consumed by [`pack`].
#[derive(Debug, Clone)]
pub enum PackArg {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Fd(RawFd),
    Object(Object),
    /// A dictionary key for a bare token.
    Key(String),
}

impl PackArg {
    pub fn key(key: impl Into<String>) -> Self {
        PackArg::Key(key.into())
    }

    pub fn fd(raw: RawFd) -> Self {
        PackArg::Fd(raw)
    }
}

impl From<bool> for PackArg {
    fn from(v: bool) -> Self {
        PackArg::Bool(v)
    }
}

impl From<i32> for PackArg {
    fn from(v: i32) -> Self {
        PackArg::Int(v as i64)
    }
}

impl From<i64> for PackArg {
    fn from(v: i64) -> Self {
        PackArg::Int(v)
    }
}

impl From<u64> for PackArg {
    fn from(v: u64) -> Self {
        PackArg::Uint(v)
    }
}

impl From<f64> for PackArg {
    fn from(v: f64) -> Self {
        PackArg::Double(v)
    }
}

impl From<&str> for PackArg {
    fn from(v: &str) -> Self {
        PackArg::Str(v.to_owned())
    }
}

impl From<String> for PackArg {
    fn from(v: String) -> Self {
        PackArg::Str(v)
    }
}

impl From<Object> for PackArg {
    fn from(v: Object) -> Self {
        PackArg::Object(v)
    }
}

/// Build a `Vec<PackArg>` from a mixed argument list.
#[macro_export]
macro_rules! pack_args {
    () => { Vec::<$crate::PackArg>::new() };
    ($($arg:expr),+ $(,)?) => { vec![$($crate::PackArg::from($arg)),+] };
}

/// A caller-provided destination for one [`unpack`] leaf.
#[derive(Debug)]
pub enum UnpackSlot<'a> {
    Bool(&'a mut bool),
    Int(&'a mut i64),
    Uint(&'a mut u64),
    Double(&'a mut f64),
    Str(&'a mut String),
    Fd(&'a mut RawFd),
    Object(&'a mut Option<Object>),
    /// A dictionary key for a bare token.
    Key(String),
    /// Consume the matching leaf without writing anywhere.
    Skip,
}

impl<'a> From<&'a mut bool> for UnpackSlot<'a> {
    fn from(v: &'a mut bool) -> Self {
        UnpackSlot::Bool(v)
    }
}

impl<'a> From<&'a mut i64> for UnpackSlot<'a> {
    fn from(v: &'a mut i64) -> Self {
        UnpackSlot::Int(v)
    }
}

impl<'a> From<&'a mut u64> for UnpackSlot<'a> {
    fn from(v: &'a mut u64) -> Self {
        UnpackSlot::Uint(v)
    }
}

impl<'a> From<&'a mut f64> for UnpackSlot<'a> {
    fn from(v: &'a mut f64) -> Self {
        UnpackSlot::Double(v)
    }
}

impl<'a> From<&'a mut String> for UnpackSlot<'a> {
    fn from(v: &'a mut String) -> Self {
        UnpackSlot::Str(v)
    }
}

impl<'a> From<&'a mut Option<Object>> for UnpackSlot<'a> {
    fn from(v: &'a mut Option<Object>) -> Self {
        UnpackSlot::Object(v)
    }
}

/// Validator applied by `<name>` schema tokens.
pub type SchemaValidator = Arc<dyn Fn(&Object) -> Result<()> + Send + Sync>;

static SCHEMAS: LazyLock<RwLock<HashMap<String, SchemaValidator>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a typed schema usable through `<name>` format tokens.
pub fn register_schema(name: &str, validator: SchemaValidator) {
    SCHEMAS.write().insert(name.to_owned(), validator);
}

/// Whether a typed schema with the given name is registered.
pub fn schema_exists(name: &str) -> bool {
    SCHEMAS.read().contains_key(name)
}

fn validate_schema(name: &str, obj: &Object) -> Result<()> {
    let validator = SCHEMAS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| RpcError::invalid_arguments(format!("unknown typed schema {:?}", name)))?;
    validator(obj).map_err(|err| {
        RpcError::invalid_arguments(format!("schema {:?} rejected value: {}", name, err))
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(fmt: &'a str) -> Self {
        Cursor {
            bytes: fmt.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    /// Consume characters until `stop`, failing at end of input.
    fn take_until(&mut self, stop: u8, what: &str) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.bytes.get(self.pos) {
            if *b == stop {
                let text = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| RpcError::invalid_arguments("format string is not UTF-8"))?
                    .to_owned();
                self.pos += 1;
                return Ok(text);
            }
            self.pos += 1;
        }
        Err(RpcError::invalid_arguments(format!(
            "unterminated {} in format string",
            what
        )))
    }

    /// Try to consume `word:`; restores the cursor when the input is not an
    /// explicit key.
    fn try_key(&mut self) -> Option<String> {
        self.skip_ws();
        let save = self.pos;
        let start = self.pos;
        while let Some(b) = self.bytes.get(self.pos) {
            if b": ,{}[]<>'".contains(b) {
                break;
            }
            self.pos += 1;
        }
        let word = &self.bytes[start..self.pos];
        self.skip_ws();
        if !word.is_empty() && self.bytes.get(self.pos) == Some(&b':') {
            self.pos += 1;
            return Some(String::from_utf8_lossy(word).into_owned());
        }
        self.pos = save;
        None
    }
}

/// Build an [`Object`] tree from a format string and an argument list.
pub fn pack(fmt: &str, args: Vec<PackArg>) -> Result<Object> {
    let mut cursor = Cursor::new(fmt);
    let mut args = args.into_iter();
    let obj = pack_value(&mut cursor, &mut args)?;
    if !cursor.at_end() {
        return Err(RpcError::invalid_arguments(format!(
            "trailing characters in format string {:?}",
            fmt
        )));
    }
    Ok(obj)
}

fn next_arg(args: &mut std::vec::IntoIter<PackArg>) -> Result<PackArg> {
    args.next()
        .ok_or_else(|| RpcError::invalid_arguments("not enough arguments for format string"))
}

fn pack_value(cursor: &mut Cursor<'_>, args: &mut std::vec::IntoIter<PackArg>) -> Result<Object> {
    let Some(token) = cursor.peek() else {
        return Err(RpcError::invalid_arguments("empty format string"));
    };

    match token {
        b'<' => {
            cursor.advance();
            let name = cursor.take_until(b'>', "schema name")?;
            let obj = pack_value(cursor, args)?;
            validate_schema(&name, &obj)?;
            Ok(obj)
        }
        b'\'' => {
            cursor.advance();
            let text = cursor.take_until(b'\'', "string literal")?;
            Ok(Object::string(text))
        }
        b'[' => {
            cursor.advance();
            pack_array(cursor, args)
        }
        b'{' => {
            cursor.advance();
            pack_dict(cursor, args)
        }
        b'n' => {
            cursor.advance();
            Ok(Object::null())
        }
        b'b' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Bool(v) => Ok(Object::boolean(v)),
                other => Err(arg_mismatch("b", &other)),
            }
        }
        b'i' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Int(v) => Ok(Object::int64(v)),
                PackArg::Uint(v) if v <= i64::MAX as u64 => Ok(Object::int64(v as i64)),
                other => Err(arg_mismatch("i", &other)),
            }
        }
        b'u' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Uint(v) => Ok(Object::uint64(v)),
                PackArg::Int(v) if v >= 0 => Ok(Object::uint64(v as u64)),
                other => Err(arg_mismatch("u", &other)),
            }
        }
        b'd' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Double(v) => Ok(Object::double(v)),
                other => Err(arg_mismatch("d", &other)),
            }
        }
        b's' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Str(v) | PackArg::Key(v) => Ok(Object::string(v)),
                other => Err(arg_mismatch("s", &other)),
            }
        }
        b'f' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Fd(raw) => Ok(Object::fd(raw, false)),
                PackArg::Int(raw) => Ok(Object::fd(raw as RawFd, false)),
                other => Err(arg_mismatch("f", &other)),
            }
        }
        b'v' => {
            cursor.advance();
            match next_arg(args)? {
                PackArg::Object(v) => Ok(v),
                PackArg::Null => Ok(Object::null()),
                other => Err(arg_mismatch("v", &other)),
            }
        }
        other => Err(RpcError::invalid_arguments(format!(
            "unexpected character {:?} in format string",
            other as char
        ))),
    }
}

fn arg_mismatch(token: &str, arg: &PackArg) -> RpcError {
    RpcError::invalid_arguments(format!(
        "format token {:?} does not accept argument {:?}",
        token, arg
    ))
}

fn pack_array(cursor: &mut Cursor<'_>, args: &mut std::vec::IntoIter<PackArg>) -> Result<Object> {
    let arr = Object::array(Vec::new());
    loop {
        match cursor.peek() {
            Some(b']') => {
                cursor.advance();
                return Ok(arr);
            }
            Some(_) => {
                let index = try_explicit_index(cursor);
                let value = pack_value(cursor, args)?;
                match index {
                    Some(idx) => {
                        while arr.len()? < idx {
                            arr.append(Object::null())?;
                        }
                        arr.set_index(idx, value)?;
                    }
                    None => arr.append(value)?,
                }
                match cursor.peek() {
                    Some(b',') => {
                        cursor.advance();
                    }
                    Some(b']') => {}
                    _ => {
                        return Err(RpcError::invalid_arguments(
                            "expected ',' or ']' in array format",
                        ));
                    }
                }
            }
            None => return Err(RpcError::invalid_arguments("unterminated array format")),
        }
    }
}

fn try_explicit_index(cursor: &mut Cursor<'_>) -> Option<usize> {
    cursor.skip_ws();
    let save = cursor.pos;
    let start = cursor.pos;
    while cursor
        .bytes
        .get(cursor.pos)
        .is_some_and(|b| b.is_ascii_digit())
    {
        cursor.pos += 1;
    }
    if cursor.pos > start && cursor.bytes.get(cursor.pos) == Some(&b':') {
        let digits = std::str::from_utf8(&cursor.bytes[start..cursor.pos]).ok()?;
        cursor.pos += 1;
        return digits.parse().ok();
    }
    cursor.pos = save;
    None
}

fn pack_dict(cursor: &mut Cursor<'_>, args: &mut std::vec::IntoIter<PackArg>) -> Result<Object> {
    let dict = Object::dictionary();
    loop {
        match cursor.peek() {
            Some(b'}') => {
                cursor.advance();
                return Ok(dict);
            }
            Some(_) => {
                let key = match cursor.try_key() {
                    Some(key) => key,
                    // Bare token: the key comes from the preceding argument.
                    None => match next_arg(args)? {
                        PackArg::Key(key) | PackArg::Str(key) => key,
                        other => {
                            return Err(RpcError::invalid_arguments(format!(
                                "expected dictionary key argument, found {:?}",
                                other
                            )));
                        }
                    },
                };
                let value = pack_value(cursor, args)?;
                dict.set_key(&key, value)?;
                match cursor.peek() {
                    Some(b',') => {
                        cursor.advance();
                    }
                    Some(b'}') => {}
                    _ => {
                        return Err(RpcError::invalid_arguments(
                            "expected ',' or '}' in dictionary format",
                        ));
                    }
                }
            }
            None => {
                return Err(RpcError::invalid_arguments("unterminated dictionary format"));
            }
        }
    }
}

/// Walk `obj` following the format string, writing decoded leaves into
/// `slots`.
///
/// Returns the number of slots populated. A dictionary key absent from the
/// input leaves its destination untouched; a type mismatch aborts the
/// enclosing subtree, records the thread-local last error, and the returned
/// count reflects what was written before the failure.
pub fn unpack(obj: &Object, fmt: &str, slots: &mut [UnpackSlot<'_>]) -> usize {
    let mut cursor = Cursor::new(fmt);
    let mut state = Unpacker { slots, next: 0, count: 0 };
    let _ = unpack_value(&mut cursor, &mut state, Some(obj));
    state.count
}

struct Unpacker<'s, 'a> {
    slots: &'s mut [UnpackSlot<'a>],
    next: usize,
    count: usize,
}

impl<'a> Unpacker<'_, 'a> {
    fn take_slot(&mut self) -> Option<&mut UnpackSlot<'a>> {
        let slot = self.slots.get_mut(self.next);
        if slot.is_some() {
            self.next += 1;
        }
        slot
    }
}

/// Marker for an aborted subtree.
struct Abort;

fn mismatch_abort(token: &str, obj: &Object) -> Abort {
    set_last_error(RpcError::type_mismatch(format!(
        "unpack token {:?} does not match {} value",
        token,
        obj.tag()
    )));
    Abort
}

fn unpack_value(
    cursor: &mut Cursor<'_>,
    state: &mut Unpacker<'_, '_>,
    obj: Option<&Object>,
) -> Result<(), Abort> {
    let Some(token) = cursor.peek() else {
        return Err(Abort);
    };

    match token {
        b'<' => {
            cursor.advance();
            let Ok(name) = cursor.take_until(b'>', "schema name") else {
                return Err(Abort);
            };
            if let Some(obj) = obj {
                if let Err(err) = validate_schema(&name, obj) {
                    set_last_error(err);
                    return Err(Abort);
                }
            }
            unpack_value(cursor, state, obj)
        }
        b'\'' => {
            cursor.advance();
            let _ = cursor.take_until(b'\'', "string literal");
            Ok(())
        }
        b'[' => {
            cursor.advance();
            unpack_array(cursor, state, obj)
        }
        b'{' => {
            cursor.advance();
            unpack_dict(cursor, state, obj)
        }
        b'n' => {
            cursor.advance();
            Ok(())
        }
        b'b' => {
            cursor.advance();
            unpack_leaf(state, obj, "b", |slot, obj| match slot {
                UnpackSlot::Bool(dst) => {
                    **dst = obj.as_bool().ok()?;
                    Some(())
                }
                UnpackSlot::Skip => obj.as_bool().ok().map(|_| ()),
                _ => None,
            })
        }
        b'i' => {
            cursor.advance();
            unpack_leaf(state, obj, "i", |slot, obj| match slot {
                UnpackSlot::Int(dst) => {
                    **dst = obj.as_i64().ok()?;
                    Some(())
                }
                UnpackSlot::Skip => obj.as_i64().ok().map(|_| ()),
                _ => None,
            })
        }
        b'u' => {
            cursor.advance();
            unpack_leaf(state, obj, "u", |slot, obj| match slot {
                UnpackSlot::Uint(dst) => {
                    **dst = obj.as_u64().ok()?;
                    Some(())
                }
                UnpackSlot::Skip => obj.as_u64().ok().map(|_| ()),
                _ => None,
            })
        }
        b'd' => {
            cursor.advance();
            unpack_leaf(state, obj, "d", |slot, obj| match slot {
                UnpackSlot::Double(dst) => {
                    **dst = obj.as_f64().ok()?;
                    Some(())
                }
                UnpackSlot::Skip => obj.as_f64().ok().map(|_| ()),
                _ => None,
            })
        }
        b's' => {
            cursor.advance();
            unpack_leaf(state, obj, "s", |slot, obj| match slot {
                UnpackSlot::Str(dst) => {
                    **dst = obj.as_str().ok()?.to_owned();
                    Some(())
                }
                UnpackSlot::Skip => obj.as_str().ok().map(|_| ()),
                _ => None,
            })
        }
        b'f' => {
            cursor.advance();
            unpack_leaf(state, obj, "f", |slot, obj| match slot {
                UnpackSlot::Fd(dst) => {
                    **dst = obj.fd_raw().ok()?;
                    Some(())
                }
                UnpackSlot::Skip => obj.fd_raw().ok().map(|_| ()),
                _ => None,
            })
        }
        b'v' => {
            cursor.advance();
            unpack_leaf(state, obj, "v", |slot, obj| match slot {
                UnpackSlot::Object(dst) => {
                    **dst = Some(obj.clone());
                    Some(())
                }
                UnpackSlot::Skip => Some(()),
                _ => None,
            })
        }
        _ => {
            set_last_error(RpcError::invalid_arguments(format!(
                "unexpected character {:?} in format string",
                token as char
            )));
            Err(Abort)
        }
    }
}

fn unpack_leaf(
    state: &mut Unpacker<'_, '_>,
    obj: Option<&Object>,
    token: &str,
    write: impl FnOnce(&mut UnpackSlot<'_>, &Object) -> Option<()>,
) -> Result<(), Abort> {
    let Some(slot) = state.take_slot() else {
        set_last_error(RpcError::invalid_arguments(
            "not enough slots for format string",
        ));
        return Err(Abort);
    };
    // Missing input (absent dictionary key) leaves the slot untouched.
    let Some(obj) = obj else {
        return Ok(());
    };
    match write(slot, obj) {
        Some(()) => {
            state.count += 1;
            Ok(())
        }
        None => Err(mismatch_abort(token, obj)),
    }
}

fn unpack_array(
    cursor: &mut Cursor<'_>,
    state: &mut Unpacker<'_, '_>,
    obj: Option<&Object>,
) -> Result<(), Abort> {
    let arr = match obj {
        Some(obj) => {
            if obj.tag() != crate::object::Tag::Array {
                // Consume the rest of this container so that sibling tokens
                // keep their slot alignment, then abort the subtree.
                let _ = skip_container(cursor, b']');
                return Err(mismatch_abort("[", obj));
            }
            Some(obj)
        }
        None => None,
    };

    let mut pos = 0usize;
    let mut aborted = false;
    loop {
        match cursor.peek() {
            Some(b']') => {
                cursor.advance();
                // A failed element aborts the array subtree only.
                return Ok(());
            }
            Some(_) => {
                let index = try_explicit_index(cursor).unwrap_or(pos);
                let element = if aborted {
                    None
                } else {
                    arr.and_then(|a| a.get_index(index))
                };
                if unpack_value(cursor, state, element.as_ref()).is_err() {
                    aborted = true;
                }
                pos = index + 1;
                match cursor.peek() {
                    Some(b',') => {
                        cursor.advance();
                    }
                    Some(b']') => {}
                    _ => return Err(Abort),
                }
            }
            None => return Err(Abort),
        }
    }
}

fn unpack_dict(
    cursor: &mut Cursor<'_>,
    state: &mut Unpacker<'_, '_>,
    obj: Option<&Object>,
) -> Result<(), Abort> {
    let dict = match obj {
        Some(obj) => {
            if obj.tag() != crate::object::Tag::Dictionary {
                let _ = skip_container(cursor, b'}');
                return Err(mismatch_abort("{", obj));
            }
            Some(obj)
        }
        None => None,
    };

    let mut aborted = false;
    loop {
        match cursor.peek() {
            Some(b'}') => {
                cursor.advance();
                return Ok(());
            }
            Some(_) => {
                let key = match cursor.try_key() {
                    Some(key) => key,
                    None => match state.take_slot() {
                        Some(UnpackSlot::Key(key)) => key.clone(),
                        _ => {
                            set_last_error(RpcError::invalid_arguments(
                                "expected dictionary key slot",
                            ));
                            return Err(Abort);
                        }
                    },
                };
                let element = if aborted {
                    None
                } else {
                    dict.and_then(|d| d.get_key(&key))
                };
                if unpack_value(cursor, state, element.as_ref()).is_err() {
                    aborted = true;
                }
                match cursor.peek() {
                    Some(b',') => {
                        cursor.advance();
                    }
                    Some(b'}') => {}
                    _ => return Err(Abort),
                }
            }
            None => return Err(Abort),
        }
    }
}

/// Consume the remaining tokens of a container after a mismatch.
fn skip_container(cursor: &mut Cursor<'_>, close: u8) -> Result<(), Abort> {
    let mut depth = 1;
    while let Some(b) = cursor.advance() {
        match b {
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth -= 1;
                if depth == 0 && b == close {
                    return Ok(());
                }
                if depth == 0 {
                    return Ok(());
                }
            }
            b'\'' => {
                let _ = cursor.take_until(b'\'', "string literal");
            }
            _ => {}
        }
    }
    Err(Abort)
}

impl Object {
    /// See [`pack`].
    pub fn pack(fmt: &str, args: Vec<PackArg>) -> Result<Object> {
        pack(fmt, args)
    }

    /// See [`unpack`].
    pub fn unpack(&self, fmt: &str, slots: &mut [UnpackSlot<'_>]) -> usize {
        unpack(self, fmt, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn pack_scalars_in_array() {
        let obj = pack("[s,i,b,n]", pack_args!["world", 123, true]).unwrap();
        assert_eq!(obj.len().unwrap(), 4);
        assert_eq!(obj.get_index(0).unwrap().as_str().unwrap(), "world");
        assert_eq!(obj.get_index(1).unwrap().as_i64().unwrap(), 123);
        assert!(obj.get_index(2).unwrap().as_bool().unwrap());
        assert!(obj.get_index(3).unwrap().is_null());
    }

    #[test]
    fn pack_dict_with_explicit_and_bare_keys() {
        let obj = pack(
            "{inline:'inline_string',s,uint:u}",
            pack_args!["hello", "world", 0x80808080u64],
        )
        .unwrap();
        assert_eq!(
            obj.get_key("inline").unwrap().as_str().unwrap(),
            "inline_string"
        );
        assert_eq!(obj.get_key("hello").unwrap().as_str().unwrap(), "world");
        assert_eq!(obj.get_key("uint").unwrap().as_u64().unwrap(), 0x80808080);
    }

    #[test]
    fn pack_explicit_array_index_pads_with_null() {
        let obj = pack("['inline',i,5:i]", pack_args![1, 3]).unwrap();
        assert_eq!(obj.len().unwrap(), 6);
        assert_eq!(obj.get_index(1).unwrap().as_i64().unwrap(), 1);
        assert!(obj.get_index(2).unwrap().is_null());
        assert_eq!(obj.get_index(5).unwrap().as_i64().unwrap(), 3);
    }

    #[test]
    fn pack_verbatim_object() {
        let nested = Object::dict_from([("key", Object::int64(11234))]);
        let obj = pack("[v]", pack_args![nested.clone()]).unwrap();
        assert_eq!(obj.get_index(0).unwrap(), nested);
    }

    #[test]
    fn pack_exhausted_arguments() {
        let err = pack("[i,i]", pack_args![1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn unpack_mixed_template() {
        let obj = pack(
            "[s,i,b,{key:i}]",
            pack_args!["world", 123, true, 11234],
        )
        .unwrap();

        let mut s = String::new();
        let mut num = 0i64;
        let mut sure = false;
        let mut dict_num = 0i64;
        let count = unpack(
            &obj,
            "[s,i,b,{key:i}]",
            &mut [
                UnpackSlot::Str(&mut s),
                UnpackSlot::Int(&mut num),
                UnpackSlot::Bool(&mut sure),
                UnpackSlot::Int(&mut dict_num),
            ],
        );

        assert_eq!(count, 4);
        assert_eq!(s, "world");
        assert_eq!(num, 123);
        assert!(sure);
        assert_eq!(dict_num, 11234);
    }

    #[test]
    fn unpack_missing_key_leaves_slot_untouched() {
        let obj = pack("{key:i}", pack_args![7]).unwrap();

        let mut absent: Option<Object> = None;
        let mut num = 0i64;
        let count = unpack(
            &obj,
            "{nonexistent:v,key:i}",
            &mut [UnpackSlot::Object(&mut absent), UnpackSlot::Int(&mut num)],
        );

        assert_eq!(count, 1);
        assert!(absent.is_none());
        assert_eq!(num, 7);
    }

    #[test]
    fn unpack_mismatch_aborts_subtree_and_sets_last_error() {
        crate::error::clear_last_error();
        let obj = pack("[s,s,i]", pack_args!["a", "not a number", 3]).unwrap();

        let mut first = String::new();
        let mut second = 0i64;
        let mut third = 0i64;
        let count = unpack(
            &obj,
            "[s,i,i]",
            &mut [
                UnpackSlot::Str(&mut first),
                UnpackSlot::Int(&mut second),
                UnpackSlot::Int(&mut third),
            ],
        );

        assert_eq!(count, 1);
        assert_eq!(first, "a");
        assert_eq!(second, 0);
        assert_eq!(third, 0);
        assert_eq!(
            crate::error::last_error().map(|e| e.kind()),
            Some(ErrorKind::TypeMismatch)
        );
    }

    #[test]
    fn schema_token_validates() {
        register_schema(
            "positive",
            Arc::new(|obj: &Object| {
                if obj.as_i64()? > 0 {
                    Ok(())
                } else {
                    Err(RpcError::invalid_arguments("must be positive"))
                }
            }),
        );

        assert!(pack("[<positive>i]", pack_args![5]).is_ok());
        let err = pack("[<positive>i]", pack_args![-5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn unknown_schema_fails() {
        let err = pack("[<missing-schema>i]", pack_args![5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
