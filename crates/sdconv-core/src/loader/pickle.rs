//! Restricted pickle interpreter for PyTorch checkpoints.
//!
//! Only the opcodes `torch.save` emits are understood. Nothing is imported or
//! executed: `GLOBAL` produces a name, and `REDUCE` only has meaning for the
//! handful of torch/collections callables needed to rebuild a state dict.
//! Every other call is kept as an opaque [`Object::Reduce`] value.

use crate::config::LoaderConfig;
use std::collections::HashMap;

/// A value on the pickle stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    /// Dict entries in insertion order
    Dict(Vec<(Object, Object)>),
    Global {
        module: String,
        name: String,
    },
    /// Storage reference resolved from a persistent id
    Storage(StorageRef),
    Tensor(TensorRef),
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        object: Box<Object>,
        state: Box<Object>,
    },
}

/// `('storage', torch.XStorage, key, location, numel)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    /// Storage class name, e.g. `FloatStorage`
    pub storage_type: String,
    /// Entry name under `<archive>/data/`
    pub key: String,
    pub numel: u64,
}

/// Arguments of `torch._utils._rebuild_tensor_v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRef {
    pub storage: StorageRef,
    /// Offset into the storage, in elements
    pub storage_offset: u64,
    /// Row-major sizes, outermost first
    pub size: Vec<u64>,
    pub stride: Vec<u64>,
}

impl TensorRef {
    /// `None` if the sizes multiply past `u64::MAX`.
    pub fn numel(&self) -> Option<u64> {
        self.size.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }

    /// Row-major contiguous, ignoring strides of size-1 dimensions.
    pub fn is_contiguous(&self) -> bool {
        if self.size.len() != self.stride.len() {
            return false;
        }
        let mut expected = 1u64;
        for (&size, &stride) in self.size.iter().zip(&self.stride).rev() {
            if size != 1 && stride != expected {
                return false;
            }
            expected = expected.saturating_mul(size);
        }
        true
    }
}

impl Object {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Object::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    fn as_u64_tuple(&self) -> Option<Vec<u64>> {
        match self {
            Object::Tuple(items) | Object::List(items) => {
                items.iter().map(Object::as_u64).collect()
            }
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Object> {
        match self {
            Object::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Error raised while interpreting a pickle stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickleError(pub String);

impl std::fmt::Display for PickleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pickle: {}", self.0)
    }
}

impl std::error::Error for PickleError {}

type PickleResult<T> = std::result::Result<T, PickleError>;

fn err<T>(message: impl Into<String>) -> PickleResult<T> {
    Err(PickleError(message.into()))
}

mod op {
    pub const PROTO: u8 = 0x80;
    pub const FRAME: u8 = 0x95;
    pub const STOP: u8 = b'.';
    pub const MARK: u8 = b'(';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const EMPTY_DICT: u8 = b'}';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const DICT: u8 = b'd';
    pub const LIST: u8 = b'l';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const MEMOIZE: u8 = 0x94;
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG1: u8 = 0x8a;
    pub const BINFLOAT: u8 = b'G';
    pub const BINUNICODE: u8 = b'X';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const GLOBAL: u8 = b'c';
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const REDUCE: u8 = b'R';
    pub const BUILD: u8 = b'b';
    pub const NEWOBJ: u8 = 0x81;
    pub const BINPERSID: u8 = b'Q';
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';
}

enum Slot {
    Mark,
    Value(Object),
}

struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Slot>,
    memo: HashMap<u32, Object>,
}

/// Run a pickle stream to its `STOP` opcode and return the resulting object.
pub fn unpickle(data: &[u8]) -> PickleResult<Object> {
    if data.len() as u64 > LoaderConfig::MAX_PICKLE_BYTES {
        return err("stream too large");
    }
    let mut machine = Machine {
        data,
        pos: 0,
        stack: Vec::new(),
        memo: HashMap::new(),
    };
    machine.run()
}

impl<'a> Machine<'a> {
    fn take(&mut self, n: usize) -> PickleResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| PickleError(format!("truncated stream at byte {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> PickleResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> PickleResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> PickleResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> PickleResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn line(&mut self) -> PickleResult<String> {
        let rest = &self.data[self.pos..];
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            return err("unterminated GLOBAL name");
        };
        let text = std::str::from_utf8(&rest[..end])
            .map_err(|_| PickleError("GLOBAL name is not UTF-8".into()))?
            .to_string();
        self.pos += end + 1;
        Ok(text)
    }

    fn utf8(&mut self, len: u64) -> PickleResult<Object> {
        let len = usize::try_from(len).map_err(|_| PickleError("string too long".into()))?;
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| PickleError("string is not UTF-8".into()))?;
        Ok(Object::String(text.to_string()))
    }

    fn raw_bytes(&mut self, len: u64) -> PickleResult<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| PickleError("bytes too long".into()))?;
        Ok(self.take(len)?.to_vec())
    }

    fn push(&mut self, object: Object) {
        self.stack.push(Slot::Value(object));
    }

    fn pop(&mut self) -> PickleResult<Object> {
        match self.stack.pop() {
            Some(Slot::Value(v)) => Ok(v),
            Some(Slot::Mark) => err("unexpected MARK on stack"),
            None => err("stack underflow"),
        }
    }

    fn top_mut(&mut self) -> PickleResult<&mut Object> {
        match self.stack.last_mut() {
            Some(Slot::Value(v)) => Ok(v),
            _ => err("expected a value on top of the stack"),
        }
    }

    fn top(&self) -> PickleResult<Object> {
        match self.stack.last() {
            Some(Slot::Value(v)) => Ok(v.clone()),
            _ => err("expected a value on top of the stack"),
        }
    }

    /// Pop everything down to the most recent MARK.
    fn pop_mark(&mut self) -> PickleResult<Vec<Object>> {
        let mut items = Vec::new();
        loop {
            match self.stack.pop() {
                Some(Slot::Mark) => break,
                Some(Slot::Value(v)) => items.push(v),
                None => return err("MARK not found"),
            }
        }
        items.reverse();
        Ok(items)
    }

    fn memoize(&mut self, index: u32) -> PickleResult<()> {
        let value = self.top()?;
        self.memo.insert(index, value);
        Ok(())
    }

    fn memo_get(&mut self, index: u32) -> PickleResult<()> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| PickleError(format!("memo key {index} not found")))?;
        self.push(value);
        Ok(())
    }

    fn set_items(&mut self, items: Vec<Object>) -> PickleResult<()> {
        if items.len() % 2 != 0 {
            return err("odd number of SETITEMS arguments");
        }
        let target = self.top_mut()?;
        let Object::Dict(entries) = target else {
            return err("SETITEM on a non-dict");
        };
        let mut it = items.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            entries.push((k, v));
        }
        Ok(())
    }

    fn append_items(&mut self, items: Vec<Object>) -> PickleResult<()> {
        match self.top_mut()? {
            Object::List(list) => {
                list.extend(items);
                Ok(())
            }
            _ => err("APPEND on a non-list"),
        }
    }

    fn run(&mut self) -> PickleResult<Object> {
        loop {
            let opcode = self.u8()?;
            match opcode {
                op::PROTO => {
                    let version = self.u8()?;
                    if version > 5 {
                        return err(format!("unsupported protocol {version}"));
                    }
                }
                op::FRAME => {
                    self.u64()?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.stack.push(Slot::Mark),
                op::POP => {
                    self.stack.pop();
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?;
                    self.push(top);
                }
                op::EMPTY_DICT => self.push(Object::Dict(Vec::new())),
                op::EMPTY_LIST => self.push(Object::List(Vec::new())),
                op::EMPTY_TUPLE => self.push(Object::Tuple(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    self.push(Object::Dict(Vec::new()));
                    self.set_items(items)?;
                }
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Object::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Object::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(self.pop()?);
                    }
                    items.reverse();
                    self.push(Object::Tuple(items));
                }
                op::BINPUT => {
                    let index = self.u8()? as u32;
                    self.memoize(index)?;
                }
                op::LONG_BINPUT => {
                    let index = self.u32()?;
                    self.memoize(index)?;
                }
                op::MEMOIZE => {
                    let index = self.memo.len() as u32;
                    self.memoize(index)?;
                }
                op::BINGET => {
                    let index = self.u8()? as u32;
                    self.memo_get(index)?;
                }
                op::LONG_BINGET => {
                    let index = self.u32()?;
                    self.memo_get(index)?;
                }
                op::BININT => {
                    let v = self.u32()? as i32;
                    self.push(Object::Int(v as i64));
                }
                op::BININT1 => {
                    let v = self.u8()?;
                    self.push(Object::Int(v as i64));
                }
                op::BININT2 => {
                    let v = self.u16()?;
                    self.push(Object::Int(v as i64));
                }
                op::LONG1 => {
                    let n = self.u8()? as usize;
                    if n > 8 {
                        return err("LONG1 wider than 64 bits");
                    }
                    let bytes = self.take(n)?;
                    let mut value: i64 = 0;
                    for (i, &b) in bytes.iter().enumerate() {
                        value |= (b as i64) << (8 * i);
                    }
                    // Sign-extend
                    if n > 0 && n < 8 && bytes[n - 1] & 0x80 != 0 {
                        value -= 1i64 << (8 * n);
                    }
                    self.push(Object::Int(value));
                }
                op::BINFLOAT => {
                    let b = self.take(8)?;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(b);
                    self.push(Object::Float(f64::from_be_bytes(buf)));
                }
                op::BINUNICODE => {
                    let len = self.u32()? as u64;
                    let s = self.utf8(len)?;
                    self.push(s);
                }
                op::SHORT_BINUNICODE => {
                    let len = self.u8()? as u64;
                    let s = self.utf8(len)?;
                    self.push(s);
                }
                op::BINUNICODE8 => {
                    let len = self.u64()?;
                    let s = self.utf8(len)?;
                    self.push(s);
                }
                op::BINSTRING => {
                    let len = self.u32()? as u64;
                    let s = self.utf8(len)?;
                    self.push(s);
                }
                op::SHORT_BINSTRING => {
                    let len = self.u8()? as u64;
                    let s = self.utf8(len)?;
                    self.push(s);
                }
                op::BINBYTES => {
                    let len = self.u32()? as u64;
                    let b = self.raw_bytes(len)?;
                    self.push(Object::Bytes(b));
                }
                op::SHORT_BINBYTES => {
                    let len = self.u8()? as u64;
                    let b = self.raw_bytes(len)?;
                    self.push(Object::Bytes(b));
                }
                op::NONE => self.push(Object::None),
                op::NEWTRUE => self.push(Object::Bool(true)),
                op::NEWFALSE => self.push(Object::Bool(false)),
                op::GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.push(Object::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Object::String(module), Object::String(name)) => {
                            self.push(Object::Global { module, name })
                        }
                        _ => return err("STACK_GLOBAL needs two strings"),
                    }
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    let storage = storage_from_pid(pid)?;
                    self.push(Object::Storage(storage));
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(callable, args)?;
                    self.push(value);
                }
                op::NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let value = reduce(class, args)?;
                    self.push(value);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    let object = self.pop()?;
                    let value = match object {
                        // OrderedDict and tensors carry no state we need
                        Object::Dict(_) | Object::Tensor(_) => object,
                        other => Object::Build {
                            object: Box::new(other),
                            state: Box::new(state),
                        },
                    };
                    self.push(value);
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }
                op::APPEND => {
                    let value = self.pop()?;
                    self.append_items(vec![value])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.append_items(items)?;
                }
                other => {
                    return err(format!(
                        "unsupported opcode 0x{other:02x} at byte {}",
                        self.pos - 1
                    ))
                }
            }
        }
    }
}

fn storage_from_pid(pid: Object) -> PickleResult<StorageRef> {
    let Object::Tuple(items) = pid else {
        return err("persistent id is not a tuple");
    };
    match items.as_slice() {
        [Object::String(kind), Object::Global { name, .. }, key, _location, numel, ..]
            if kind == "storage" =>
        {
            let key = match key {
                Object::String(s) => s.clone(),
                Object::Int(i) => i.to_string(),
                _ => return err("storage key is not a string"),
            };
            Ok(StorageRef {
                storage_type: name.clone(),
                key,
                numel: numel.as_u64().unwrap_or(0),
            })
        }
        _ => err("unrecognized persistent id"),
    }
}

fn is_global(object: &Object, module: &str, name: &str) -> bool {
    matches!(object, Object::Global { module: m, name: n } if m == module && n == name)
}

fn reduce(callable: Object, args: Object) -> PickleResult<Object> {
    if is_global(&callable, "collections", "OrderedDict") {
        return Ok(Object::Dict(Vec::new()));
    }

    if is_global(&callable, "torch._utils", "_rebuild_tensor_v2")
        || is_global(&callable, "torch._utils", "_rebuild_tensor")
    {
        let Object::Tuple(items) = &args else {
            return err("_rebuild_tensor arguments are not a tuple");
        };
        let [Object::Storage(storage), offset, size, stride, ..] = items.as_slice() else {
            return err("_rebuild_tensor expects (storage, offset, size, stride, ...)");
        };
        let tensor = TensorRef {
            storage: storage.clone(),
            storage_offset: offset
                .as_u64()
                .ok_or_else(|| PickleError("bad storage offset".into()))?,
            size: size
                .as_u64_tuple()
                .ok_or_else(|| PickleError("bad tensor size".into()))?,
            stride: stride
                .as_u64_tuple()
                .ok_or_else(|| PickleError("bad tensor stride".into()))?,
        };
        return Ok(Object::Tensor(tensor));
    }

    if is_global(&callable, "torch._utils", "_rebuild_parameter") {
        if let Object::Tuple(items) = &args {
            if let Some(inner @ Object::Tensor(_)) = items.first() {
                return Ok(inner.clone());
            }
        }
        return err("_rebuild_parameter without a tensor");
    }

    Ok(Object::Reduce {
        callable: Box::new(callable),
        args: Box::new(args),
    })
}
