//! Lossless class file model for load-time rewriting.
//!
//! Unlike a read-only decoder, everything the agent does not touch is kept as
//! raw bytes: attribute payloads, field tables and UTF-8 constants (in the
//! JVM's modified UTF-8). Parsing a class and writing it back without edits
//! reproduces the input byte-for-byte, so only the methods the agent rewrites
//! can differ from what the class loader handed over.

use std::fmt;
use thiserror::Error;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// First class file version whose verifier requires `StackMapTable`.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8 in constant pool entry {0}")]
    InvalidUtf8(u16),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("{0} trailing bytes after class file")]
    TrailingBytes(usize),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("method code of {0} bytes exceeds 65535")]
    CodeTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}

/// A field or a method; both share the same layout in the class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

/// An attribute with its payload left undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpInfo {
    /// Raw modified UTF-8 bytes.
    Utf8(Vec<u8>),
    Integer(i32),
    /// IEEE 754 bits, kept exact so NaN payloads survive a rewrite.
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl CpInfo {
    /// Long and Double occupy two constant pool slots.
    fn width(&self) -> usize {
        match self {
            CpInfo::Long(_) | CpInfo::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        // index 0 is unused
        Self { entries: vec![None] }
    }
}

impl ConstantPool {
    /// The `constant_pool_count` value: one more than the highest index.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<String, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(bytes) => decode_modified_utf8(bytes).ok_or(ClassFileError::InvalidUtf8(index)),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Internal name (`java/lang/String`) of a `CONSTANT_Class` entry.
    pub fn get_class_name(&self, index: u16) -> Result<String, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &CpInfo)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as u16, e)))
    }

    pub fn find(&self, entry: &CpInfo) -> Option<u16> {
        self.iter().find(|(_, e)| *e == entry).map(|(i, _)| i)
    }

    pub fn push(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        let index = self.entries.len();
        if index + entry.width() > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let wide = entry.width() == 2;
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    /// Returns the index of an equal entry, adding one if none exists.
    pub fn intern(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        match self.find(&entry) {
            Some(index) => Ok(index),
            None => self.push(entry),
        }
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        self.intern(CpInfo::Utf8(encode_modified_utf8(value)))
    }

    pub fn class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(internal_name)?;
        self.intern(CpInfo::Class { name_index })
    }

    pub fn string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.utf8(value)?;
        self.intern(CpInfo::String { string_index })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        self.intern(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.intern(CpInfo::Fieldref { class_index, name_and_type_index })
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.intern(CpInfo::Methodref { class_index, name_and_type_index })
    }
}

/// Encodes a string in the JVM's modified UTF-8: NUL becomes `C0 80` and
/// supplementary characters are written as two encoded surrogates.
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let cont = |k: usize| bytes.get(i + k).filter(|c| *c & 0xC0 == 0x80).map(|c| u16::from(c & 0x3F));
        if b & 0x80 == 0 && b != 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push((u16::from(b & 0x1F) << 6) | cont(1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            units.push((u16::from(b & 0x0F) << 12) | (cont(1)? << 6) | cont(2)?);
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

impl fmt::Display for ClassFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.class_name().unwrap_or_else(|_| "<invalid>".to_string());
        write!(
            f,
            "{} (version {}.{}, {} constants, {} methods)",
            name,
            self.major_version,
            self.minor_version,
            self.constant_pool.count(),
            self.methods.len()
        )
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u8(&mut self) -> Result<u64, ClassFileError> {
        let high = u64::from(self.read_u4()?);
        let low = u64::from(self.read_u4()?);
        Ok((high << 32) | low)
    }
}

/// Big-endian output helpers shared by every serializer in the crate.
pub(crate) trait WriteBe {
    fn put_u1(&mut self, v: u8);
    fn put_u2(&mut self, v: u16);
    fn put_u4(&mut self, v: u32);
}

impl WriteBe for Vec<u8> {
    fn put_u1(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u2(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u4(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields = parse_members(&mut r)?;
        let methods = parse_members(&mut r)?;
        let attributes = parse_attributes(&mut r)?;

        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u4(MAGIC);
        out.put_u2(self.minor_version);
        out.put_u2(self.major_version);

        out.put_u2(self.constant_pool.count() as u16);
        for entry in self.constant_pool.entries.iter().flatten() {
            write_constant(&mut out, entry);
        }

        out.put_u2(self.access_flags);
        out.put_u2(self.this_class);
        out.put_u2(self.super_class);

        out.put_u2(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            out.put_u2(*interface);
        }

        write_members(&mut out, &self.fields);
        write_members(&mut out, &self.methods);
        write_attributes(&mut out, &self.attributes);
        out
    }

    /// Internal name of this class, e.g. `java/net/InetAddress`.
    pub fn class_name(&self) -> Result<String, ClassFileError> {
        self.constant_pool.get_class_name(self.this_class)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn member_name(&self, member: &MemberInfo) -> Result<String, ClassFileError> {
        self.constant_pool.get_utf8(member.name_index)
    }

    pub fn member_descriptor(&self, member: &MemberInfo) -> Result<String, ClassFileError> {
        self.constant_pool.get_utf8(member.descriptor_index)
    }

    /// Name of an attribute, used to pick `Code` out of a method's attributes.
    pub fn attribute_name(&self, attribute: &AttributeInfo) -> Result<String, ClassFileError> {
        self.constant_pool.get_utf8(attribute.name_index)
    }

    /// Decodes the `Code` attribute of a method, if it has one.
    pub fn method_code(&self, method: &MemberInfo) -> Result<Option<CodeAttribute>, ClassFileError> {
        for attribute in &method.attributes {
            if self.attribute_name(attribute)? == "Code" {
                return CodeAttribute::parse(&attribute.info).map(Some);
            }
        }
        Ok(None)
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut pool = ConstantPool { entries: Vec::with_capacity(count) };
    pool.entries.push(None);

    while pool.entries.len() < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(r.read_bytes(len)?.to_vec())
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(r.read_u4()?),
            5 => CpInfo::Long(r.read_u8()? as i64),
            6 => CpInfo::Double(r.read_u8()?),
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        let wide = entry.width() == 2;
        pool.entries.push(Some(entry));
        if wide {
            pool.entries.push(None);
        }
    }

    if pool.entries.len() != count.max(1) {
        // a Long/Double in the last slot overran the declared count
        return Err(ClassFileError::InvalidConstantPoolIndex(count as u16));
    }
    Ok(pool)
}

fn write_constant(out: &mut Vec<u8>, entry: &CpInfo) {
    match entry {
        CpInfo::Utf8(bytes) => {
            out.put_u1(1);
            out.put_u2(bytes.len() as u16);
            out.extend_from_slice(bytes);
        }
        CpInfo::Integer(v) => {
            out.put_u1(3);
            out.put_u4(*v as u32);
        }
        CpInfo::Float(bits) => {
            out.put_u1(4);
            out.put_u4(*bits);
        }
        CpInfo::Long(v) => {
            out.put_u1(5);
            out.extend_from_slice(&v.to_be_bytes());
        }
        CpInfo::Double(bits) => {
            out.put_u1(6);
            out.extend_from_slice(&bits.to_be_bytes());
        }
        CpInfo::Class { name_index } => {
            out.put_u1(7);
            out.put_u2(*name_index);
        }
        CpInfo::String { string_index } => {
            out.put_u1(8);
            out.put_u2(*string_index);
        }
        CpInfo::Fieldref { class_index, name_and_type_index } => {
            out.put_u1(9);
            out.put_u2(*class_index);
            out.put_u2(*name_and_type_index);
        }
        CpInfo::Methodref { class_index, name_and_type_index } => {
            out.put_u1(10);
            out.put_u2(*class_index);
            out.put_u2(*name_and_type_index);
        }
        CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
            out.put_u1(11);
            out.put_u2(*class_index);
            out.put_u2(*name_and_type_index);
        }
        CpInfo::NameAndType { name_index, descriptor_index } => {
            out.put_u1(12);
            out.put_u2(*name_index);
            out.put_u2(*descriptor_index);
        }
        CpInfo::MethodHandle { reference_kind, reference_index } => {
            out.put_u1(15);
            out.put_u1(*reference_kind);
            out.put_u2(*reference_index);
        }
        CpInfo::MethodType { descriptor_index } => {
            out.put_u1(16);
            out.put_u2(*descriptor_index);
        }
        CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
            out.put_u1(17);
            out.put_u2(*bootstrap_method_attr_index);
            out.put_u2(*name_and_type_index);
        }
        CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
            out.put_u1(18);
            out.put_u2(*bootstrap_method_attr_index);
            out.put_u2(*name_and_type_index);
        }
        CpInfo::Module { name_index } => {
            out.put_u1(19);
            out.put_u2(*name_index);
        }
        CpInfo::Package { name_index } => {
            out.put_u1(20);
            out.put_u2(*name_index);
        }
    }
}

fn parse_members(r: &mut Reader) -> Result<Vec<MemberInfo>, ClassFileError> {
    let count = r.read_u2()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = r.read_u2()?;
        let name_index = r.read_u2()?;
        let descriptor_index = r.read_u2()?;
        let attributes = parse_attributes(r)?;
        members.push(MemberInfo { access_flags, name_index, descriptor_index, attributes });
    }
    Ok(members)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo]) {
    out.put_u2(members.len() as u16);
    for member in members {
        out.put_u2(member.access_flags);
        out.put_u2(member.name_index);
        out.put_u2(member.descriptor_index);
        write_attributes(out, &member.attributes);
    }
}

fn parse_attributes(r: &mut Reader) -> Result<Vec<AttributeInfo>, ClassFileError> {
    let count = r.read_u2()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let len = r.read_u4()? as usize;
        let info = r.read_bytes(len)?.to_vec();
        attributes.push(AttributeInfo { name_index, info });
    }
    Ok(attributes)
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[AttributeInfo]) {
    out.put_u2(attributes.len() as u16);
    for attribute in attributes {
        out.put_u2(attribute.name_index);
        out.put_u4(attribute.info.len() as u32);
        out.extend_from_slice(&attribute.info);
    }
}

// =============================================================================
// Code attribute
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero catches everything (`finally`).
    pub catch_type: u16,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_len = r.read_u4()? as usize;
        let code = r.read_bytes(code_len)?.to_vec();

        let table_len = r.read_u2()?;
        let mut exception_table = Vec::with_capacity(table_len as usize);
        for _ in 0..table_len {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }

        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("Code".to_string()));
        }
        Ok(Self { max_stack, max_locals, code, exception_table, attributes })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        if self.code.is_empty() || self.code.len() > u16::MAX as usize {
            return Err(ClassFileError::CodeTooLarge(self.code.len()));
        }
        let mut out = Vec::new();
        out.put_u2(self.max_stack);
        out.put_u2(self.max_locals);
        out.put_u4(self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out.put_u2(self.exception_table.len() as u16);
        for entry in &self.exception_table {
            out.put_u2(entry.start_pc);
            out.put_u2(entry.end_pc);
            out.put_u2(entry.handler_pc);
            out.put_u2(entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes);
        Ok(out)
    }
}

// =============================================================================
// StackMapTable
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationType },
    Chop { offset_delta: u16, k: u8 },
    Append { offset_delta: u16, locals: Vec<VerificationType> },
    Full { offset_delta: u16, locals: Vec<VerificationType>, stack: Vec<VerificationType> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// `CONSTANT_Class` index.
    Object(u16),
    /// Offset of the `new` instruction.
    Uninitialized(u16),
}

pub fn parse_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: u16::from(frame_type) },
            64..=127 => StackMapFrame::SameLocals1StackItem {
                offset_delta: u16::from(frame_type - 64),
                stack: parse_verification_type(&mut r)?,
            },
            247 => StackMapFrame::SameLocals1StackItem {
                offset_delta: r.read_u2()?,
                stack: parse_verification_type(&mut r)?,
            },
            248..=250 => StackMapFrame::Chop { offset_delta: r.read_u2()?, k: 251 - frame_type },
            251 => StackMapFrame::Same { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let mut locals = Vec::new();
                for _ in 0..(frame_type - 251) {
                    locals.push(parse_verification_type(&mut r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let locals_len = r.read_u2()?;
                let mut locals = Vec::with_capacity(locals_len as usize);
                for _ in 0..locals_len {
                    locals.push(parse_verification_type(&mut r)?);
                }
                let stack_len = r.read_u2()?;
                let mut stack = Vec::with_capacity(stack_len as usize);
                for _ in 0..stack_len {
                    stack.push(parse_verification_type(&mut r)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute(format!("StackMapTable frame type {frame_type}"))),
        };
        frames.push(frame);
    }
    Ok(frames)
}

fn parse_verification_type(r: &mut Reader) -> Result<VerificationType, ClassFileError> {
    let tag = r.read_u1()?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(r.read_u2()?),
        8 => VerificationType::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute(format!("verification type tag {tag}"))),
    })
}

/// Serializes frames, always choosing the explicit extended encodings.
pub fn write_stack_map_table(frames: &[StackMapFrame]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u2(frames.len() as u16);
    for frame in frames {
        match frame {
            StackMapFrame::Same { offset_delta } => {
                out.put_u1(251);
                out.put_u2(*offset_delta);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
                out.put_u1(247);
                out.put_u2(*offset_delta);
                write_verification_type(&mut out, stack);
            }
            StackMapFrame::Chop { offset_delta, k } => {
                out.put_u1(251 - k);
                out.put_u2(*offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                out.put_u1(251 + locals.len() as u8);
                out.put_u2(*offset_delta);
                for local in locals {
                    write_verification_type(&mut out, local);
                }
            }
            StackMapFrame::Full { offset_delta, locals, stack } => {
                out.put_u1(255);
                out.put_u2(*offset_delta);
                out.put_u2(locals.len() as u16);
                for local in locals {
                    write_verification_type(&mut out, local);
                }
                out.put_u2(stack.len() as u16);
                for item in stack {
                    write_verification_type(&mut out, item);
                }
            }
        }
    }
    out
}

fn write_verification_type(out: &mut Vec<u8>, ty: &VerificationType) {
    match ty {
        VerificationType::Top => out.put_u1(0),
        VerificationType::Integer => out.put_u1(1),
        VerificationType::Float => out.put_u1(2),
        VerificationType::Double => out.put_u1(3),
        VerificationType::Long => out.put_u1(4),
        VerificationType::Null => out.put_u1(5),
        VerificationType::UninitializedThis => out.put_u1(6),
        VerificationType::Object(index) => {
            out.put_u1(7);
            out.put_u2(*index);
        }
        VerificationType::Uninitialized(offset) => {
            out.put_u1(8);
            out.put_u2(*offset);
        }
    }
}
