//! Bytecode realisation of [`ClassEditor`]: weaving in place.
//!
//! A selected method keeps its name, index, flags and every non-`Code`
//! attribute, so the JVM still sees the caller's own frame directly below
//! it and stack traces are unchanged. Its body is re-emitted with:
//!
//! ```text
//!  original code, with each xRETURN replaced by
//!      store result
//!  S:  <success line>                     try { ... } catch (Throwable) -> P
//!      load result; xRETURN
//!  P:  pop; load result; xRETURN
//!  ...
//!  H:  astore ex                          original range [0, H) -> H
//!  F:  <failure line>                     try { ... } catch (Throwable) -> Q
//!      aload ex; athrow
//!  Q:  pop; aload ex; athrow
//! ```
//!
//! Branches, switch tables, exception ranges, line and local variable tables
//! and the `StackMapTable` of the original are carried over to the new
//! offsets. The original's own handlers run first; the catch-all only sees
//! what escapes them. Exceptions raised while logging are dropped; the
//! caller sees the original result or the original exception.

use crate::bytecode::{self, op, BytecodeError, Branch, Fixup, Instruction, OffsetMap};
use crate::classfile::{
    parse_stack_map_table, write_stack_map_table, AttributeInfo, ClassFile, ClassFileError, CodeAttribute,
    ConstantPool, ExceptionTableEntry, StackMapFrame, VerificationType, WriteBe, ACC_ABSTRACT, ACC_NATIVE,
    ACC_STATIC, STACK_MAP_MAJOR_VERSION,
};
use crate::descriptor::{JvmType, MethodDescriptor, TypeResolutionError};
use crate::editor::ClassEditor;
use crate::error::AgentError;
use crate::fragment::{Fragment, Piece, TIMESTAMP_PATTERN};
use std::collections::BTreeMap;
use thiserror::Error;

const THROWABLE: &str = "java/lang/Throwable";
const STRING_BUILDER: &str = "java/lang/StringBuilder";

/// Why one method could not be woven.
#[derive(Debug, Error)]
enum WeaveError {
    #[error("{0} methods have no body to instrument")]
    NoBody(&'static str),
    #[error("already instrumented")]
    AlreadyPlanned,
    #[error("log line refers to argument {index} of a method taking {arity}")]
    NoSuchArgument { index: usize, arity: usize },
    #[error("log line expects {expected} where the method has {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("log line uses the {0}, which is not available on this path")]
    Unavailable(&'static str),
    #[error("max_locals {max_locals} is smaller than the {arg_slots} slots of the arguments")]
    TooFewLocals { max_locals: u16, arg_slots: u16 },
    #[error("instrumented method needs more {0} than a class file allows")]
    Overflow(&'static str),
    #[error("malformed stack map: {0}")]
    StackMap(&'static str),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error(transparent)]
    Descriptor(#[from] TypeResolutionError),
}

#[derive(Debug, Clone, Default)]
struct Plan {
    success: Option<Fragment>,
    /// Failure line and the internal name of the caught class.
    failure: Option<(Fragment, String)>,
    /// Replacement `Code` attribute.
    woven: Option<AttributeInfo>,
}

/// [`ClassEditor`] over a parsed [`ClassFile`].
///
/// Bodies are woven when a fragment is planned so that size and
/// verification problems surface as errors for that one method. Every weave
/// starts again from the untouched original body; [`ClassEditor::to_bytecode`]
/// only swaps the `Code` attributes.
#[derive(Debug, Clone)]
pub struct ClassFileEditor {
    class: ClassFile,
    name: String,
    plans: BTreeMap<usize, Plan>,
}

impl ClassFileEditor {
    pub fn new(class: ClassFile) -> Result<Self, ClassFileError> {
        let name = class.class_name()?.replace('/', ".");
        Ok(Self { class, name, plans: BTreeMap::new() })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        Self::new(ClassFile::parse(bytes)?)
    }

    pub fn class_file(&self) -> &ClassFile {
        &self.class
    }

    fn method_label(&self, method: usize) -> String {
        let name_and_desc = self.class.methods.get(method).and_then(|m| {
            let name = self.class.member_name(m).ok()?;
            let desc = self.class.member_descriptor(m).ok()?;
            Some(format!("{name}{desc}"))
        });
        match name_and_desc {
            Some(method) => format!("{}.{}", self.name, method),
            None => format!("{}#{}", self.name, method),
        }
    }

    fn plan(&mut self, method: usize, update: impl FnOnce(&mut Plan) -> Result<(), WeaveError>) -> Result<(), AgentError> {
        let mut plan = self.plans.get(&method).cloned().unwrap_or_default();
        let woven = update(&mut plan).and_then(|()| self.weave(method, &plan));
        match woven {
            Ok(code) => {
                plan.woven = Some(code);
                self.plans.insert(method, plan);
                Ok(())
            }
            Err(e) => Err(AgentError::transform(self.method_label(method), e.to_string())),
        }
    }

    fn weave(&mut self, method: usize, plan: &Plan) -> Result<AttributeInfo, WeaveError> {
        let member = self
            .class
            .methods
            .get(method)
            .ok_or(ClassFileError::InvalidConstantPoolIndex(method as u16))?;
        let flags = member.access_flags;
        if flags & ACC_ABSTRACT != 0 {
            return Err(WeaveError::NoBody("abstract"));
        }
        if flags & ACC_NATIVE != 0 {
            return Err(WeaveError::NoBody("native"));
        }
        let descriptor = MethodDescriptor::parse(&self.class.member_descriptor(member)?)?;
        let original = self
            .class
            .method_code(member)?
            .ok_or_else(|| ClassFileError::InvalidAttribute("Code".to_string()))?;

        let mut debug_tables = Vec::new();
        let mut stack_map = None;
        for attribute in &original.attributes {
            match self.class.attribute_name(attribute)?.as_str() {
                "LineNumberTable" => debug_tables.push((attribute, false)),
                "LocalVariableTable" | "LocalVariableTypeTable" => debug_tables.push((attribute, true)),
                "StackMapTable" => stack_map = Some(parse_stack_map_table(&attribute.info)?),
                // anything else holds offsets this weave does not track
                _ => {}
            }
        }

        let this_class = self.class.this_class;
        let emit_frames = self.class.major_version >= STACK_MAP_MAJOR_VERSION;
        let is_static = flags & ACC_STATIC != 0;
        let instructions = bytecode::decode(&original.code)?;
        let mut b = CodeBuilder::new(&mut self.class.constant_pool);

        let mut slot: u16 = 0;
        let mut params = Vec::new();
        if !is_static {
            params.push(VerificationType::Object(this_class));
            slot = 1;
        }
        let mut args = Vec::with_capacity(descriptor.params.len());
        for ty in &descriptor.params {
            params.push(b.verification_type(ty)?);
            args.push((slot, ty.clone()));
            slot += ty.slots();
        }
        let arg_slots = slot;
        // the saved result or exception lives just past the original locals
        let base = original.max_locals;
        let spare = base
            .checked_sub(arg_slots)
            .ok_or(WeaveError::TooFewLocals { max_locals: base, arg_slots })?;
        let ret = &descriptor.ret;
        let returns_value = *ret != JvmType::Void;
        let throwable = b.pool.class(THROWABLE)?;

        let mut body_locals = params.clone();
        body_locals.extend(std::iter::repeat(VerificationType::Top).take(usize::from(spare)));
        let mut with_value = vec![VerificationType::Top; usize::from(base)];
        if returns_value {
            with_value.push(b.verification_type(ret)?);
        }
        let returned = LogLocals { args: &args, returned: returns_value.then_some((base, ret)), thrown: None };

        let mut map = OffsetMap::new(original.code.len());
        for insn in &instructions {
            map.set(insn.pc, b.pc());
            match &plan.success {
                Some(success) if insn.is_return() => {
                    b.depth = 0;
                    if returns_value {
                        b.store(ret, base);
                    }
                    let start = b.pc();
                    b.log(success, &returned)?;
                    let end = b.pc();
                    b.exit(ret, base, insn.opcode);
                    b.swallow(start, end, with_value.clone(), throwable);
                    b.exit(ret, base, insn.opcode);
                }
                _ => b.relocate(&original.code, insn),
            }
        }
        let body_end = b.pc();
        map.set(original.code.len(), body_end);

        let mut catch_all = None;
        if let Some((failure, caught)) = &plan.failure {
            let catch_type = b.pool.class(caught)?;
            catch_all = Some(Handler { start: 0, end: body_end, handler: body_end, catch_type });
            b.frame(body_locals.clone(), vec![VerificationType::Object(catch_type)]);
            b.store(&JvmType::Object(caught.clone()), base);

            let mut with_exception = body_locals;
            with_exception.push(VerificationType::Object(catch_type));
            let thrown = LogLocals { args: &args, returned: None, thrown: Some(base) };
            let start = b.pc();
            b.log(failure, &thrown)?;
            let end = b.pc();
            b.rethrow(base);
            b.swallow(start, end, with_exception, throwable);
            b.rethrow(base);
        }

        let CodeBuilder { pool, mut code, max_stack: added_stack, frames, handlers, fixups, .. } = b;
        map.apply(&mut code, &fixups)?;
        if code.len() > usize::from(u16::MAX) {
            return Err(ClassFileError::CodeTooLarge(code.len()).into());
        }

        // logging guards first so an enclosing handler of the original never sees their exceptions
        let mut exception_table = Vec::with_capacity(handlers.len() + original.exception_table.len() + 1);
        for handler in &handlers {
            exception_table.push(handler.entry()?);
        }
        for entry in &original.exception_table {
            exception_table.push(ExceptionTableEntry {
                start_pc: new_offset(&map, entry.start_pc)?,
                end_pc: new_offset(&map, entry.end_pc)?,
                handler_pc: new_offset(&map, entry.handler_pc)?,
                catch_type: entry.catch_type,
            });
        }
        if let Some(handler) = &catch_all {
            exception_table.push(handler.entry()?);
        }

        let mut attributes = Vec::new();
        for (attribute, ranged) in debug_tables {
            let info = remap_debug_table(&attribute.info, ranged, &map)?;
            attributes.push(AttributeInfo { name_index: attribute.name_index, info });
        }
        if emit_frames {
            let mut all = match &stack_map {
                Some(table) => absolute_frames(table, &params)?,
                None => Vec::new(),
            };
            for frame in &mut all {
                frame.remap(&map)?;
            }
            all.extend(frames);
            all.sort_by_key(|f| f.pc);
            all.dedup();
            if !all.is_empty() {
                let name_index = pool.utf8("StackMapTable")?;
                attributes.push(AttributeInfo { name_index, info: write_stack_map_table(&full_frames(&all)?) });
            }
        }

        let body = CodeAttribute {
            max_stack: original.max_stack.checked_add(added_stack).ok_or(WeaveError::Overflow("operand stack"))?,
            max_locals: base.checked_add(ret.slots().max(1)).ok_or(WeaveError::Overflow("local variables"))?,
            code,
            exception_table,
            attributes,
        };
        let name_index = pool.utf8("Code")?;
        Ok(AttributeInfo { name_index, info: body.to_bytes()? })
    }
}

impl ClassEditor for ClassFileEditor {
    type Method = usize;

    fn class_name(&self) -> String {
        self.name.clone()
    }

    fn find_method(&self, name: &str, params: &[JvmType]) -> Option<usize> {
        if name.starts_with('<') {
            return None;
        }
        self.class.methods.iter().position(|m| {
            self.class.member_name(m).is_ok_and(|n| n == name)
                && self
                    .class
                    .member_descriptor(m)
                    .ok()
                    .and_then(|d| MethodDescriptor::parse(&d).ok())
                    .is_some_and(|d| d.params == params)
        })
    }

    fn method_descriptor(&self, method: usize) -> Result<MethodDescriptor, AgentError> {
        let fail = |reason: String| AgentError::transform(self.method_label(method), reason);
        let member = self.class.methods.get(method).ok_or_else(|| fail("no such method".to_string()))?;
        let text = self.class.member_descriptor(member).map_err(|e| fail(e.to_string()))?;
        MethodDescriptor::parse(&text).map_err(|e| fail(e.to_string()))
    }

    fn insert_after(&mut self, method: usize, fragment: Fragment) -> Result<(), AgentError> {
        self.plan(method, |plan| match plan.success {
            Some(_) => Err(WeaveError::AlreadyPlanned),
            None => {
                plan.success = Some(fragment);
                Ok(())
            }
        })
    }

    fn add_catch(&mut self, method: usize, fragment: Fragment, exception_class: &str) -> Result<(), AgentError> {
        let caught = exception_class.replace('.', "/");
        self.plan(method, |plan| match plan.failure {
            Some(_) => Err(WeaveError::AlreadyPlanned),
            None => {
                plan.failure = Some((fragment, caught));
                Ok(())
            }
        })
    }

    fn revert(&mut self, method: usize) {
        self.plans.remove(&method);
    }

    fn to_bytecode(mut self) -> Result<Vec<u8>, ClassFileError> {
        for (&index, plan) in &self.plans {
            let Some(woven) = &plan.woven else { continue };
            let method = &self.class.methods[index];
            let mut position = None;
            for (i, attribute) in method.attributes.iter().enumerate() {
                if self.class.attribute_name(attribute)? == "Code" {
                    position = Some(i);
                }
            }
            let position = position.ok_or_else(|| ClassFileError::InvalidAttribute("Code".to_string()))?;
            self.class.methods[index].attributes[position] = woven.clone();
        }
        Ok(self.class.to_bytes())
    }
}

fn new_offset(map: &OffsetMap, old: u16) -> Result<u16, WeaveError> {
    let new = map.get(usize::from(old)).ok_or(BytecodeError::BadTarget(usize::from(old)))?;
    u16::try_from(new).map_err(|_| ClassFileError::CodeTooLarge(new).into())
}

/// Carries a `LineNumberTable` (4-byte entries) or a local variable table
/// (10-byte entries with a length) over to the new offsets. Entries that do
/// not start or end on an instruction are dropped.
fn remap_debug_table(info: &[u8], ranged: bool, map: &OffsetMap) -> Result<Vec<u8>, WeaveError> {
    let entry_len = if ranged { 10 } else { 4 };
    let malformed = || ClassFileError::InvalidAttribute("debug table".to_string());
    let (count, entries) = info.split_first_chunk::<2>().ok_or_else(malformed)?;
    if entries.len() != usize::from(u16::from_be_bytes(*count)) * entry_len {
        return Err(malformed().into());
    }

    let mut kept = Vec::new();
    for entry in entries.chunks_exact(entry_len) {
        let start = u16::from_be_bytes([entry[0], entry[1]]);
        let Ok(new_start) = new_offset(map, start) else { continue };
        let mut entry = entry.to_vec();
        entry[..2].copy_from_slice(&new_start.to_be_bytes());
        if ranged {
            let end = usize::from(start) + usize::from(u16::from_be_bytes([entry[2], entry[3]]));
            let Some(new_end) = u16::try_from(end).ok().and_then(|end| new_offset(map, end).ok()) else {
                continue;
            };
            entry[2..4].copy_from_slice(&(new_end - new_start).to_be_bytes());
        }
        kept.push(entry);
    }

    let mut out = Vec::with_capacity(2 + kept.len() * entry_len);
    out.put_u2(kept.len() as u16);
    for entry in kept {
        out.extend_from_slice(&entry);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    pc: usize,
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

impl Frame {
    fn remap(&mut self, map: &OffsetMap) -> Result<(), WeaveError> {
        self.pc = map.get(self.pc).ok_or(BytecodeError::BadTarget(self.pc))?;
        for ty in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if let VerificationType::Uninitialized(at) = ty {
                *at = new_offset(map, *at)?;
            }
        }
        Ok(())
    }
}

/// Expands a `StackMapTable` from its deltas into frames at absolute offsets.
fn absolute_frames(table: &[StackMapFrame], initial: &[VerificationType]) -> Result<Vec<Frame>, WeaveError> {
    let mut locals = initial.to_vec();
    let mut out = Vec::with_capacity(table.len());
    let mut previous: Option<usize> = None;
    for frame in table {
        let delta = usize::from(frame.offset_delta());
        let pc = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        previous = Some(pc);
        let stack = match frame {
            StackMapFrame::Same { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. } => vec![*stack],
            StackMapFrame::Chop { k, .. } => {
                let keep = locals
                    .len()
                    .checked_sub(usize::from(*k))
                    .ok_or(WeaveError::StackMap("chop removes more locals than there are"))?;
                locals.truncate(keep);
                Vec::new()
            }
            StackMapFrame::Append { locals: more, .. } => {
                locals.extend_from_slice(more);
                Vec::new()
            }
            StackMapFrame::Full { locals: all, stack, .. } => {
                locals.clone_from(all);
                stack.clone()
            }
        };
        out.push(Frame { pc, locals: locals.clone(), stack });
    }
    Ok(out)
}

/// Sorted frames back to a table of full frames.
fn full_frames(frames: &[Frame]) -> Result<Vec<StackMapFrame>, WeaveError> {
    let mut out = Vec::with_capacity(frames.len());
    let mut previous: Option<usize> = None;
    for frame in frames {
        let delta = match previous {
            None => Some(frame.pc),
            Some(prev) => frame.pc.checked_sub(prev + 1),
        };
        let offset_delta = delta
            .and_then(|d| u16::try_from(d).ok())
            .ok_or(WeaveError::StackMap("two different frames at one offset"))?;
        previous = Some(frame.pc);
        out.push(StackMapFrame::Full { offset_delta, locals: frame.locals.clone(), stack: frame.stack.clone() });
    }
    Ok(out)
}

/// `StringBuilder.append` overload used for a value of this type.
fn append_descriptor(ty: &JvmType) -> &'static str {
    match ty {
        JvmType::Boolean => "(Z)Ljava/lang/StringBuilder;",
        JvmType::Char => "(C)Ljava/lang/StringBuilder;",
        JvmType::Byte | JvmType::Short | JvmType::Int => "(I)Ljava/lang/StringBuilder;",
        JvmType::Long => "(J)Ljava/lang/StringBuilder;",
        JvmType::Float => "(F)Ljava/lang/StringBuilder;",
        JvmType::Double => "(D)Ljava/lang/StringBuilder;",
        _ => "(Ljava/lang/Object;)Ljava/lang/StringBuilder;",
    }
}

const APPEND_STRING: &str = "(Ljava/lang/String;)Ljava/lang/StringBuilder;";

/// Local variable slots a log line may read.
struct LogLocals<'a> {
    args: &'a [(u16, JvmType)],
    returned: Option<(u16, &'a JvmType)>,
    thrown: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    start: usize,
    end: usize,
    handler: usize,
    catch_type: u16,
}

impl Handler {
    fn entry(&self) -> Result<ExceptionTableEntry, ClassFileError> {
        let pc = |at: usize| u16::try_from(at).map_err(|_| ClassFileError::CodeTooLarge(at));
        Ok(ExceptionTableEntry {
            start_pc: pc(self.start)?,
            end_pc: pc(self.end)?,
            handler_pc: pc(self.handler)?,
            catch_type: self.catch_type,
        })
    }
}

/// Emits the new body. `depth` and `max_stack` count only what the added
/// code pushes on top of whatever the original had on the stack.
struct CodeBuilder<'p> {
    pool: &'p mut ConstantPool,
    code: Vec<u8>,
    depth: u16,
    max_stack: u16,
    frames: Vec<Frame>,
    handlers: Vec<Handler>,
    fixups: Vec<Fixup>,
}

impl<'p> CodeBuilder<'p> {
    fn new(pool: &'p mut ConstantPool) -> Self {
        Self {
            pool,
            code: Vec::new(),
            depth: 0,
            max_stack: 0,
            frames: Vec::new(),
            handlers: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn pc(&self) -> usize {
        self.code.len()
    }

    fn adjust(&mut self, popped: u16, pushed: u16) {
        self.depth = self.depth.saturating_sub(popped) + pushed;
        self.max_stack = self.max_stack.max(self.depth);
    }

    fn op(&mut self, opcode: u8) {
        self.code.push(opcode);
        match opcode {
            op::DUP => self.adjust(0, 1),
            op::POP | op::ATHROW | op::ARETURN | op::IRETURN | op::FRETURN => self.adjust(1, 0),
            op::LRETURN | op::DRETURN => self.adjust(2, 0),
            _ => {}
        }
    }

    fn op_u2(&mut self, opcode: u8, operand: u16) {
        self.code.push(opcode);
        self.code.extend_from_slice(&operand.to_be_bytes());
    }

    fn local(&mut self, opcode: u8, slot: u16) {
        match u8::try_from(slot) {
            Ok(slot) => self.code.extend_from_slice(&[opcode, slot]),
            Err(_) => {
                self.code.extend_from_slice(&[op::WIDE, opcode]);
                self.code.extend_from_slice(&slot.to_be_bytes());
            }
        }
    }

    fn load(&mut self, ty: &JvmType, slot: u16) {
        let opcode = match ty {
            JvmType::Long => op::LLOAD,
            JvmType::Float => op::FLOAD,
            JvmType::Double => op::DLOAD,
            JvmType::Object(_) | JvmType::Array(_) => op::ALOAD,
            _ => op::ILOAD,
        };
        self.local(opcode, slot);
        self.adjust(0, ty.slots());
    }

    fn store(&mut self, ty: &JvmType, slot: u16) {
        let opcode = match ty {
            JvmType::Long => op::LSTORE,
            JvmType::Float => op::FSTORE,
            JvmType::Double => op::DSTORE,
            JvmType::Object(_) | JvmType::Array(_) => op::ASTORE,
            _ => op::ISTORE,
        };
        self.local(opcode, slot);
        self.adjust(ty.slots(), 0);
    }

    fn invoke(&mut self, opcode: u8, method: u16, popped: u16, pushed: u16) {
        self.op_u2(opcode, method);
        self.adjust(popped, pushed);
    }

    /// `load result; xRETURN` with the return opcode the original used.
    fn exit(&mut self, ret: &JvmType, slot: u16, opcode: u8) {
        if *ret != JvmType::Void {
            self.load(ret, slot);
        }
        self.op(opcode);
    }

    fn rethrow(&mut self, slot: u16) {
        self.local(op::ALOAD, slot);
        self.adjust(0, 1);
        self.op(op::ATHROW);
    }

    fn ldc_string(&mut self, text: &str) -> Result<(), ClassFileError> {
        let index = self.pool.string(text)?;
        match u8::try_from(index) {
            Ok(index) => self.code.extend_from_slice(&[op::LDC, index]),
            Err(_) => self.op_u2(op::LDC_W, index),
        }
        self.adjust(0, 1);
        Ok(())
    }

    fn append(&mut self, descriptor: &str, value_slots: u16) -> Result<(), ClassFileError> {
        let append = self.pool.method_ref(STRING_BUILDER, "append", descriptor)?;
        self.invoke(op::INVOKEVIRTUAL, append, 1 + value_slots, 1);
        Ok(())
    }

    /// Copies one instruction of the original body. Branch operands are
    /// left as zeros and recorded for [`OffsetMap::apply`].
    fn relocate(&mut self, code: &[u8], insn: &Instruction) {
        let at = self.pc();
        match &insn.branch {
            Branch::None => self.code.extend_from_slice(&code[insn.pc..insn.pc + insn.len]),
            Branch::Short(target) => {
                self.code.push(insn.opcode);
                self.placeholder(at, *target, false);
            }
            Branch::Wide(target) => {
                self.code.push(insn.opcode);
                self.placeholder(at, *target, true);
            }
            Branch::Table { default, low, high, targets } => {
                self.switch_header(insn.opcode, *default);
                self.code.extend_from_slice(&low.to_be_bytes());
                self.code.extend_from_slice(&high.to_be_bytes());
                for target in targets {
                    self.placeholder(at, *target, true);
                }
            }
            Branch::Lookup { default, pairs } => {
                self.switch_header(insn.opcode, *default);
                self.code.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (key, target) in pairs {
                    self.code.extend_from_slice(&key.to_be_bytes());
                    self.placeholder(at, *target, true);
                }
            }
        }
    }

    fn placeholder(&mut self, insn: usize, target: usize, wide: bool) {
        self.fixups.push(Fixup { insn, operand: self.pc(), target, wide });
        let width = if wide { 4 } else { 2 };
        self.code.resize(self.code.len() + width, 0);
    }

    /// Opcode, padding to the next 4-byte boundary, then the default target.
    fn switch_header(&mut self, opcode: u8, default: usize) {
        let at = self.pc();
        self.code.push(opcode);
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
        self.placeholder(at, default, true);
    }

    /// Records a frame at the current pc; the operand stack is reset to it.
    fn frame(&mut self, locals: Vec<VerificationType>, stack: Vec<VerificationType>) {
        self.depth = stack
            .iter()
            .map(|t| match t {
                VerificationType::Long | VerificationType::Double => 2,
                _ => 1,
            })
            .sum();
        self.max_stack = self.max_stack.max(self.depth);
        self.frames.push(Frame { pc: self.pc(), locals, stack });
    }

    /// A handler over `[start, end)` that discards whatever was thrown.
    fn swallow(&mut self, start: usize, end: usize, locals: Vec<VerificationType>, throwable: u16) {
        let handler = self.pc();
        self.handlers.push(Handler { start, end, handler, catch_type: throwable });
        self.frame(locals, vec![VerificationType::Object(throwable)]);
        self.op(op::POP);
    }

    fn verification_type(&mut self, ty: &JvmType) -> Result<VerificationType, ClassFileError> {
        Ok(match ty {
            JvmType::Long => VerificationType::Long,
            JvmType::Float => VerificationType::Float,
            JvmType::Double => VerificationType::Double,
            JvmType::Void => VerificationType::Top,
            _ => match ty.class_constant_name() {
                Some(name) => VerificationType::Object(self.pool.class(&name)?),
                None => VerificationType::Integer,
            },
        })
    }

    /// `System.err.println(new StringBuilder().append(..)...toString())`
    fn log(&mut self, fragment: &Fragment, locals: &LogLocals<'_>) -> Result<(), WeaveError> {
        let err = self.pool.field_ref("java/lang/System", "err", "Ljava/io/PrintStream;")?;
        self.op_u2(op::GETSTATIC, err);
        self.adjust(0, 1);
        let builder = self.pool.class(STRING_BUILDER)?;
        self.op_u2(op::NEW, builder);
        self.adjust(0, 1);
        self.op(op::DUP);
        let init = self.pool.method_ref(STRING_BUILDER, "<init>", "()V")?;
        self.invoke(op::INVOKESPECIAL, init, 1, 0);

        for piece in fragment.pieces() {
            match piece {
                Piece::Timestamp => {
                    let now = self.pool.method_ref("java/time/LocalDateTime", "now", "()Ljava/time/LocalDateTime;")?;
                    self.invoke(op::INVOKESTATIC, now, 0, 1);
                    self.ldc_string(TIMESTAMP_PATTERN)?;
                    let of_pattern = self.pool.method_ref(
                        "java/time/format/DateTimeFormatter",
                        "ofPattern",
                        "(Ljava/lang/String;)Ljava/time/format/DateTimeFormatter;",
                    )?;
                    self.invoke(op::INVOKESTATIC, of_pattern, 1, 1);
                    let format = self.pool.method_ref(
                        "java/time/LocalDateTime",
                        "format",
                        "(Ljava/time/format/DateTimeFormatter;)Ljava/lang/String;",
                    )?;
                    self.invoke(op::INVOKEVIRTUAL, format, 2, 1);
                    self.append(APPEND_STRING, 1)?;
                }
                Piece::ThreadName => {
                    let current = self.pool.method_ref("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;")?;
                    self.invoke(op::INVOKESTATIC, current, 0, 1);
                    let get_name = self.pool.method_ref("java/lang/Thread", "getName", "()Ljava/lang/String;")?;
                    self.invoke(op::INVOKEVIRTUAL, get_name, 1, 1);
                    self.append(APPEND_STRING, 1)?;
                }
                Piece::Text(text) => {
                    self.ldc_string(text)?;
                    self.append(APPEND_STRING, 1)?;
                }
                Piece::Argument { index, ty } => {
                    let (slot, declared) = locals
                        .args
                        .get(*index)
                        .ok_or(WeaveError::NoSuchArgument { index: *index, arity: locals.args.len() })?;
                    if declared != ty {
                        return Err(WeaveError::TypeMismatch { expected: ty.to_string(), actual: declared.to_string() });
                    }
                    self.load(declared, *slot);
                    self.append(append_descriptor(declared), declared.slots())?;
                }
                Piece::ReturnValue(ty) => {
                    let (slot, declared) = locals.returned.ok_or(WeaveError::Unavailable("return value"))?;
                    if declared != ty {
                        return Err(WeaveError::TypeMismatch { expected: ty.to_string(), actual: declared.to_string() });
                    }
                    self.load(declared, slot);
                    self.append(append_descriptor(declared), declared.slots())?;
                }
                Piece::Thrown => {
                    let slot = locals.thrown.ok_or(WeaveError::Unavailable("thrown exception"))?;
                    self.local(op::ALOAD, slot);
                    self.adjust(0, 1);
                    self.append("(Ljava/lang/Object;)Ljava/lang/StringBuilder;", 1)?;
                }
            }
        }

        let to_string = self.pool.method_ref(STRING_BUILDER, "toString", "()Ljava/lang/String;")?;
        self.invoke(op::INVOKEVIRTUAL, to_string, 1, 1);
        let println = self.pool.method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V")?;
        self.invoke(op::INVOKEVIRTUAL, println, 2, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{MemberInfo, ACC_INTERFACE, ACC_PUBLIC, ACC_SYNCHRONIZED};
    use crate::fragment::LogTemplate;

    struct Method<'a> {
        flags: u16,
        name: &'a str,
        desc: &'a str,
        code: Option<Vec<u8>>,
    }

    fn class(major: u16, flags: u16, methods: &[Method<'_>]) -> ClassFile {
        let mut pool = ConstantPool::default();
        let this_class = pool.class("demo/Target").unwrap();
        let super_class = pool.class("java/lang/Object").unwrap();
        let code_name = pool.utf8("Code").unwrap();
        let exceptions_name = pool.utf8("Exceptions").unwrap();
        let io_exception = pool.class("java/io/IOException").unwrap();
        let members = methods
            .iter()
            .map(|m| {
                let mut attributes = Vec::new();
                if let Some(code) = &m.code {
                    let code = CodeAttribute {
                        max_stack: 4,
                        max_locals: 8,
                        code: code.clone(),
                        exception_table: Vec::new(),
                        attributes: Vec::new(),
                    };
                    attributes.push(AttributeInfo { name_index: code_name, info: code.to_bytes().unwrap() });
                }
                let mut exceptions = vec![0, 1];
                exceptions.extend_from_slice(&io_exception.to_be_bytes());
                attributes.push(AttributeInfo { name_index: exceptions_name, info: exceptions });
                MemberInfo {
                    access_flags: m.flags,
                    name_index: pool.utf8(m.name).unwrap(),
                    descriptor_index: pool.utf8(m.desc).unwrap(),
                    attributes,
                }
            })
            .collect();
        ClassFile {
            minor_version: 0,
            major_version: major,
            constant_pool: pool,
            access_flags: flags,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: members,
            attributes: Vec::new(),
        }
    }

    /// Adds a sub-attribute to the body of `method`, whose `Code` comes first.
    fn add_code_attribute(cf: &mut ClassFile, method: usize, name: &str, info: Vec<u8>) {
        let name_index = cf.constant_pool.utf8(name).unwrap();
        let mut code = cf.method_code(&cf.methods[method]).unwrap().unwrap();
        code.attributes.push(AttributeInfo { name_index, info });
        cf.methods[method].attributes[0].info = code.to_bytes().unwrap();
    }

    fn plan_both(editor: &mut ClassFileEditor, method: usize) -> Result<(), AgentError> {
        let desc = editor.method_descriptor(method)?;
        let template = LogTemplate::new("Target", "m", desc.params.clone());
        editor.insert_after(method, template.success(&desc.ret))?;
        editor.add_catch(method, template.failure(), "java.lang.Throwable")
    }

    fn woven(editor: ClassFileEditor, method: usize) -> (ClassFile, CodeAttribute) {
        let class = ClassFile::parse(&editor.to_bytecode().unwrap()).unwrap();
        let code = class.method_code(&class.methods[method]).unwrap().unwrap();
        (class, code)
    }

    fn frames(class: &ClassFile, code: &CodeAttribute) -> Vec<Frame> {
        let table = code
            .attributes
            .iter()
            .find(|a| class.attribute_name(a).unwrap() == "StackMapTable")
            .expect("a stack map");
        absolute_frames(&parse_stack_map_table(&table.info).unwrap(), &[]).unwrap()
    }

    #[test]
    fn static_method_is_woven_in_place() {
        // static synchronized String m(String) { return arg0; }
        let cf = class(52, ACC_PUBLIC, &[Method {
            flags: ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED,
            name: "m",
            desc: "(Ljava/lang/String;)Ljava/lang/String;",
            code: Some(vec![0x2a, 0xb0]),
        }]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        let string = JvmType::Object("java/lang/String".into());
        let method = editor.find_method("m", &[string]).unwrap();
        plan_both(&mut editor, method).unwrap();
        let (class, code) = woven(editor, method);

        assert_eq!(class.methods.len(), 1);
        let member = &class.methods[0];
        assert_eq!(class.member_name(member).unwrap(), "m");
        assert_eq!(member.access_flags, ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED);
        assert_eq!(class.attribute_name(&member.attributes[1]).unwrap(), "Exceptions");

        // aload_0 kept, then the result goes to the first slot past the original locals
        assert_eq!(code.code[0], 0x2a);
        assert_eq!(&code.code[1..3], &[op::ASTORE, 8]);
        assert_eq!(code.code[3], op::GETSTATIC);
        assert_eq!(code.max_locals, 9);
        assert!(code.max_stack > 4);

        assert_eq!(code.exception_table.len(), 3);
        let catch_all = code.exception_table.last().unwrap();
        assert_eq!(catch_all.start_pc, 0);
        assert_eq!(catch_all.end_pc, catch_all.handler_pc);
        assert_eq!(class.constant_pool.get_class_name(catch_all.catch_type).unwrap(), THROWABLE);
        assert_eq!(code.code[usize::from(catch_all.handler_pc)..][..2], [op::ASTORE, 8]);
        assert_eq!(*code.code.last().unwrap(), op::ATHROW);

        let returns = bytecode::decode(&code.code).unwrap().iter().filter(|i| i.opcode == op::ARETURN).count();
        assert_eq!(returns, 2);
    }

    #[test]
    fn branches_and_tables_follow_the_moved_code() {
        // static int m(int x) { if (x == 0) return 0; return 1; }
        //  0 iload_0, 1 ifeq 6, 4 iconst_1, 5 ireturn, 6 iconst_0, 7 ireturn
        let mut cf = class(52, ACC_PUBLIC, &[Method {
            flags: ACC_PUBLIC | ACC_STATIC,
            name: "m",
            desc: "(I)I",
            code: Some(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]),
        }]);
        let mut frames_info = Vec::new();
        frames_info.put_u2(1);
        frames_info.push(6);
        add_code_attribute(&mut cf, 0, "StackMapTable", frames_info);
        let mut lines = Vec::new();
        for value in [2, 0, 10, 6, 11] {
            lines.put_u2(value);
        }
        add_code_attribute(&mut cf, 0, "LineNumberTable", lines);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        plan_both(&mut editor, 0).unwrap();
        let (class, code) = woven(editor, 0);

        let insns = bytecode::decode(&code.code).unwrap();
        assert_eq!(insns[1].pc, 1);
        let Branch::Short(target) = insns[1].branch else { panic!("expected ifeq") };
        assert!(target > 6);
        assert_eq!(code.code[target], 0x03);

        let all = frames(&class, &code);
        let moved = all.iter().find(|f| f.pc == target).expect("frame at the branch target");
        assert_eq!(moved.locals, [VerificationType::Integer]);
        assert!(moved.stack.is_empty());
        for handler in &code.exception_table {
            assert!(all.iter().any(|f| f.pc == usize::from(handler.handler_pc)), "no frame at {}", handler.handler_pc);
        }

        let lines = code.attributes.iter().find(|a| class.attribute_name(a).unwrap() == "LineNumberTable").unwrap();
        let target = target as u16;
        assert_eq!(lines.info, [&2u16.to_be_bytes()[..], &[0, 0, 0, 10], &target.to_be_bytes(), &[0, 11]].concat());
    }

    #[test]
    fn switch_padding_follows_the_new_offset() {
        //  0 iload_0, 1 ifne 6, 4 iconst_m1, 5 ireturn, 6 iload_0,
        //  7 tableswitch { 0: 24, default: 26 }, 24 iconst_1, 25 ireturn, 26 iconst_0, 27 ireturn
        let mut body = vec![0x1a, 0x9a, 0x00, 0x05, 0x02, 0xac, 0x1a, op::TABLESWITCH];
        for value in [19i32, 0, 0, 17] {
            body.extend_from_slice(&value.to_be_bytes());
        }
        body.extend_from_slice(&[0x04, 0xac, 0x03, 0xac]);
        let cf = class(49, ACC_PUBLIC, &[Method { flags: ACC_PUBLIC | ACC_STATIC, name: "m", desc: "(I)I", code: Some(body) }]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        plan_both(&mut editor, 0).unwrap();
        let (_, code) = woven(editor, 0);

        let insns = bytecode::decode(&code.code).unwrap();
        let switch = insns.iter().find(|i| i.opcode == op::TABLESWITCH).unwrap();
        assert!(switch.pc > 7);
        let Branch::Table { default, low: 0, high: 0, targets } = &switch.branch else { panic!("expected a table") };
        assert_eq!(code.code[targets[0]], 0x04);
        assert_eq!(code.code[*default], 0x03);
    }

    #[test]
    fn frame_locals_cover_params_and_the_saved_exception() {
        let cf = class(52, ACC_PUBLIC, &[Method {
            flags: ACC_PUBLIC,
            name: "m",
            desc: "(JI)V",
            code: Some(vec![0xb1]),
        }]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        let method = editor.find_method("m", &[JvmType::Long, JvmType::Int]).unwrap();
        plan_both(&mut editor, method).unwrap();
        let (class, code) = woven(editor, method);
        let all = frames(&class, &code);
        assert_eq!(all.len(), 3);

        let catch_all = code.exception_table.last().unwrap();
        let entry = all.iter().find(|f| f.pc == usize::from(catch_all.handler_pc)).unwrap();
        // this, long, int, then the unused original slots 4..8
        let mut expected = vec![VerificationType::Object(class.this_class), VerificationType::Long, VerificationType::Integer];
        expected.extend([VerificationType::Top; 4]);
        assert_eq!(entry.locals, expected);
        assert_eq!(entry.stack, [VerificationType::Object(catch_all.catch_type)]);
        // a void method still needs one slot for the exception
        assert_eq!(code.max_locals, 9);
    }

    #[test]
    fn array_params_are_typed_by_their_descriptor() {
        let cf = class(52, ACC_PUBLIC, &[Method {
            flags: ACC_PUBLIC | ACC_STATIC,
            name: "m",
            desc: "(I[Ljava/lang/String;)V",
            code: Some(vec![0xb1]),
        }]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        plan_both(&mut editor, 0).unwrap();
        let (class, code) = woven(editor, 0);

        let catch_all = code.exception_table.last().unwrap();
        let entry = frames(&class, &code).into_iter().find(|f| f.pc == usize::from(catch_all.handler_pc)).unwrap();
        // array classes are named by their descriptor, not by an L...; form
        let array = class.constant_pool.clone().class("[Ljava/lang/String;").unwrap();
        assert_eq!(entry.locals[..2], [VerificationType::Integer, VerificationType::Object(array)]);
        assert_eq!(entry.locals[2..], [VerificationType::Top; 6]);
    }

    #[test]
    fn old_class_files_get_no_stack_map() {
        let cf = class(49, ACC_PUBLIC, &[Method { flags: ACC_PUBLIC, name: "m", desc: "()I", code: Some(vec![0x03, 0xac]) }]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        plan_both(&mut editor, 0).unwrap();
        let (_, code) = woven(editor, 0);
        assert!(code.attributes.is_empty());
    }

    #[test]
    fn branch_pushed_out_of_range_fails_that_method() {
        // iload_0, ifeq over 32756 nops to iconst_0; ireturn, with a return site in between
        let mut body = vec![0x1a, 0x99];
        body.extend_from_slice(&32_760i16.to_be_bytes());
        body.extend_from_slice(&[0x04, 0xac]);
        body.resize(32_761, 0x00);
        body.extend_from_slice(&[0x03, 0xac]);
        let cf = class(52, ACC_PUBLIC, &[Method { flags: ACC_PUBLIC | ACC_STATIC, name: "m", desc: "(I)I", code: Some(body) }]);
        let original = cf.methods.clone();
        let mut editor = ClassFileEditor::new(cf).unwrap();

        let err = plan_both(&mut editor, 0).unwrap_err();
        assert!(matches!(err, AgentError::Transform { .. }), "{err}");
        assert!(err.to_string().contains("16-bit"), "{err}");
        let class = ClassFile::parse(&editor.to_bytecode().unwrap()).unwrap();
        assert_eq!(class.methods, original);
    }

    #[test]
    fn bodiless_methods_are_rejected() {
        let cf = class(52, ACC_PUBLIC, &[
            Method { flags: ACC_PUBLIC | ACC_NATIVE, name: "n", desc: "()V", code: None },
            Method { flags: ACC_PUBLIC | ACC_ABSTRACT, name: "a", desc: "()V", code: None },
        ]);
        let mut editor = ClassFileEditor::new(cf).unwrap();
        for method in [0, 1] {
            let err = plan_both(&mut editor, method).unwrap_err();
            assert!(matches!(err, AgentError::Transform { .. }), "{err}");
        }
    }

    #[test]
    fn interface_methods_are_woven_at_any_version() {
        let flags = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        let methods = [Method { flags: ACC_PUBLIC | ACC_STATIC, name: "s", desc: "()V", code: Some(vec![0xb1]) }];
        for major in [51, 52] {
            let mut editor = ClassFileEditor::new(class(major, flags, &methods)).unwrap();
            plan_both(&mut editor, 0).unwrap();
            let (class, code) = woven(editor, 0);
            assert_eq!(class.methods.len(), 1);
            assert_eq!(code.exception_table.len(), 3);
        }
    }

    #[test]
    fn find_method_skips_constructors_and_ignores_return_type() {
        let cf = class(52, ACC_PUBLIC, &[
            Method { flags: ACC_PUBLIC, name: "<init>", desc: "()V", code: Some(vec![0xb1]) },
            Method { flags: ACC_PUBLIC, name: "m", desc: "(I)J", code: Some(vec![0x09, 0xad]) },
            Method { flags: ACC_PUBLIC, name: "m", desc: "(J)I", code: Some(vec![0x03, 0xac]) },
        ]);
        let editor = ClassFileEditor::new(cf).unwrap();
        assert_eq!(editor.find_method("<init>", &[]), None);
        assert_eq!(editor.find_method("m", &[JvmType::Int]), Some(1));
        assert_eq!(editor.find_method("m", &[JvmType::Long]), Some(2));
        assert_eq!(editor.find_method("m", &[JvmType::Short]), None);
        assert_eq!(editor.class_name(), "demo.Target");
    }

    #[test]
    fn duplicate_and_reverted_plans() {
        let cf = class(52, ACC_PUBLIC, &[Method { flags: ACC_PUBLIC, name: "m", desc: "()V", code: Some(vec![0xb1]) }]);
        let original = cf.to_bytes();
        let mut editor = ClassFileEditor::new(cf).unwrap();
        plan_both(&mut editor, 0).unwrap();
        assert!(matches!(plan_both(&mut editor, 0), Err(AgentError::Transform { .. })));

        editor.revert(0);
        let bytes = editor.to_bytecode().unwrap();
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.methods.len(), 1);
        // only constants were added
        assert_eq!(class.methods, ClassFile::parse(&original).unwrap().methods);
    }
}
