//! The bytecode builder
//!
//! [`BytecodeBuilder`] accumulates one function at a time: instructions and
//! their line numbers, the constant pool, child function references and debug
//! metadata. Closing a function folds and (if needed) expands its jumps,
//! validates the stream in debug builds, captures the disassembly text and
//! serializes the function record; [`BytecodeBuilder::finalize`] then
//! assembles the full blob.

use std::fmt;

use ferret_bytecode::{
    ConstantTag, EncodeError, MAX_CLOSURE_COUNT, MAX_CONSTANT_COUNT, MAX_JUMP_DISTANCE, Opcode,
    Result, word,
};
use rustc_hash::FxHashMap;

use crate::constant::{Constant, ConstantKey, TableShape};
use crate::lineinfo;
use crate::writer::{write_byte, write_f32, write_f64, write_u32, write_varint};

/// Hook for rewriting instruction words before serialization.
///
/// Runs once per function, after jump processing and validation; used by
/// embedders that encode instructions (e.g. to bake dispatch addresses into
/// the opcode byte). The word layout produced must keep instruction lengths
/// intact.
pub trait BytecodeEncoder {
    /// Rewrite the finished instruction stream in place.
    fn encode(&mut self, code: &mut [u32]);
}

/// Which parts of the textual dump to capture while building.
///
/// Must be configured before the first function is opened; dumps are captured
/// at function close and are not reconstructible afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpFlags {
    /// Per-instruction disassembly
    pub code: bool,
    /// Line number prefix on every instruction
    pub lines: bool,
    /// Interleave source lines (requires [`BytecodeBuilder::set_dump_source`])
    pub source: bool,
    /// Local variable tables
    pub locals: bool,
    /// Optimization remarks
    pub remarks: bool,
}

impl DumpFlags {
    /// Everything on.
    pub const ALL: Self =
        Self { code: true, lines: true, source: true, locals: true, remarks: true };
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Jump {
    pub(crate) source: u32,
    pub(crate) target: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DebugLocal {
    pub(crate) name: u32,
    pub(crate) reg: u8,
    pub(crate) start_pc: u32,
    pub(crate) end_pc: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DebugUpval {
    pub(crate) name: u32,
}

#[derive(Debug, Clone, Copy)]
struct TypedLocal {
    ty: u8,
    reg: u8,
    start_pc: u32,
    end_pc: u32,
}

#[derive(Debug, Clone, Copy)]
struct TypedUpval {
    ty: u8,
}

#[derive(Debug, Clone)]
struct UserdataType {
    name: String,
    name_ref: u32,
    used: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FunctionRecord {
    data: Vec<u8>,
    pub(crate) max_stack_size: u8,
    pub(crate) num_params: u8,
    pub(crate) num_upvalues: u8,
    pub(crate) is_vararg: bool,
    type_info: Vec<u8>,
    debug_name: u32,
    debug_line_defined: i32,
    pub(crate) dump: String,
    pub(crate) dump_name: String,
}

/// Single-pass assembler for one compilation unit.
///
/// Functions are built strictly one at a time; exactly one may be open
/// between [`begin_function`](Self::begin_function) and
/// [`end_function`](Self::end_function), and opening a second one panics.
/// The builder is single-threaded by construction; concurrent units get
/// independent builders.
pub struct BytecodeBuilder {
    functions: Vec<FunctionRecord>,
    pub(crate) current_function: Option<u32>,
    main_function: Option<u32>,
    total_instruction_count: usize,

    pub(crate) insns: Vec<u32>,
    pub(crate) lines: Vec<i32>,
    pub(crate) constants: Vec<Constant>,
    constant_map: FxHashMap<ConstantKey, u32>,
    pub(crate) table_shapes: Vec<TableShape>,
    table_shape_map: FxHashMap<TableShape, u32>,
    pub(crate) protos: Vec<u32>,
    proto_map: FxHashMap<u32, u16>,
    jumps: Vec<Jump>,
    has_long_jumps: bool,

    // 1-based dense ids shared by the whole unit; 0 is reserved to mean nil
    string_table: FxHashMap<Box<[u8]>, u32>,
    pub(crate) debug_strings: Vec<Vec<u8>>,

    debug_line: i32,
    pub(crate) debug_locals: Vec<DebugLocal>,
    pub(crate) debug_upvals: Vec<DebugUpval>,
    typed_locals: Vec<TypedLocal>,
    typed_upvals: Vec<TypedUpval>,
    userdata_types: Vec<UserdataType>,

    pub(crate) debug_remarks: Vec<(u32, String)>,

    pub(crate) dump_flags: DumpFlags,
    pub(crate) dump_source: Vec<String>,
    pub(crate) dump_remarks: Vec<(i32, String)>,

    encoder: Option<Box<dyn BytecodeEncoder>>,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    /// Create an empty builder with no dump capture and no encoder.
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            current_function: None,
            main_function: None,
            total_instruction_count: 0,

            insns: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            constant_map: FxHashMap::default(),
            table_shapes: Vec::new(),
            table_shape_map: FxHashMap::default(),
            protos: Vec::new(),
            proto_map: FxHashMap::default(),
            jumps: Vec::new(),
            has_long_jumps: false,

            string_table: FxHashMap::default(),
            debug_strings: Vec::new(),

            debug_line: 0,
            debug_locals: Vec::new(),
            debug_upvals: Vec::new(),
            typed_locals: Vec::new(),
            typed_upvals: Vec::new(),
            userdata_types: Vec::new(),

            debug_remarks: Vec::new(),

            dump_flags: DumpFlags::default(),
            dump_source: Vec::new(),
            dump_remarks: Vec::new(),

            encoder: None,
        }
    }

    /// Select which dump text to capture. Call before building any function.
    pub fn set_dump_flags(&mut self, flags: DumpFlags) {
        self.dump_flags = flags;
    }

    /// Install an instruction encoder hook.
    pub fn set_encoder(&mut self, encoder: Box<dyn BytecodeEncoder>) {
        self.encoder = Some(encoder);
    }

    /// Open a new function and return its dense id.
    ///
    /// Panics if another function is still open.
    pub fn begin_function(&mut self, num_params: u8, is_vararg: bool) -> u32 {
        assert!(self.current_function.is_none(), "a function is already open");

        let id = self.functions.len() as u32;

        self.functions.push(FunctionRecord {
            num_params,
            is_vararg,
            ..FunctionRecord::default()
        });

        self.current_function = Some(id);

        self.has_long_jumps = false;
        self.debug_line = 0;

        id
    }

    /// Close the open function.
    ///
    /// Folds jump chains, expands long jumps into trampolines when any jump
    /// exceeded the 16-bit offset, validates the stream in debug builds,
    /// captures the dump text, runs the encoder hook and serializes the
    /// function record. All per-function scratch state is reset.
    ///
    /// Panics if no function is open.
    pub fn end_function(&mut self, max_stack_size: u8, num_upvalues: u8, flags: u8) {
        let id = self.current_function.expect("no function is open");

        self.functions[id as usize].max_stack_size = max_stack_size;
        self.functions[id as usize].num_upvalues = num_upvalues;

        self.fold_jumps();
        self.expand_jumps();

        #[cfg(debug_assertions)]
        self.validate();

        if self.dump_flags.code {
            self.functions[id as usize].dump = self.dump_current_function();
        }

        if let Some(encoder) = &mut self.encoder {
            encoder.encode(&mut self.insns);
        }

        // very approximate: 4 bytes per instruction, 1 byte for the debug
        // line, and 1-2 bytes for aux data like constants plus overhead
        let mut data = Vec::with_capacity(32 + self.insns.len() * 7);
        self.write_function(&mut data, id, flags);
        self.functions[id as usize].data = data;

        #[cfg(feature = "asm_logging")]
        tracing::debug!(
            target: "ferret::asm",
            function = id,
            instructions = self.insns.len(),
            constants = self.constants.len(),
            expanded = self.has_long_jumps,
            "function closed"
        );

        self.current_function = None;

        self.total_instruction_count += self.insns.len();
        self.insns.clear();
        self.lines.clear();
        self.constants.clear();
        self.protos.clear();
        self.jumps.clear();
        self.table_shapes.clear();

        self.debug_locals.clear();
        self.debug_upvals.clear();

        self.typed_locals.clear();
        self.typed_upvals.clear();

        self.constant_map.clear();
        self.table_shape_map.clear();
        self.proto_map.clear();

        self.debug_remarks.clear();
    }

    /// Designate the entry-point function of the unit.
    pub fn set_main_function(&mut self, fid: u32) {
        assert!((fid as usize) < self.functions.len());

        self.main_function = Some(fid);
    }

    fn add_constant(&mut self, key: ConstantKey, value: Constant) -> Result<u32> {
        if let Some(&id) = self.constant_map.get(&key) {
            return Ok(id);
        }

        let id = self.constants.len() as u32;

        if id >= MAX_CONSTANT_COUNT {
            return Err(EncodeError::TooManyConstants);
        }

        self.constant_map.insert(key, id);
        self.constants.push(value);

        Ok(id)
    }

    /// Intern a string in the unit-wide string table, returning its 1-based id.
    pub fn add_string_table_entry(&mut self, value: impl AsRef<[u8]>) -> u32 {
        let value = value.as_ref();

        if let Some(&index) = self.string_table.get(value) {
            return index;
        }

        let index = self.string_table.len() as u32 + 1;
        self.string_table.insert(value.into(), index);

        if self.dump_flags.code {
            self.debug_strings.push(value.to_vec());
        }

        index
    }

    /// Add a nil constant.
    pub fn add_constant_nil(&mut self) -> Result<u32> {
        self.add_constant(ConstantKey::new(ConstantTag::Nil, 0), Constant::Nil)
    }

    /// Add a boolean constant.
    pub fn add_constant_boolean(&mut self, value: bool) -> Result<u32> {
        let key = ConstantKey::new(ConstantTag::Boolean, value as u64);

        self.add_constant(key, Constant::Boolean(value))
    }

    /// Add a number constant. Dedup is by bit pattern, so `0.0` and `-0.0`
    /// get distinct slots.
    pub fn add_constant_number(&mut self, value: f64) -> Result<u32> {
        self.add_constant(ConstantKey::number(value), Constant::Number(value))
    }

    /// Add a vector constant.
    pub fn add_constant_vector(&mut self, x: f32, y: f32, z: f32, w: f32) -> Result<u32> {
        self.add_constant(ConstantKey::vector(x, y, z, w), Constant::Vector([x, y, z, w]))
    }

    /// Add a string constant, interning the bytes in the string table.
    pub fn add_constant_string(&mut self, value: impl AsRef<[u8]>) -> Result<u32> {
        let index = self.add_string_table_entry(value);

        let key = ConstantKey::new(ConstantTag::String, index as u64);

        self.add_constant(key, Constant::String(index))
    }

    /// Add an import constant for a packed import-chain id.
    pub fn add_import(&mut self, iid: u32) -> Result<u32> {
        let key = ConstantKey::new(ConstantTag::Import, iid as u64);

        self.add_constant(key, Constant::Import(iid))
    }

    /// Add a table-shape constant; shapes dedup by exact key sequence.
    pub fn add_constant_table(&mut self, shape: TableShape) -> Result<u32> {
        if let Some(&id) = self.table_shape_map.get(&shape) {
            return Ok(id);
        }

        let id = self.constants.len() as u32;

        if id >= MAX_CONSTANT_COUNT {
            return Err(EncodeError::TooManyConstants);
        }

        let value = Constant::Table(self.table_shapes.len() as u32);

        self.table_shape_map.insert(shape.clone(), id);
        self.table_shapes.push(shape);
        self.constants.push(value);

        Ok(id)
    }

    /// Add a closure constant referencing a previously built function.
    pub fn add_constant_closure(&mut self, fid: u32) -> Result<u32> {
        let key = ConstantKey::new(ConstantTag::Closure, fid as u64);

        self.add_constant(key, Constant::Closure(fid))
    }

    /// Register a child function, returning its index in the proto list.
    pub fn add_child_function(&mut self, fid: u32) -> Result<u16> {
        if let Some(&id) = self.proto_map.get(&fid) {
            return Ok(id);
        }

        let id = self.protos.len() as u32;

        if id >= MAX_CLOSURE_COUNT {
            return Err(EncodeError::TooManyChildFunctions);
        }

        self.proto_map.insert(fid, id as u16);
        self.protos.push(fid);

        Ok(id as u16)
    }

    /// Emit an instruction with three 8-bit operands.
    pub fn emit_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8) {
        self.insns.push(word::abc(op, a, b, c));
        self.lines.push(self.debug_line);
    }

    /// Emit an instruction with an 8-bit and a signed 16-bit operand.
    pub fn emit_ad(&mut self, op: Opcode, a: u8, d: i16) {
        self.insns.push(word::ad(op, a, d));
        self.lines.push(self.debug_line);
    }

    /// Emit an instruction with a signed 24-bit operand.
    pub fn emit_e(&mut self, op: Opcode, e: i32) {
        self.insns.push(word::e(op, e));
        self.lines.push(self.debug_line);
    }

    /// Emit an auxiliary word for the preceding instruction.
    pub fn emit_aux(&mut self, aux: u32) {
        self.insns.push(aux);
        self.lines.push(self.debug_line);
    }

    /// Current instruction offset, used as a patch label.
    pub fn emit_label(&self) -> usize {
        self.insns.len()
    }

    /// Patch the D field of the branch at `jump_label` to reach `target_label`.
    ///
    /// When the offset fits 16 bits the word is patched directly; when it
    /// only fits the wide 24-bit form the word is left for
    /// [`end_function`](Self::end_function) to rewrite through a trampoline.
    pub fn patch_jump_d(&mut self, jump_label: usize, target_label: usize) -> Result<()> {
        debug_assert!(jump_label < self.insns.len());

        let jump_insn = self.insns[jump_label];

        debug_assert!(
            Opcode::from_byte(word::op(jump_insn)).is_some_and(Opcode::is_jump_d)
        );
        debug_assert!(word::d(jump_insn) == 0);

        debug_assert!(target_label <= self.insns.len());

        let offset = target_label as i32 - jump_label as i32 - 1;

        if offset as i16 as i32 == offset {
            self.insns[jump_label] |= ((offset as i16 as u16) as u32) << 16;
        } else if offset.abs() < MAX_JUMP_DISTANCE {
            // doesn't fit into 16 bits; expand_jumps will repatch the stream
            // with jump trampolines
            self.has_long_jumps = true;
        } else {
            return Err(EncodeError::JumpTooFar(offset));
        }

        self.jumps.push(Jump { source: jump_label as u32, target: target_label as u32 });

        Ok(())
    }

    /// Patch the unsigned 8-bit skip count of the instruction at `jump_label`.
    pub fn patch_skip_c(&mut self, jump_label: usize, target_label: usize) -> Result<()> {
        debug_assert!(jump_label < self.insns.len());

        let jump_insn = self.insns[jump_label];

        debug_assert!(
            Opcode::from_byte(word::op(jump_insn))
                .is_some_and(|op| op.is_skip_c() || op.is_fast_call())
        );
        debug_assert!(word::c(jump_insn) == 0);

        let offset = target_label as i32 - jump_label as i32 - 1;

        if offset as u8 as i32 != offset {
            return Err(EncodeError::SkipTooFar(offset));
        }

        self.insns[jump_label] |= (offset as u32) << 24;

        Ok(())
    }

    /// Attach a pre-encoded function type signature to the open function.
    pub fn set_function_type_info(&mut self, value: Vec<u8>) {
        let id = self.current_function.expect("no function is open");

        self.functions[id as usize].type_info = value;
    }

    /// Record the type of a local variable over a pc range.
    pub fn push_local_type_info(&mut self, ty: u8, reg: u8, start_pc: u32, end_pc: u32) {
        self.typed_locals.push(TypedLocal { ty, reg, start_pc, end_pc });
    }

    /// Record the type of the next upvalue.
    pub fn push_upval_type_info(&mut self, ty: u8) {
        self.typed_upvals.push(TypedUpval { ty });
    }

    /// Register a named userdata type; the returned index maps to the tag
    /// `bctype::TAGGED_USERDATA_BASE + index`.
    pub fn add_userdata_type(&mut self, name: &str) -> u32 {
        self.userdata_types.push(UserdataType {
            name: name.to_owned(),
            name_ref: 0,
            used: false,
        });

        self.userdata_types.len() as u32 - 1
    }

    /// Mark a registered userdata type as referenced, so its name is
    /// emitted into the blob's type name mapping.
    pub fn use_userdata_type(&mut self, index: u32) {
        self.userdata_types[index as usize].used = true;
    }

    /// Set the name of the open function, for debug info and dumps.
    pub fn set_debug_function_name(&mut self, name: impl AsRef<[u8]>) {
        let name = name.as_ref();
        let index = self.add_string_table_entry(name);

        let id = self.current_function.expect("no function is open");

        self.functions[id as usize].debug_name = index;

        if self.dump_flags.code {
            self.functions[id as usize].dump_name = String::from_utf8_lossy(name).into_owned();
        }
    }

    /// Set the source line the open function is defined on.
    pub fn set_debug_function_line_defined(&mut self, line: i32) {
        let id = self.current_function.expect("no function is open");

        self.functions[id as usize].debug_line_defined = line;
    }

    /// Set the source line attributed to subsequently emitted instructions.
    pub fn set_debug_line(&mut self, line: i32) {
        self.debug_line = line;
    }

    /// Record a named local variable live over a pc range.
    pub fn push_debug_local(&mut self, name: impl AsRef<[u8]>, reg: u8, start_pc: u32, end_pc: u32) {
        let name = self.add_string_table_entry(name);

        self.debug_locals.push(DebugLocal { name, reg, start_pc, end_pc });
    }

    /// Record the name of the next upvalue.
    pub fn push_debug_upval(&mut self, name: impl AsRef<[u8]>) {
        let name = self.add_string_table_entry(name);

        self.debug_upvals.push(DebugUpval { name });
    }

    /// Number of instruction words in the open function so far.
    pub fn instruction_count(&self) -> usize {
        self.insns.len()
    }

    /// Total instruction words across all closed functions.
    pub fn total_instruction_count(&self) -> usize {
        self.total_instruction_count
    }

    /// Current pc, for debug ranges.
    pub fn debug_pc(&self) -> u32 {
        self.insns.len() as u32
    }

    /// Attach an optimization remark to the next emitted instruction.
    ///
    /// Remarks only surface in dumps; they are dropped unless the remarks
    /// dump flag is set.
    pub fn add_debug_remark(&mut self, args: fmt::Arguments<'_>) {
        if !self.dump_flags.remarks {
            return;
        }

        let text = args.to_string();

        self.debug_remarks.push((self.insns.len() as u32, text.clone()));
        self.dump_remarks.push((self.debug_line, text));
    }

    // Follow chains of forward unconditional jumps, rewriting each recorded
    // jump to its final target; unconditional jumps to RETURN are replaced
    // by the RETURN itself.
    fn fold_jumps(&mut self) {
        // processing below can make jump instructions non-jumps (JUMP ->
        // RETURN), which breaks the trampoline rewrite; skip it entirely
        if self.has_long_jumps {
            return;
        }

        for jump in &mut self.jumps {
            let jump_label = jump.source as usize;

            let jump_insn = self.insns[jump_label];

            // only forward jumps are followed, to make sure this terminates
            let mut target_label = (jump_label as i64 + 1 + word::d(jump_insn) as i64) as usize;
            debug_assert!(target_label < self.insns.len());
            let mut target_insn = self.insns[target_label];

            while word::op(target_insn) == Opcode::Jump.to_byte() && word::d(target_insn) >= 0 {
                target_label = target_label + 1 + word::d(target_insn) as usize;
                debug_assert!(target_label < self.insns.len());
                target_insn = self.insns[target_label];
            }

            let offset = target_label as i32 - jump_label as i32 - 1;

            if word::op(jump_insn) == Opcode::Jump.to_byte()
                && word::op(target_insn) == Opcode::Return.to_byte()
            {
                self.insns[jump_label] = target_insn;
            } else if offset as i16 as i32 == offset {
                word::patch_d(&mut self.insns[jump_label], offset as i16);
            }

            jump.target = target_label as u32;
        }
    }

    // Rewrite the stream with jump trampolines once some branch offset
    // exceeded 16 bits. Instead of
    //   OP jumpoffset
    // we synthesize (offsets are relative to the next instruction):
    //   JUMP +1
    //   JUMPX jumpoffset
    //   OP -2
    // Forward execution jumps over the JUMPX into OP; if OP takes its
    // branch, it lands on the JUMPX which carries a 24-bit offset.
    fn expand_jumps(&mut self) {
        if !self.has_long_jumps {
            return;
        }

        // trampolines grow the code, which can push previously short jumps
        // over the 16-bit limit; the worst-case expansion is 3x, so every
        // jump with an offset >= 32767/3 gets repatched conservatively
        const MAX_JUMP_DISTANCE_CONSERVATIVE: i32 = 32767 / 3;

        self.jumps.sort_by_key(|jump| jump.source);

        // new instruction buffers, with remap[oldpc] = newpc
        let mut remap = vec![0u32; self.insns.len()];

        let mut newinsns = Vec::with_capacity(self.insns.len());
        let mut newlines = Vec::with_capacity(self.lines.len());

        debug_assert!(self.insns.len() == self.lines.len());

        let mut current_jump = 0;
        let mut pending_trampolines = 0usize;

        let mut i = 0;
        while i < self.insns.len() {
            let op = self.opcode_at(i);

            if current_jump < self.jumps.len() && self.jumps[current_jump].source as usize == i {
                let jump = self.jumps[current_jump];
                let offset = jump.target as i32 - jump.source as i32 - 1;

                if offset.abs() > MAX_JUMP_DISTANCE_CONSERVATIVE {
                    // insert the trampoline; the JUMPX offset stays
                    // uninitialized until the second pass
                    newinsns.push(word::ad(Opcode::Jump, 0, 1));
                    newinsns.push(word::e(Opcode::JumpX, 0));

                    newlines.push(self.lines[i]);
                    newlines.push(self.lines[i]);

                    pending_trampolines += 1;
                }

                current_jump += 1;
            }

            for _ in 0..op.length() {
                remap[i] = newinsns.len() as u32;

                newinsns.push(self.insns[i]);
                newlines.push(self.lines[i]);

                i += 1;
            }
        }

        debug_assert!(current_jump == self.jumps.len());
        debug_assert!(pending_trampolines > 0);

        // offsets couldn't be fixed in the first pass because they are
        // between *remapped* positions, which weren't known yet
        for jump in &self.jumps {
            let offset = jump.target as i32 - jump.source as i32 - 1;
            let newoffset =
                remap[jump.target as usize] as i32 - remap[jump.source as usize] as i32 - 1;

            if offset.abs() > MAX_JUMP_DISTANCE_CONSERVATIVE {
                let source = remap[jump.source as usize] as usize;

                debug_assert!(word::op(newinsns[source - 1]) == Opcode::JumpX.to_byte());

                // newoffset is relative to OP; the JUMPX sits one word
                // earlier, so it jumps one further
                word::patch_e(&mut newinsns[source - 1], newoffset + 1);

                word::patch_d(&mut newinsns[source], -2);

                pending_trampolines -= 1;
            } else {
                let source = remap[jump.source as usize] as usize;

                debug_assert!(word::d(newinsns[source]) == offset);
                debug_assert!(newoffset as i16 as i32 == newoffset);

                word::patch_d(&mut newinsns[source], newoffset as i16);
            }
        }

        debug_assert!(pending_trampolines == 0);

        self.insns = newinsns;
        self.lines = newlines;
    }

    fn write_function(&self, ss: &mut Vec<u8>, id: u32, flags: u8) {
        let func = &self.functions[id as usize];

        // header
        write_byte(ss, func.max_stack_size);
        write_byte(ss, func.num_params);
        write_byte(ss, func.num_upvalues);
        write_byte(ss, func.is_vararg as u8);

        write_byte(ss, flags);

        if !func.type_info.is_empty() || !self.typed_upvals.is_empty() || !self.typed_locals.is_empty()
        {
            // collect type info separately to know the overall block size
            let mut block = Vec::new();
            write_varint(&mut block, func.type_info.len() as u32);
            write_varint(&mut block, self.typed_upvals.len() as u32);
            write_varint(&mut block, self.typed_locals.len() as u32);

            block.extend_from_slice(&func.type_info);

            for upval in &self.typed_upvals {
                write_byte(&mut block, upval.ty);
            }

            for local in &self.typed_locals {
                write_byte(&mut block, local.ty);
                write_byte(&mut block, local.reg);
                write_varint(&mut block, local.start_pc);
                debug_assert!(local.end_pc >= local.start_pc);
                write_varint(&mut block, local.end_pc - local.start_pc);
            }

            write_varint(ss, block.len() as u32);
            ss.extend_from_slice(&block);
        } else {
            write_varint(ss, 0);
        }

        // instructions
        write_varint(ss, self.insns.len() as u32);

        for &insn in &self.insns {
            write_u32(ss, insn);
        }

        // constants
        write_varint(ss, self.constants.len() as u32);

        for constant in &self.constants {
            write_byte(ss, constant.tag() as u8);

            match *constant {
                Constant::Nil => {}
                Constant::Boolean(value) => write_byte(ss, value as u8),
                Constant::Number(value) => write_f64(ss, value),
                Constant::Vector([x, y, z, w]) => {
                    write_f32(ss, x);
                    write_f32(ss, y);
                    write_f32(ss, z);
                    write_f32(ss, w);
                }
                Constant::String(index) => write_varint(ss, index),
                Constant::Import(iid) => write_u32(ss, iid),
                Constant::Table(shape) => {
                    let shape = &self.table_shapes[shape as usize];
                    write_varint(ss, shape.keys.len() as u32);
                    for &key in &shape.keys {
                        write_varint(ss, key);
                    }
                }
                Constant::Closure(fid) => write_varint(ss, fid),
            }
        }

        // child protos
        write_varint(ss, self.protos.len() as u32);

        for &child in &self.protos {
            write_varint(ss, child);
        }

        // debug info
        write_varint(ss, func.debug_line_defined as u32);
        write_varint(ss, func.debug_name);

        let has_lines = self.lines.iter().all(|&line| line != 0);

        if has_lines {
            write_byte(ss, 1);

            lineinfo::encode(&self.lines, ss);
        } else {
            write_byte(ss, 0);
        }

        let has_debug = !self.debug_locals.is_empty() || !self.debug_upvals.is_empty();

        if has_debug {
            write_byte(ss, 1);

            write_varint(ss, self.debug_locals.len() as u32);

            for local in &self.debug_locals {
                write_varint(ss, local.name);
                write_varint(ss, local.start_pc);
                write_varint(ss, local.end_pc);
                write_byte(ss, local.reg);
            }

            write_varint(ss, self.debug_upvals.len() as u32);

            for upval in &self.debug_upvals {
                write_varint(ss, upval.name);
            }
        } else {
            write_byte(ss, 0);
        }
    }

    fn write_string_table(&self, ss: &mut Vec<u8>) {
        let mut strings: Vec<&[u8]> = vec![&[]; self.string_table.len()];

        for (value, &index) in &self.string_table {
            debug_assert!(index > 0 && index as usize <= strings.len());
            strings[index as usize - 1] = value;
        }

        write_varint(ss, strings.len() as u32);

        for value in strings {
            write_varint(ss, value.len() as u32);
            ss.extend_from_slice(value);
        }
    }

    /// Assemble the serialized blob for all closed functions.
    ///
    /// Panics if [`set_main_function`](Self::set_main_function) was never
    /// called or a function is still open. Performs no validation of the
    /// function bodies; that happened at [`end_function`](Self::end_function).
    pub fn finalize(mut self) -> Vec<u8> {
        assert!(self.current_function.is_none(), "a function is still open");

        let main_function = self.main_function.expect("main function was not set");

        for i in 0..self.userdata_types.len() {
            if self.userdata_types[i].used {
                let name = self.userdata_types[i].name.clone();
                self.userdata_types[i].name_ref = self.add_string_table_entry(name.as_bytes());
            }
        }

        let mut capacity = 16;

        for value in self.string_table.keys() {
            capacity += value.len() + 2;
        }

        for func in &self.functions {
            capacity += func.data.len();
        }

        let mut bytecode = Vec::with_capacity(capacity);

        write_byte(&mut bytecode, ferret_bytecode::BYTECODE_VERSION);
        write_byte(&mut bytecode, ferret_bytecode::TYPE_VERSION);

        self.write_string_table(&mut bytecode);

        // mapping between used type name indices and their names; a 0 index
        // byte marks the end
        for (i, ty) in self.userdata_types.iter().enumerate() {
            write_byte(&mut bytecode, i as u8 + 1);
            write_varint(&mut bytecode, ty.name_ref);
        }
        write_byte(&mut bytecode, 0);

        write_varint(&mut bytecode, self.functions.len() as u32);

        for func in &self.functions {
            bytecode.extend_from_slice(&func.data);
        }

        write_varint(&mut bytecode, main_function);

        #[cfg(feature = "asm_logging")]
        tracing::debug!(
            target: "ferret::asm",
            functions = self.functions.len(),
            total_instructions = self.total_instruction_count,
            bytes = bytecode.len(),
            "unit finalized"
        );

        bytecode
    }

    /// Serialized form of a compile error.
    ///
    /// A leading 0 byte (never a valid format version) marks the blob as an
    /// error message instead of bytecode.
    pub fn encode_error_blob(message: &str) -> Vec<u8> {
        let mut result = Vec::with_capacity(1 + message.len());

        result.push(0);
        result.extend_from_slice(message.as_bytes());

        result
    }

    pub(crate) fn function_record(&self, id: u32) -> &FunctionRecord {
        &self.functions[id as usize]
    }

    pub(crate) fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn opcode_at(&self, i: usize) -> Opcode {
        Opcode::from_byte(word::op(self.insns[i]))
            .unwrap_or_else(|| panic!("invalid opcode {:#x} at {i}", word::op(self.insns[i])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_dedup() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let a = bc.add_constant_number(1.5).unwrap();
        let b = bc.add_constant_number(1.5).unwrap();
        assert_eq!(a, b);

        // same bits required for dedup
        let pos = bc.add_constant_number(0.0).unwrap();
        let neg = bc.add_constant_number(-0.0).unwrap();
        assert_ne!(pos, neg);

        // distinct tags never collide even with equal payload bits
        let boolean = bc.add_constant_boolean(false).unwrap();
        let nil = bc.add_constant_nil().unwrap();
        assert_ne!(boolean, nil);

        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);
    }

    #[test]
    fn test_string_table_shared_across_functions() {
        let mut bc = BytecodeBuilder::new();

        bc.begin_function(0, false);
        let first = bc.add_constant_string("print").unwrap();
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        bc.begin_function(0, false);
        let second = bc.add_constant_string("print").unwrap();
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        // constant pools are per function, ids restart from 0
        assert_eq!(first, 0);
        assert_eq!(second, 0);

        // but the interned string id is stable across the unit
        assert_eq!(bc.add_string_table_entry("print"), 1);
        assert_eq!(bc.add_string_table_entry("next"), 2);
    }

    #[test]
    fn test_table_shape_dedup() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let a = bc.add_constant_table(TableShape { keys: vec![1, 2, 3] }).unwrap();
        let b = bc.add_constant_table(TableShape { keys: vec![1, 2, 3] }).unwrap();
        let c = bc.add_constant_table(TableShape { keys: vec![3, 2, 1] }).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);
    }

    #[test]
    fn test_child_function_dedup() {
        let mut bc = BytecodeBuilder::new();

        bc.begin_function(0, false);
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        bc.begin_function(0, false);
        let a = bc.add_child_function(0).unwrap();
        let b = bc.add_child_function(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 0);

        bc.emit_ad(Opcode::NewClosure, 0, a as i16);
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);
    }

    #[test]
    fn test_patch_jump_d_direct() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let jump = bc.emit_label();
        bc.emit_ad(Opcode::Jump, 0, 0);
        bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
        let target = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        bc.patch_jump_d(jump, target).unwrap();

        assert_eq!(word::d(bc.insns[jump]), 1);

        bc.end_function(1, 0, 0);
    }

    #[test]
    fn test_patch_skip_c_overflow() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let skip = bc.emit_label();
        bc.emit_abc(Opcode::LoadB, 0, 1, 0);

        for _ in 0..300 {
            bc.emit_abc(Opcode::Nop, 0, 0, 0);
        }

        let target = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        assert_eq!(bc.patch_skip_c(skip, target), Err(EncodeError::SkipTooFar(300)));
    }

    #[test]
    fn test_fold_jump_chain() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        // 0: JUMP -> 2, 1: padding, 2: JUMP -> 4, 3: padding, 4: RETURN
        let first = bc.emit_label();
        bc.emit_ad(Opcode::Jump, 0, 0);
        bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
        let second = bc.emit_label();
        bc.emit_ad(Opcode::Jump, 0, 0);
        bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
        let ret = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        bc.patch_jump_d(first, second).unwrap();
        bc.patch_jump_d(second, ret).unwrap();

        bc.fold_jumps();

        // both unconditional jumps reach a RETURN and become that RETURN
        assert_eq!(bc.insns[first], bc.insns[ret]);
        assert_eq!(bc.insns[second], bc.insns[ret]);
    }

    #[test]
    fn test_expand_long_jump() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let jump = bc.emit_label();
        bc.emit_ad(Opcode::Jump, 0, 0);

        for _ in 0..40_000 {
            bc.emit_abc(Opcode::Nop, 0, 0, 0);
        }

        let target = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        bc.patch_jump_d(jump, target).unwrap();
        assert!(bc.has_long_jumps);

        bc.fold_jumps();
        bc.expand_jumps();

        // the stream gains a two-word trampoline before the jump
        assert_eq!(word::op(bc.insns[0]), Opcode::Jump.to_byte());
        assert_eq!(word::d(bc.insns[0]), 1);
        assert_eq!(word::op(bc.insns[1]), Opcode::JumpX.to_byte());
        assert_eq!(word::op(bc.insns[2]), Opcode::Jump.to_byte());
        assert_eq!(word::d(bc.insns[2]), -2);

        // JUMPX lands on the RETURN: target moved by 2, offset relative to
        // the word after the JUMPX
        assert_eq!(word::e_field(bc.insns[1]), target as i32 + 2 - 1 - 1);
        assert_eq!(word::op(bc.insns[target + 2]), Opcode::Return.to_byte());
    }

    #[test]
    fn test_jump_too_far() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        let jump = bc.emit_label();
        bc.emit_ad(Opcode::Jump, 0, 0);

        for _ in 0..MAX_JUMP_DISTANCE {
            bc.emit_abc(Opcode::Nop, 0, 0, 0);
        }

        let target = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        assert!(matches!(bc.patch_jump_d(jump, target), Err(EncodeError::JumpTooFar(_))));
    }

    #[test]
    #[ignore = "allocates the full 2^23-entry constant pool"]
    fn test_constant_pool_capacity() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        for i in 0..MAX_CONSTANT_COUNT {
            bc.add_constant_number(i as f64).unwrap();
        }

        assert_eq!(bc.add_constant_number(-1.0), Err(EncodeError::TooManyConstants));

        // existing entries still resolve through the cache
        assert_eq!(bc.add_constant_number(42.0).unwrap(), 42);

        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);
    }

    #[test]
    fn test_child_function_capacity() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);

        for fid in 0..MAX_CLOSURE_COUNT {
            bc.add_child_function(fid).unwrap();
        }

        assert_eq!(
            bc.add_child_function(MAX_CLOSURE_COUNT),
            Err(EncodeError::TooManyChildFunctions)
        );

        // existing entries still resolve through the cache
        assert_eq!(bc.add_child_function(42).unwrap(), 42);
    }

    #[test]
    fn test_error_blob() {
        let blob = BytecodeBuilder::encode_error_blob("fn: module too complex");

        assert_eq!(blob[0], 0);
        assert_eq!(&blob[1..], b"fn: module too complex");
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn test_nested_begin_panics() {
        let mut bc = BytecodeBuilder::new();
        bc.begin_function(0, false);
        bc.begin_function(0, false);
    }
}
