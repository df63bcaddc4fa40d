//! Whole-unit tests: build functions, finalize and walk the serialized blob.

use ferret_asm::{BytecodeBuilder, DumpFlags, lineinfo};
use ferret_bytecode::{BYTECODE_VERSION, ConstantTag, Opcode, TYPE_VERSION, word};

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> u8 {
        let value = self.data[self.pos];
        self.pos += 1;
        value
    }

    fn u32(&mut self) -> u32 {
        let value = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        value
    }

    fn f64(&mut self) -> f64 {
        let value = f64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        value
    }

    fn varint(&mut self) -> u32 {
        let mut result = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.byte();
            result |= ((byte & 127) as u32) << shift;
            shift += 7;

            if byte & 128 == 0 {
                break;
            }
        }

        result
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let value = &self.data[self.pos..self.pos + len];
        self.pos += len;
        value
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

fn code_dump_builder() -> BytecodeBuilder {
    let mut bc = BytecodeBuilder::new();
    bc.set_dump_flags(DumpFlags { code: true, ..DumpFlags::default() });
    bc
}

#[test]
fn test_add_two_constants_roundtrip() {
    let mut bc = code_dump_builder();

    let main = bc.begin_function(0, false);

    let k0 = bc.add_constant_number(1.0).unwrap();
    let k1 = bc.add_constant_number(2.0).unwrap();

    bc.emit_ad(Opcode::LoadK, 0, k0 as i16);
    bc.emit_ad(Opcode::LoadK, 1, k1 as i16);
    bc.emit_abc(Opcode::Add, 2, 0, 1);
    bc.emit_abc(Opcode::Return, 2, 2, 0);

    bc.end_function(3, 0, 0);
    bc.set_main_function(main);

    assert_eq!(
        bc.dump_function(main),
        "LOADK R0 K0 [1]\nLOADK R1 K1 [2]\nADD R2 R0 R1\nRETURN R2 1\n"
    );

    let blob = bc.finalize();
    let mut r = Reader::new(&blob);

    assert_eq!(r.byte(), BYTECODE_VERSION);
    assert_eq!(r.byte(), TYPE_VERSION);
    assert_eq!(r.varint(), 0); // string table is empty
    assert_eq!(r.byte(), 0); // end of the userdata type name mapping
    assert_eq!(r.varint(), 1); // one function

    // function header
    assert_eq!(r.byte(), 3); // max stack size
    assert_eq!(r.byte(), 0); // num params
    assert_eq!(r.byte(), 0); // num upvalues
    assert_eq!(r.byte(), 0); // is vararg
    assert_eq!(r.byte(), 0); // flags
    assert_eq!(r.varint(), 0); // no type info

    // instructions survive byte-exact
    assert_eq!(r.varint(), 4);
    let insns: Vec<u32> = (0..4).map(|_| r.u32()).collect();
    assert_eq!(word::op(insns[0]), Opcode::LoadK.to_byte());
    assert_eq!(word::op(insns[2]), Opcode::Add.to_byte());
    assert_eq!((word::a(insns[2]), word::b(insns[2]), word::c(insns[2])), (2, 0, 1));
    assert_eq!(word::op(insns[3]), Opcode::Return.to_byte());

    // constant pool
    assert_eq!(r.varint(), 2);
    assert_eq!(r.byte(), ConstantTag::Number as u8);
    assert_eq!(r.f64(), 1.0);
    assert_eq!(r.byte(), ConstantTag::Number as u8);
    assert_eq!(r.f64(), 2.0);

    assert_eq!(r.varint(), 0); // no child protos
    assert_eq!(r.varint(), 0); // debug line defined
    assert_eq!(r.varint(), 0); // no debug name
    assert_eq!(r.byte(), 0); // no line info (debug line never set)
    assert_eq!(r.byte(), 0); // no debug locals/upvals

    assert_eq!(r.varint(), main); // main function id
    assert!(r.at_end());
}

#[test]
fn test_string_table_and_debug_info() {
    let mut bc = BytecodeBuilder::new();

    let main = bc.begin_function(1, false);

    bc.set_debug_line(7);

    let key = bc.add_constant_string("field").unwrap();

    bc.emit_abc(Opcode::GetTableKS, 1, 0, 0);
    bc.emit_aux(key);
    bc.set_debug_line(8);
    bc.emit_abc(Opcode::Return, 1, 2, 0);

    bc.push_debug_local("arg", 0, 0, 3);
    bc.set_debug_function_name("getter");

    bc.end_function(2, 0, 0);
    bc.set_main_function(main);

    let blob = bc.finalize();
    let mut r = Reader::new(&blob);

    assert_eq!(r.byte(), BYTECODE_VERSION);
    assert_eq!(r.byte(), TYPE_VERSION);

    // string table holds the interned strings in first-use order, ids 1-based
    assert_eq!(r.varint(), 3);
    for expected in ["field", "arg", "getter"] {
        let len = r.varint() as usize;
        assert_eq!(r.bytes(len), expected.as_bytes());
    }

    assert_eq!(r.byte(), 0);
    assert_eq!(r.varint(), 1);

    // header
    assert_eq!(r.byte(), 2);
    assert_eq!(r.byte(), 1);
    assert_eq!(r.byte(), 0);
    assert_eq!(r.byte(), 0);
    assert_eq!(r.byte(), 0);
    assert_eq!(r.varint(), 0);

    assert_eq!(r.varint(), 3);
    for _ in 0..3 {
        r.u32();
    }

    // the string constant stores the 1-based string table reference
    assert_eq!(r.varint(), 1);
    assert_eq!(r.byte(), ConstantTag::String as u8);
    assert_eq!(r.varint(), 1);

    assert_eq!(r.varint(), 0); // protos
    assert_eq!(r.varint(), 0); // line defined
    assert_eq!(r.varint(), 3); // debug name is string id 3 ("getter")

    // line info present: lines 7, 7, 8 decode losslessly
    assert_eq!(r.byte(), 1);
    let lines = lineinfo::decode(&r.data[r.pos..], 3).unwrap();
    assert_eq!(lines, vec![7, 7, 8]);
    let logspan = r.byte() as usize;
    let baseline_count = (3 - 1 >> logspan) + 1;
    r.bytes(3 + baseline_count * 4);

    // debug locals
    assert_eq!(r.byte(), 1);
    assert_eq!(r.varint(), 1); // one local
    assert_eq!(r.varint(), 2); // name "arg" is string id 2
    assert_eq!(r.varint(), 0); // start pc
    assert_eq!(r.varint(), 3); // end pc
    assert_eq!(r.byte(), 0); // register
    assert_eq!(r.varint(), 0); // no upvalue names

    assert_eq!(r.varint(), main);
    assert!(r.at_end());
}

#[test]
fn test_type_info_block() {
    let mut bc = BytecodeBuilder::new();

    use ferret_bytecode::bctype;

    let main = bc.begin_function(1, false);

    bc.set_function_type_info(vec![bctype::FUNCTION, 1, bctype::NUMBER]);
    bc.push_local_type_info(bctype::NUMBER, 0, 0, 1);

    bc.emit_abc(Opcode::Return, 0, 2, 0);

    bc.end_function(1, 0, 0);
    bc.set_main_function(main);

    let blob = bc.finalize();
    let mut r = Reader::new(&blob);

    r.byte();
    r.byte();
    assert_eq!(r.varint(), 0);
    assert_eq!(r.byte(), 0);
    assert_eq!(r.varint(), 1);

    r.bytes(5); // header

    let block_size = r.varint() as usize;
    assert!(block_size > 0);

    let block_end = r.pos + block_size;
    assert_eq!(r.varint(), 3); // function signature bytes
    assert_eq!(r.varint(), 0); // typed upvalues
    assert_eq!(r.varint(), 1); // typed locals

    assert_eq!(r.bytes(3), [bctype::FUNCTION, 1, bctype::NUMBER]);

    assert_eq!(r.byte(), bctype::NUMBER);
    assert_eq!(r.byte(), 0); // register
    assert_eq!(r.varint(), 0); // start pc
    assert_eq!(r.varint(), 1); // length of the live range
    assert_eq!(r.pos, block_end);
}

#[test]
fn test_userdata_type_mapping() {
    let mut bc = BytecodeBuilder::new();

    let used = bc.add_userdata_type("Vec3");
    let unused = bc.add_userdata_type("Quat");
    assert_eq!((used, unused), (0, 1));

    bc.use_userdata_type(used);

    let main = bc.begin_function(0, false);
    bc.emit_abc(Opcode::Return, 0, 1, 0);
    bc.end_function(1, 0, 0);
    bc.set_main_function(main);

    let blob = bc.finalize();
    let mut r = Reader::new(&blob);

    r.byte();
    r.byte();

    // only the used type's name is interned
    assert_eq!(r.varint(), 1);
    let len = r.varint() as usize;
    assert_eq!(r.bytes(len), b"Vec3");

    // mapping entries appear for every registered type; unused ones carry a
    // zero name reference
    assert_eq!(r.byte(), 1);
    assert_eq!(r.varint(), 1);
    assert_eq!(r.byte(), 2);
    assert_eq!(r.varint(), 0);
    assert_eq!(r.byte(), 0);
}

#[test]
fn test_jump_fold_to_return() {
    let mut bc = code_dump_builder();

    let main = bc.begin_function(0, false);

    let jump = bc.emit_label();
    bc.emit_ad(Opcode::Jump, 0, 0);
    bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
    let ret = bc.emit_label();
    bc.emit_abc(Opcode::Return, 0, 1, 0);

    bc.patch_jump_d(jump, ret).unwrap();

    bc.end_function(1, 0, 0);
    bc.set_main_function(main);

    // the unconditional jump to RETURN is folded into a RETURN, so nothing
    // in the function is a jump target anymore
    assert_eq!(bc.dump_function(main), "RETURN R0 0\nLOADNIL R0\nRETURN R0 0\n");
}

#[test]
fn test_skip_patch_labels() {
    let mut bc = code_dump_builder();

    let main = bc.begin_function(0, false);

    let skip = bc.emit_label();
    bc.emit_abc(Opcode::LoadB, 0, 1, 0);
    bc.emit_abc(Opcode::LoadB, 0, 0, 0);
    bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
    let target = bc.emit_label();
    bc.emit_abc(Opcode::Return, 0, 2, 0);

    bc.patch_skip_c(skip, target).unwrap();

    bc.end_function(1, 0, 0);
    bc.set_main_function(main);

    assert_eq!(
        bc.dump_function(main),
        "LOADB R0 1 +2\nLOADB R0 0\nLOADNIL R0\nL0: RETURN R0 1\n"
    );
}

#[test]
fn test_long_branch_expansion() {
    let mut bc = code_dump_builder();

    let main = bc.begin_function(0, false);

    let branch = bc.emit_label();
    bc.emit_ad(Opcode::JumpIf, 0, 0);

    for _ in 0..40_000 {
        bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
    }

    let target = bc.emit_label();
    bc.emit_abc(Opcode::Return, 0, 1, 0);

    bc.patch_jump_d(branch, target).unwrap();

    bc.end_function(1, 0, 0);
    bc.set_main_function(main);

    let dump = bc.dump_function(main).to_owned();

    // the branch goes through a JUMP +1 / JUMPX trampoline: forward
    // execution hops over the JUMPX, a taken branch lands on it
    assert!(dump.starts_with("JUMP L1\nL0: JUMPX L2\nL1: JUMPIF R0 L0\n"));
    assert!(dump.ends_with("L2: RETURN R0 0\n"));

    // the serialized stream contains the two extra trampoline words
    let blob = bc.finalize();
    let mut r = Reader::new(&blob);

    r.byte();
    r.byte();
    assert_eq!(r.varint(), 0);
    assert_eq!(r.byte(), 0);
    assert_eq!(r.varint(), 1);
    r.bytes(5);
    assert_eq!(r.varint(), 0);
    assert_eq!(r.varint(), 40_004);
}

#[test]
fn test_error_blob_is_never_a_valid_version() {
    let blob = BytecodeBuilder::encode_error_blob("nested function limit reached");

    assert_eq!(blob[0], 0);
    assert_ne!(blob[0], BYTECODE_VERSION);
    assert_eq!(&blob[1..], b"nested function limit reached");
}
