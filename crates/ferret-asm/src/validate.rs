//! Debug-build validation of finished instruction streams
//!
//! Runs from `end_function` in builds with debug assertions. Failures are
//! panics: they indicate a defect in the code generator feeding the builder,
//! not a recoverable input error.

use ferret_bytecode::{CaptureKind, ConstantTag, Opcode, word};

use crate::builder::BytecodeBuilder;
use crate::constant::Constant;

impl BytecodeBuilder {
    pub(crate) fn validate(&self) {
        self.validate_instructions();
        self.validate_variadic();
    }

    fn validate_instructions(&self) {
        let id = self.current_function.expect("no function is open");
        let func = self.function_record(id);

        let max_stack_size = func.max_stack_size as u32;
        let num_upvalues = func.num_upvalues as u32;

        let vreg = |v: u32| assert!(v < max_stack_size, "register {v} out of range");
        let vregrange = |v: u32, count: i32| {
            assert!(
                v + count.max(0) as u32 <= max_stack_size,
                "register range {v}+{count} out of range"
            )
        };
        let vupval = |v: u32| assert!(v < num_upvalues, "upvalue {v} out of range");
        let vconst = |v: u32, tag: ConstantTag| {
            assert!((v as usize) < self.constants.len(), "constant {v} out of range");
            assert!(
                self.constants[v as usize].tag() == tag,
                "constant {v} has unexpected tag"
            );
        };
        let vconst_any =
            |v: u32| assert!((v as usize) < self.constants.len(), "constant {v} out of range");

        // tag instruction offsets so that jumps can be checked to land on
        // instruction starts rather than aux words
        let mut insnvalid = vec![false; self.insns.len()];

        let mut i = 0;
        while i < self.insns.len() {
            let op = self.opcode_at(i);

            insnvalid[i] = true;

            i += op.length();
            assert!(i <= self.insns.len());
        }

        let vjump = |i: usize, v: i32| {
            let target = i as i64 + 1 + v as i64;
            assert!(
                target >= 0 && (target as usize) < self.insns.len() && insnvalid[target as usize],
                "jump at {i} lands outside instruction boundaries"
            );
        };

        let mut open_captures: Vec<u8> = Vec::new();

        let mut i = 0;
        while i < self.insns.len() {
            let insn = self.insns[i];
            let op = self.opcode_at(i);

            let a = word::a(insn) as u32;
            let b = word::b(insn) as u32;
            let c = word::c(insn) as u32;

            match op {
                Opcode::LoadNil | Opcode::LoadN => vreg(a),

                Opcode::LoadB => {
                    vreg(a);
                    assert!(b == 0 || b == 1);
                    vjump(i, c as i32);
                }

                Opcode::LoadK => {
                    vreg(a);
                    vconst_any(word::d(insn) as u32);
                }

                Opcode::Move => {
                    vreg(a);
                    vreg(b);
                }

                Opcode::GetGlobal | Opcode::SetGlobal => {
                    vreg(a);
                    vconst(self.insns[i + 1], ConstantTag::String);
                }

                Opcode::GetUpval | Opcode::SetUpval => {
                    vreg(a);
                    vupval(b);
                }

                Opcode::CloseUpvals => {
                    vreg(a);
                    while open_captures.last().is_some_and(|&reg| reg as u32 >= a) {
                        open_captures.pop();
                    }
                }

                Opcode::GetImport => {
                    vreg(a);
                    vconst(word::d(insn) as u32, ConstantTag::Import);

                    // aux carries the import chain, length 1-3
                    let iid = self.insns[i + 1];
                    assert!(iid >> 30 != 0);
                    for j in 0..iid >> 30 {
                        vconst((iid >> (20 - 10 * j)) & 1023, ConstantTag::String);
                    }
                }

                Opcode::GetTable | Opcode::SetTable => {
                    vreg(a);
                    vreg(b);
                    vreg(c);
                }

                Opcode::GetTableKS | Opcode::SetTableKS => {
                    vreg(a);
                    vreg(b);
                    vconst(self.insns[i + 1], ConstantTag::String);
                }

                Opcode::GetTableN | Opcode::SetTableN => {
                    vreg(a);
                    vreg(b);
                }

                Opcode::NewClosure => {
                    vreg(a);

                    let proto = word::d(insn) as u32 as usize;
                    assert!(proto < self.protos.len());
                    assert!((self.protos[proto] as usize) < self.function_count());

                    let upvalues = self.function_record(self.protos[proto]).num_upvalues;
                    for j in 0..upvalues as usize {
                        assert!(i + 1 + j < self.insns.len());
                        let cinsn = self.insns[i + 1 + j];
                        assert!(word::op(cinsn) == Opcode::Capture.to_byte());
                    }
                }

                Opcode::NameCall => {
                    vreg(a);
                    vreg(b);
                    vconst(self.insns[i + 1], ConstantTag::String);
                    assert!(word::op(self.insns[i + 2]) == Opcode::Call.to_byte());
                }

                Opcode::Call => {
                    let nparams = b as i32 - 1;
                    let nresults = c as i32 - 1;
                    vreg(a);
                    vregrange(a + 1, nparams); // 1..nparams
                    vregrange(a, nresults); // 1..nresults
                }

                Opcode::Return => {
                    let nresults = b as i32 - 1;
                    vregrange(a, nresults); // 0..nresults-1
                }

                Opcode::Jump | Opcode::JumpBack => vjump(i, word::d(insn)),

                Opcode::JumpIf | Opcode::JumpIfNot => {
                    vreg(a);
                    vjump(i, word::d(insn));
                }

                Opcode::JumpIfEq
                | Opcode::JumpIfLe
                | Opcode::JumpIfLt
                | Opcode::JumpIfNotEq
                | Opcode::JumpIfNotLe
                | Opcode::JumpIfNotLt => {
                    vreg(a);
                    vreg(self.insns[i + 1]);
                    vjump(i, word::d(insn));
                }

                Opcode::JumpXEqKNil | Opcode::JumpXEqKB => {
                    vreg(a);
                    vjump(i, word::d(insn));
                }

                Opcode::JumpXEqKN => {
                    vreg(a);
                    vconst(self.insns[i + 1] & 0xffffff, ConstantTag::Number);
                    vjump(i, word::d(insn));
                }

                Opcode::JumpXEqKS => {
                    vreg(a);
                    vconst(self.insns[i + 1] & 0xffffff, ConstantTag::String);
                    vjump(i, word::d(insn));
                }

                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::IDiv
                | Opcode::Mod
                | Opcode::Pow
                | Opcode::And
                | Opcode::Or => {
                    vreg(a);
                    vreg(b);
                    vreg(c);
                }

                Opcode::AddK
                | Opcode::SubK
                | Opcode::MulK
                | Opcode::DivK
                | Opcode::IDivK
                | Opcode::ModK
                | Opcode::PowK => {
                    vreg(a);
                    vreg(b);
                    vconst(c, ConstantTag::Number);
                }

                Opcode::SubRK | Opcode::DivRK => {
                    vreg(a);
                    vconst(b, ConstantTag::Number);
                    vreg(c);
                }

                Opcode::AndK | Opcode::OrK => {
                    vreg(a);
                    vreg(b);
                    vconst_any(c);
                }

                Opcode::Concat => {
                    vreg(a);
                    vreg(b);
                    vreg(c);
                    assert!(b <= c);
                }

                Opcode::Not | Opcode::Minus | Opcode::Length => {
                    vreg(a);
                    vreg(b);
                }

                Opcode::NewTable => vreg(a),

                Opcode::DupTable => {
                    vreg(a);
                    vconst(word::d(insn) as u32, ConstantTag::Table);
                }

                Opcode::SetList => {
                    let count = c as i32 - 1;
                    vreg(a);
                    vregrange(b, count);
                }

                // for loop protocol: A, A+1, A+2 are used for iteration
                Opcode::ForNPrep | Opcode::ForNLoop => {
                    vreg(a + 2);
                    vjump(i, word::d(insn));
                }

                // forg loop protocol: A, A+1, A+2 are used for the iteration
                // protocol; A+3, ... are loop variables
                Opcode::ForGPrep => {
                    vreg(a + 2 + 1);
                    vjump(i, word::d(insn));
                }

                Opcode::ForGLoop => {
                    vreg(a + 2 + (self.insns[i + 1] as u8) as u32);
                    vjump(i, word::d(insn));
                    assert!(self.insns[i + 1] as u8 >= 1);
                }

                Opcode::ForGPrepINext | Opcode::ForGPrepNext => {
                    vreg(a + 4);
                    vjump(i, word::d(insn));
                }

                Opcode::GetVarargs => {
                    let nresults = b as i32 - 1;
                    vregrange(a, nresults); // 0..nresults-1
                }

                Opcode::DupClosure => {
                    vreg(a);
                    vconst(word::d(insn) as u32, ConstantTag::Closure);

                    let Constant::Closure(proto) = self.constants[word::d(insn) as usize] else {
                        unreachable!()
                    };
                    assert!((proto as usize) < self.function_count());

                    let upvalues = self.function_record(proto).num_upvalues;
                    for j in 0..upvalues as usize {
                        assert!(i + 1 + j < self.insns.len());
                        let cinsn = self.insns[i + 1 + j];
                        assert!(word::op(cinsn) == Opcode::Capture.to_byte());

                        // cached closures can't capture by reference
                        let kind = CaptureKind::from_byte(word::a(cinsn));
                        assert!(kind == Some(CaptureKind::Val) || kind == Some(CaptureKind::Upval));
                    }
                }

                Opcode::PrepVarargs => {
                    assert!(a == func.num_params as u32);
                    assert!(func.is_vararg);
                }

                Opcode::LoadKX => {
                    vreg(a);
                    vconst_any(self.insns[i + 1]);
                }

                Opcode::JumpX => vjump(i, word::e_field(insn)),

                Opcode::FastCall => {
                    vjump(i, c as i32);
                    assert!(word::op(self.insns[i + 1 + c as usize]) == Opcode::Call.to_byte());
                }

                Opcode::FastCall1 => {
                    vreg(b);
                    vjump(i, c as i32);
                    assert!(word::op(self.insns[i + 1 + c as usize]) == Opcode::Call.to_byte());
                }

                Opcode::FastCall2 => {
                    vreg(b);
                    vjump(i, c as i32);
                    assert!(word::op(self.insns[i + 1 + c as usize]) == Opcode::Call.to_byte());
                    vreg(self.insns[i + 1]);
                }

                Opcode::FastCall2K => {
                    vreg(b);
                    vjump(i, c as i32);
                    assert!(word::op(self.insns[i + 1 + c as usize]) == Opcode::Call.to_byte());
                    vconst_any(self.insns[i + 1]);
                }

                Opcode::FastCall3 => {
                    vreg(b);
                    vjump(i, c as i32);
                    assert!(word::op(self.insns[i + 1 + c as usize]) == Opcode::Call.to_byte());
                    vreg(self.insns[i + 1] & 0xff);
                    vreg((self.insns[i + 1] >> 8) & 0xff);
                }

                Opcode::Capture => match CaptureKind::from_byte(word::a(insn)) {
                    Some(CaptureKind::Val) => vreg(b),
                    Some(CaptureKind::Ref) => {
                        vreg(b);
                        open_captures.push(b as u8);
                    }
                    Some(CaptureKind::Upval) => vupval(b),
                    None => panic!("unsupported capture kind {a}"),
                },

                Opcode::Nop | Opcode::Break | Opcode::Coverage => {}
            }

            i += op.length();
            assert!(i <= self.insns.len());
        }

        // every by-ref capture needs a CLOSEUPVALS later in the stream; this
        // is not a full basic-block analysis, but a failure here means the
        // bytecode is definitely unsafe to run
        assert!(open_captures.is_empty(), "by-ref capture without CLOSEUPVALS");
    }

    // Variadic (multret) sequences: a producer (an instruction that leaves
    // more than one value on the stack top) must be followed by zero or more
    // neutral instructions and exactly one consumer. Except for the producer,
    // no instruction in the sequence may be a jump target; this guarantees an
    // uninterrupted stack-top adjustment flow.
    fn validate_variadic(&self) {
        let mut variadic_seq = false;

        let mut insntargets = vec![false; self.insns.len()];

        let mut i = 0;
        while i < self.insns.len() {
            let insn = self.insns[i];
            let op = self.opcode_at(i);

            // fast-call targets are exempt: the skipped-over instructions
            // only run on the fallback path
            if !op.is_fast_call() {
                if let Some(target) = word::jump_target(insn, i as u32) {
                    assert!((target as usize) < self.insns.len());

                    insntargets[target as usize] = true;
                }
            }

            i += op.length();
            assert!(i <= self.insns.len());
        }

        let mut i = 0;
        while i < self.insns.len() {
            let insn = self.insns[i];
            let op = self.opcode_at(i);

            if variadic_seq {
                assert!(!insntargets[i], "jump target inside a variadic sequence");
            }

            match op {
                // calls may end one variadic sequence and start a new one
                Opcode::Call => {
                    if word::b(insn) == 0 {
                        // consumer ends the sequence
                        assert!(variadic_seq);
                        variadic_seq = false;
                    } else {
                        // CALL is not neutral, so it can't appear inside a
                        // sequence unless it is the consumer
                        assert!(!variadic_seq);
                    }

                    if word::c(insn) == 0 {
                        // producer starts a sequence
                        assert!(!variadic_seq);
                        variadic_seq = true;
                    }
                }

                Opcode::GetVarargs if word::b(insn) == 0 => {
                    assert!(!variadic_seq);
                    variadic_seq = true;
                }

                Opcode::Return if word::b(insn) == 0 => {
                    assert!(variadic_seq);
                    variadic_seq = false;
                }

                Opcode::SetList if word::c(insn) == 0 => {
                    assert!(variadic_seq);
                    variadic_seq = false;
                }

                Opcode::FastCall => {
                    let call_target = i + word::c(insn) as usize + 1;
                    assert!(call_target < self.insns.len());
                    assert!(word::op(self.insns[call_target]) == Opcode::Call.to_byte());

                    // when the linked CALL is a consumer, sequence termination
                    // is deferred to that CALL: on the fallback path the
                    // instructions in between execute before the stack top is
                    // reset, so they must be neutral and stay in the sequence
                    if word::b(self.insns[call_target]) == 0 {
                        assert!(variadic_seq);
                    } else {
                        assert!(!variadic_seq);
                    }
                }

                // the handful of neutral instructions expected in fast-call
                // fallback sequences or between consecutive calls
                Opcode::CloseUpvals
                | Opcode::NameCall
                | Opcode::GetImport
                | Opcode::Move
                | Opcode::GetUpval
                | Opcode::GetGlobal
                | Opcode::GetTableKS
                | Opcode::Coverage => {}

                _ => assert!(!variadic_seq, "non-neutral instruction inside a variadic sequence"),
            }

            i += op.length();
            assert!(i <= self.insns.len());
        }

        assert!(!variadic_seq, "unterminated variadic sequence");
    }
}
