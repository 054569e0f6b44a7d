mod op;
mod instruction;
mod builder;
mod decoder;

pub use op::{FloatOp, LongOp, Op};
pub use instruction::{Instruction, Operand};
pub use builder::{BytecodeBuilder, Label, SwitchTable};
pub use decoder::BytecodeDecoder;

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<(Op, Option<Op>, Operand)> {
        BytecodeDecoder::new(bytes)
            .map(|i| (i.op, i.prefix, i.operand))
            .collect()
    }

    #[test]
    fn constants_pick_shortest_form() {
        let mut b = BytecodeBuilder::new();
        b.const_int(3);
        b.const_int(-1);
        b.const_int(-100);
        b.const_int(1000);
        b.const_int(100_000);
        b.const_long(-2);

        assert_eq!(b.current_offset(), 1 + 1 + 2 + 3 + 5 + 9);
        assert_eq!(decode_all(b.as_bytes()), vec![
            (Op::Const3, None, Operand::None),
            (Op::ConstM1, None, Operand::None),
            (Op::ConstByte, None, Operand::Int(-100)),
            (Op::ConstShort, None, Operand::Int(1000)),
            (Op::ConstInt, None, Operand::Int(100_000)),
            (Op::ConstLong, None, Operand::Long(-2)),
        ]);
    }

    #[test]
    fn locals_and_literals() {
        let mut b = BytecodeBuilder::new();
        b.load(2);
        b.store(20);
        b.object(5);
        b.class(300);
        b.extend(4);

        assert_eq!(decode_all(b.as_bytes()), vec![
            (Op::Load2, None, Operand::None),
            (Op::Store, None, Operand::Byte(20)),
            (Op::Object5, None, Operand::None),
            (Op::Class, Some(Op::WideHalf), Operand::Int(300)),
            (Op::Extend4, None, Operand::None),
        ]);
    }

    #[test]
    fn forward_branch_is_patched() {
        let mut b = BytecodeBuilder::new();
        b.load(0);
        let label = b.branch(Op::Ifeq);
        b.const_int(1);
        b.op(Op::Return1);
        b.bind(label);
        b.const_int(0);
        b.op(Op::Return1);

        let insns: Vec<_> = BytecodeDecoder::new(b.as_bytes()).collect();
        let branch = insns[1];
        assert_eq!(branch.op, Op::Ifeq);
        assert_eq!(branch.prefix, Some(Op::WideHalf));
        // skips `const_1; return1`
        assert_eq!(branch.operand, Operand::Int(2));
        assert_eq!(insns[4].offset, branch.offset + branch.length + 2);
    }

    #[test]
    fn backward_branch_short_and_wide() {
        let mut b = BytecodeBuilder::new();
        let head = b.current_offset();
        b.op(Op::Nop);
        b.branch_to(Op::Goto, head);
        for _ in 0..200 {
            b.op(Op::Nop);
        }
        b.branch_to(Op::Goto, head);

        let insns: Vec<_> = BytecodeDecoder::new(b.as_bytes())
            .filter(|i| i.op == Op::Goto)
            .collect();
        assert_eq!(insns[0].prefix, None);
        assert_eq!(insns[0].operand, Operand::Int(-3));
        assert_eq!(insns[1].prefix, Some(Op::WideHalf));
        let Operand::Int(off) = insns[1].operand else {
            panic!("expected int operand");
        };
        assert_eq!(insns[1].offset as i32 + insns[1].length as i32 + off, 0);
    }

    #[test]
    fn twelve_bit_wide_prefix_sign_extends() {
        // wide_15 goto 0xFF  =>  0xFFF  =>  -1
        let bytes = [Op::Wide15 as u8, Op::Goto as u8, 0xFF];
        let insn = BytecodeDecoder::new(&bytes).next().unwrap();
        assert_eq!(insn.op, Op::Goto);
        assert_eq!(insn.prefix, Some(Op::Wide15));
        assert_eq!(insn.operand, Operand::Int(-1));
        assert_eq!(insn.length, 3);

        let bytes = [Op::Wide7 as u8, Op::Object as u8, 0x10];
        let insn = BytecodeDecoder::new(&bytes).next().unwrap();
        assert_eq!(insn.operand, Operand::Int(0x710));
    }

    #[test]
    fn stable_switch_layout() {
        let mut b = BytecodeBuilder::new();
        b.load(0);
        let table = b.stable_switch(1, 3);
        b.bind_switch_case(&table, 2);
        b.const_int(7);
        b.bind_switch_default(&table);
        b.op(Op::Return);

        let bytes = b.into_bytes();
        let insns: Vec<_> = BytecodeDecoder::new(&bytes).collect();
        assert_eq!(insns.len(), 4);
        // load_0 at offset 0 puts the opcode at 1, so no pad is needed
        assert_eq!(insns[1].op, Op::Stableswitch);
        assert_eq!(insns[1].length, 1 + 2 + 4 + 4 + 3 * 2);
        let Operand::Switch { default, low, high } = insns[1].operand else {
            panic!("expected switch operand");
        };
        assert_eq!((low, high), (1, 3));
        let table_start = insns[1].offset + 1 + 10;
        assert_eq!(table_start + default as usize, insns[3].offset);
    }

    #[test]
    fn stable_switch_pads_to_half_word() {
        let mut b = BytecodeBuilder::new();
        b.op(Op::Nop);
        b.op(Op::Nop);
        b.stable_switch(0, 0);
        let insn = BytecodeDecoder::new(b.as_bytes()).nth(2).unwrap();
        assert_eq!(insn.op, Op::StableswitchPad);
        assert_eq!((insn.offset + 2 + 10) % 2, 0);
    }

    #[test]
    fn sub_opcodes() {
        let mut b = BytecodeBuilder::new();
        b.long_op(LongOp::Lcmp);
        b.float_op(FloatOp::D2i);
        assert_eq!(decode_all(b.as_bytes()), vec![
            (Op::LongOp, None, Operand::Byte(LongOp::Lcmp as u8)),
            (Op::FloatOp, None, Operand::Byte(FloatOp::D2i as u8)),
        ]);
        assert_eq!(LongOp::try_from(LongOp::COUNT as u8), Err(LongOp::COUNT as u8));
    }

    #[test]
    fn truncated_stream_ends_decoding() {
        let bytes = [Op::Nop as u8, Op::ConstInt as u8, 0, 0];
        let mut decoder = BytecodeDecoder::new(&bytes);
        assert_eq!(decoder.next().map(|i| i.op), Some(Op::Nop));
        assert!(decoder.next().is_none());
        assert!(decoder.is_at_end());
    }

    #[test]
    fn opcode_table_is_dense() {
        assert_eq!(Op::COUNT, 255);
        for b in 0..Op::COUNT as u8 {
            let op = Op::try_from(b).unwrap();
            assert_eq!(op as u8, b);
            assert!(!op.mnemonic().is_empty());
        }
        assert!(Op::try_from(255).is_err());
        assert_eq!(Op::Iadd as u8, 118);
        assert_eq!(Op::Goto as u8, 199);
        assert_eq!(Op::ThisPutfieldI2 as u8, 254);
        assert!(Op::Goto.accepts_wide_prefix());
        assert!(!Op::Load.accepts_wide_prefix());
        assert_eq!(Op::Load9.short_form_base(), Some(Op::Load0));
        assert_eq!(Op::WideHalf.short_form_base(), None);
    }

    #[test]
    fn display_formats_prefix_and_operand() {
        let bytes = [Op::WideHalf as u8, Op::Goto as u8, 0x01, 0x00];
        let insn = BytecodeDecoder::new(&bytes).next().unwrap();
        let text = insn.to_string();
        assert!(text.starts_with("[wide_half] goto"));
        assert!(text.ends_with("256"));
    }
}
