//! Trampoline synthesis.
//!
//! `synthesize` rewrites the single displaced first instruction of a hooked
//! function into a self-contained position-independent sequence. Every shape
//! ends by depositing control at `hooked + 4` (the second original
//! instruction), and every absolute address is materialized as two literal
//! words, low half first, loaded indirectly — a 64-bit address never fits a
//! single immediate, which is the reason the category split exists.

use crate::arch::arm64::classifier::{
    adr_offset, branch_offset_imm14, branch_offset_imm19, branch_offset_imm26, rt, test_bit,
    Category,
};
use crate::arch::arm64::writer::{WordWriter, COND_EQ, COND_NE, X16, X17, X30};

/// The fixed two-word entry stub: `LDR X16, #-8; BR X16`. The 64-bit
/// replacement address sits immediately before the stub in reflector memory.
pub const ENTRY_STUB: [u32; 2] = [0x58FF_FFD0, 0xD61F_0200];

/// Entry stub for a given replacement; the shape is fixed, the address is
/// written separately by the installer.
pub fn entry_stub() -> [u32; 2] {
    ENTRY_STUB
}

/// Emit the position-independent equivalent of `word`, the first instruction
/// of the function at `hooked`. `placed_at` is the address the sequence will
/// execute from; only the page-relative shapes (AddressRelative,
/// LoadRegisterLiteral) encode against it.
pub fn synthesize(category: Category, word: u32, hooked: u64, placed_at: u64) -> Vec<u32> {
    let fallthrough = hooked.wrapping_add(4);
    let mut w = WordWriter::with_capacity(category.trampoline_words());

    match category {
        Category::Plain => {
            w.put_raw(word);
            w.put_ldr_lit(X16, 2);
            w.put_br(X16);
            w.put_addr(fallthrough);
        }
        Category::ConditionalBranch => {
            let dest = (hooked as i64).wrapping_add(branch_offset_imm19(word)) as u64;
            let cond = word & 0xF;
            w.put_ldr_lit(X16, 4); // taken destination
            w.put_ldr_lit(X17, 5); // fallthrough
            w.put_csel(X16, X16, X17, cond);
            w.put_br(X16);
            w.put_addr(dest);
            w.put_addr(fallthrough);
        }
        Category::CompareAndBranch { branch_if_nonzero } => {
            let dest = (hooked as i64).wrapping_add(branch_offset_imm19(word)) as u64;
            let sf = (word >> 31) == 1;
            let cond = if branch_if_nonzero { COND_NE } else { COND_EQ };
            w.put_ldr_lit(X16, 5);
            w.put_ldr_lit(X17, 6);
            w.put_cmp_zero(rt(word), sf);
            w.put_csel(X16, X16, X17, cond);
            w.put_br(X16);
            w.put_addr(dest);
            w.put_addr(fallthrough);
        }
        Category::TestBitAndBranch { branch_if_nonzero } => {
            let dest = (hooked as i64).wrapping_add(branch_offset_imm14(word)) as u64;
            let cond = if branch_if_nonzero { COND_NE } else { COND_EQ };
            w.put_ldr_lit(X16, 5);
            w.put_ldr_lit(X17, 6);
            w.put_tst_bit(rt(word), test_bit(word));
            w.put_csel(X16, X16, X17, cond);
            w.put_br(X16);
            w.put_addr(dest);
            w.put_addr(fallthrough);
        }
        Category::AddressRelative => {
            // Recompute the absolute target from the original location,
            // then rebuild it page-relative to where this sequence runs.
            let target = if (word >> 31) == 1 {
                // ADRP: offset is in pages from the original pc's page.
                ((hooked & !0xFFF) as i64).wrapping_add(adr_offset(word) << 12) as u64
            } else {
                (hooked as i64).wrapping_add(adr_offset(word)) as u64
            };
            let rd = rt(word);
            w.put_adrp(rd, placed_at, target);
            w.put_add_imm(rd, rd, (target & 0xFFF) as u32);
            w.put_ldr_lit(X16, 2);
            w.put_br(X16);
            w.put_addr(fallthrough);
        }
        Category::UnconditionalBranch => {
            let dest = (hooked as i64).wrapping_add(branch_offset_imm26(word)) as u64;
            w.put_ldr_lit(X16, 2);
            w.put_br(X16);
            w.put_addr(dest);
        }
        Category::UnconditionalBranchWithLink => {
            let dest = (hooked as i64).wrapping_add(branch_offset_imm26(word)) as u64;
            // The caller's return address must survive the nested call.
            w.put_mov_reg(X17, X30);
            w.put_ldr_lit(X16, 5);
            w.put_blr(X16);
            w.put_mov_reg(X30, X17);
            w.put_ldr_lit(X16, 4);
            w.put_br(X16);
            w.put_addr(dest);
            w.put_addr(fallthrough);
        }
        Category::LoadRegisterLiteral => {
            let literal = (hooked as i64).wrapping_add(branch_offset_imm19(word)) as u64;
            w.put_adrp(X16, placed_at, literal);
            w.put_add_imm(X16, X16, (literal & 0xFFF) as u32);
            w.put_raw(reencode_literal_load(word));
            w.put_ldr_lit(X16, 2);
            w.put_br(X16);
            w.put_addr(fallthrough);
        }
    }

    let words = w.into_words();
    debug_assert_eq!(words.len(), category.trampoline_words());
    words
}

/// Rewrite a load-literal instruction to the equivalent register-indirect
/// form through X16, keeping opcode, width and destination untouched.
fn reencode_literal_load(word: u32) -> u32 {
    let opc = word >> 30;
    let v = (word >> 26) & 1;
    let base = match (opc, v) {
        (0, 0) => 0xB940_0000, // LDR Wt
        (1, 0) => 0xF940_0000, // LDR Xt
        (2, 0) => 0xB980_0000, // LDRSW Xt
        (3, 0) => 0xF980_0000, // PRFM
        (0, 1) => 0xBD40_0000, // LDR St
        (1, 1) => 0xFD40_0000, // LDR Dt
        (2, 1) => 0x3DC0_0000, // LDR Qt
        // The classifier rejects (3, 1) before synthesis.
        _ => unreachable!("unallocated load-literal form"),
    };
    base | (X16 << 5) | rt(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::classifier::classify;

    fn addr_at(words: &[u32], idx: usize) -> u64 {
        (words[idx] as u64) | ((words[idx + 1] as u64) << 32)
    }

    /// Straight-line evaluator over the narrow instruction set the
    /// synthesizer emits. Returns the branch destination.
    fn run(words: &[u32], reg: (u32, u64), cond_holds: bool) -> u64 {
        let mut regs = [0u64; 32];
        regs[reg.0 as usize] = reg.1;
        let mut eq: Option<bool> = None;

        for (i, &insn) in words.iter().enumerate() {
            if (insn & 0xFF00_0000) == 0x5800_0000 {
                // LDR Xt, [PC, #imm19*4]
                let off = ((((insn >> 5) & 0x7FFFF) as i64) << 45 >> 45) as isize;
                let lit = (i as isize + off) as usize;
                regs[(insn & 0x1F) as usize] = addr_at(words, lit);
            } else if (insn & 0xFFFF_FC1F) == 0xD61F_0000 {
                return regs[((insn >> 5) & 0x1F) as usize];
            } else if (insn & 0xFFE0_0C00) == 0x9A80_0000 {
                let holds = match (insn >> 12) & 0xF {
                    COND_EQ => eq.expect("CSEL EQ without flags"),
                    COND_NE => !eq.expect("CSEL NE without flags"),
                    _ => cond_holds,
                };
                let (rd, rn, rm) = (insn & 0x1F, (insn >> 5) & 0x1F, (insn >> 16) & 0x1F);
                regs[rd as usize] = if holds { regs[rn as usize] } else { regs[rm as usize] };
            } else if (insn & 0x7FFF_FC1F) == 0x7100_001F {
                let val = regs[((insn >> 5) & 0x1F) as usize];
                eq = Some(if insn >> 31 == 1 { val == 0 } else { val as u32 == 0 });
            } else if (insn & 0x7F80_FC1F) == 0x7200_001F {
                let immr = (insn >> 16) & 0x3F;
                let bit = if insn >> 31 == 1 { (64 - immr) % 64 } else { (32 - immr) % 32 };
                let val = regs[((insn >> 5) & 0x1F) as usize];
                eq = Some((val >> bit) & 1 == 0);
            }
            // Anything else (the re-emitted original, MOV, BLR) does not
            // affect the destination computation in these tests.
        }
        panic!("sequence did not branch");
    }

    fn synth(word: u32, hooked: u64, placed_at: u64) -> Vec<u32> {
        synthesize(classify(word).unwrap(), word, hooked, placed_at)
    }

    #[test]
    fn word_counts_match_shapes() {
        let cases: [(u32, usize); 8] = [
            (0xD503201F, 5),  // NOP (plain)
            (0x540000C3, 8),  // B.LO
            (0xB40000C0, 9),  // CBZ X0
            (0x37480061, 9),  // TBNZ W1
            (0x5000A721, 6),  // ADR X1
            (0x14000040, 4),  // B
            (0x94000010, 10), // BL
            (0x58000050, 7),  // LDR X16 (literal)
        ];
        for (word, n) in cases {
            assert_eq!(synth(word, 0x1000, 0x8000).len(), n, "{word:#010x}");
        }
    }

    #[test]
    fn every_resuming_shape_ends_with_fallthrough_halves() {
        // All categories except B (which has no fallthrough) keep
        // hooked + 4 in the final two words, low then high.
        let hooked = 0xFFFF_FFF0_0700_4000u64;
        for word in [0xD503201Fu32, 0x540000C3, 0xB40000C0, 0x37480061, 0x5000A721, 0x94000010, 0x58000050] {
            let t = synth(word, hooked, 0xFFFF_FFF0_0900_0000);
            assert_eq!(addr_at(&t, t.len() - 2), hooked + 4, "{word:#010x}");
        }
    }

    #[test]
    fn plain_reemits_original_then_branches_back() {
        let t = synth(0xA9BE4FF4, 0x1000, 0x8000); // STP
        assert_eq!(t[0], 0xA9BE4FF4);
        assert_eq!(t[1], 0x58000050); // LDR X16, #0x8
        assert_eq!(t[2], 0xD61F0200); // BR X16
        assert_eq!(addr_at(&t, 3), 0x1004);
    }

    #[test]
    fn unconditional_branch_with_offset_0x100() {
        let target = 0xFFFF_FFF0_0700_0000u64;
        let t = synth(0x14000040, target, 0xFFFF_FFF0_0800_0000); // B #+0x100
        assert_eq!(t.len(), 4);
        assert_eq!(t[0], 0x58000050); // LDR X16, #0x8
        assert_eq!(t[1], 0xD61F0200); // BR X16
        assert_eq!(addr_at(&t, 2), target + 0x100);
    }

    #[test]
    fn branch_with_link_preserves_link_register() {
        let target = 0x4000u64;
        let t = synth(0x94000010, target, 0x8000); // BL #+0x40
        assert_eq!(t.len(), 10);
        assert_eq!(t[0], 0xAA1E03F1); // MOV X17, X30
        assert_eq!(t[1], 0x580000B0); // LDR X16, #0x14
        assert_eq!(t[2], 0xD63F0200); // BLR X16
        assert_eq!(t[3], 0xAA1103FE); // MOV X30, X17
        assert_eq!(t[4], 0x58000090); // LDR X16, #0x10
        assert_eq!(t[5], 0xD61F0200); // BR X16
        assert_eq!(addr_at(&t, 6), target + 0x40);
        assert_eq!(addr_at(&t, 8), target + 4);
    }

    #[test]
    fn conditional_branch_selects_between_both_destinations() {
        let hooked = 0x2000u64;
        let t = synth(0x540000C3, hooked, 0x8000); // B.LO #+24
        assert_eq!(run(&t, (0, 0), true), hooked + 24);
        assert_eq!(run(&t, (0, 0), false), hooked + 4);
    }

    #[test]
    fn compare_and_branch_rederives_condition_from_register() {
        let hooked = 0x2000u64;
        let cbz = synth(0xB40000C0, hooked, 0x8000); // CBZ X0, #+24
        assert_eq!(run(&cbz, (0, 0), false), hooked + 24);
        assert_eq!(run(&cbz, (0, 7), false), hooked + 4);

        let cbnz = synth(0xB50000C0, hooked, 0x8000); // CBNZ X0, #+24
        assert_eq!(run(&cbnz, (0, 7), false), hooked + 24);
        assert_eq!(run(&cbnz, (0, 0), false), hooked + 4);
    }

    #[test]
    fn compare_and_branch_32_bit_ignores_high_half() {
        let hooked = 0x2000u64;
        let cbz_w = synth(0x340000C0, hooked, 0x8000); // CBZ W0, #+24
        // Register holds a value that is zero only in its low 32 bits.
        assert_eq!(run(&cbz_w, (0, 0xDEAD_0000_0000_0000), false), hooked + 24);
    }

    #[test]
    fn test_bit_and_branch_rederives_condition_from_bit() {
        let hooked = 0x2000u64;
        let tbnz = synth(0x37480061, hooked, 0x8000); // TBNZ W1, #9, #+12
        assert_eq!(run(&tbnz, (1, 1 << 9), false), hooked + 12);
        assert_eq!(run(&tbnz, (1, 0), false), hooked + 4);

        let tbz = synth(0x36480061, hooked, 0x8000); // TBZ W1, #9, #+12
        assert_eq!(run(&tbz, (1, 0), false), hooked + 12);
        assert_eq!(run(&tbz, (1, 1 << 9), false), hooked + 4);
    }

    #[test]
    fn address_relative_rebuilds_target_from_new_location() {
        let hooked = 0x0000_4000u64;
        let placed = 0x0900_0000u64;
        let t = synth(0x5000A721, hooked, placed); // ADR X1, #+0x14E6
        assert_eq!(t.len(), 6);
        let target = hooked + 0x14E6;
        // ADRP X1 against the trampoline's own page, then ADD of the low bits.
        let page_off = (((target & !0xFFF) as i64 - (placed & !0xFFF) as i64) >> 12) as u32;
        let adrp = 0x9000_0000 | ((page_off & 3) << 29) | (((page_off >> 2) & 0x7FFFF) << 5) | 1;
        assert_eq!(t[0], adrp);
        assert_eq!(t[1], 0x9100_0000 | (((target & 0xFFF) as u32) << 10) | (1 << 5) | 1);
        assert_eq!(addr_at(&t, 4), hooked + 4);
    }

    #[test]
    fn adrp_original_recomputes_page_target() {
        let hooked = 0x0000_4ABCu64;
        let t = synth(0xD000A723, hooked, 0x0900_0000); // ADRP X3, #+0x14E6 pages
        let target = (hooked & !0xFFF) + (0x14E6 << 12);
        // Low 12 bits of an ADRP target are zero, so the ADD adds nothing.
        assert_eq!(t[1], 0x9100_0000 | (3 << 5) | 3);
        let page_off = (((target & !0xFFF) as i64 - (0x0900_0000i64 & !0xFFF)) >> 12) as u32;
        let adrp = 0x9000_0000 | ((page_off & 3) << 29) | (((page_off >> 2) & 0x7FFFF) << 5) | 3;
        assert_eq!(t[0], adrp);
    }

    #[test]
    fn literal_load_switches_to_register_indirect() {
        let hooked = 0x6000u64;
        // LDR X5, [PC, #+8] → literal at hooked + 8.
        let word = 0x5800_0000 | (2 << 5) | 5;
        let t = synth(word, hooked, 0x9000);
        assert_eq!(t.len(), 7);
        assert_eq!(t[2], 0xF940_0000 | (16 << 5) | 5); // LDR X5, [X16]
        assert_eq!(t[3], 0x58000050);
        assert_eq!(t[4], 0xD61F0200);
        assert_eq!(addr_at(&t, 5), hooked + 4);
    }

    #[test]
    fn prefetch_and_fp_literals_keep_their_opcode() {
        let cases = [
            (0xD8000042u32, 0xF980_0000u32 | (16 << 5) | 2), // PRFM
            (0x1C000040, 0xBD40_0000 | (16 << 5)),           // LDR S0
            (0x5C000040, 0xFD40_0000 | (16 << 5)),           // LDR D0
            (0x9C000040, 0x3DC0_0000 | (16 << 5)),           // LDR Q0
            (0x18000052, 0xB940_0000 | (16 << 5) | 18),      // LDR W18
            (0x98000041, 0xB980_0000 | (16 << 5) | 1),       // LDRSW X1
        ];
        for (word, expect) in cases {
            let t = synth(word, 0x6000, 0x9000);
            assert_eq!(t[2], expect, "{word:#010x}");
        }
    }

    #[test]
    fn synthesis_is_deterministic() {
        for word in [0x540000C3u32, 0x94000010, 0x58000050] {
            assert_eq!(synth(word, 0x2000, 0x8000), synth(word, 0x2000, 0x8000));
        }
    }
}
