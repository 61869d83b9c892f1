//! AArch64 instruction emission into a word buffer.
//!
//! Trampolines are assembled here and copied into reflector memory by the
//! installer, so the writer targets an owned `Vec<u32>` rather than a raw
//! code pointer. Absolute addresses are always emitted as two consecutive
//! literal words, low half first, and loaded indirectly.

pub const X16: u32 = 16;
pub const X17: u32 = 17;
pub const X30: u32 = 30;

/// Condition codes as encoded in B.cond / CSEL.
pub const COND_EQ: u32 = 0x0;
pub const COND_NE: u32 = 0x1;

#[derive(Debug, Default)]
pub struct WordWriter {
    words: Vec<u32>,
}

impl WordWriter {
    pub fn with_capacity(words: usize) -> Self {
        Self { words: Vec::with_capacity(words) }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    pub fn put_raw(&mut self, insn: u32) {
        self.words.push(insn);
    }

    /// LDR Xt, [PC, #imm19*4] (64-bit literal load). `offset_words` is
    /// relative to this instruction and may be negative.
    pub fn put_ldr_lit(&mut self, rt: u32, offset_words: i32) {
        let imm19 = (offset_words as u32) & 0x7FFFF;
        self.put_raw(0x5800_0000 | (imm19 << 5) | (rt & 0x1F));
    }

    pub fn put_br(&mut self, rn: u32) {
        self.put_raw(0xD61F_0000 | ((rn & 0x1F) << 5));
    }

    pub fn put_blr(&mut self, rn: u32) {
        self.put_raw(0xD63F_0000 | ((rn & 0x1F) << 5));
    }

    /// MOV Xd, Xm (alias of ORR Xd, XZR, Xm).
    pub fn put_mov_reg(&mut self, rd: u32, rm: u32) {
        self.put_raw(0xAA00_03E0 | ((rm & 0x1F) << 16) | (rd & 0x1F));
    }

    /// CSEL Xd, Xn, Xm, cond.
    pub fn put_csel(&mut self, rd: u32, rn: u32, rm: u32, cond: u32) {
        self.put_raw(
            0x9A80_0000
                | ((rm & 0x1F) << 16)
                | ((cond & 0xF) << 12)
                | ((rn & 0x1F) << 5)
                | (rd & 0x1F),
        );
    }

    /// CMP Rn, #0 (alias of SUBS ZR, Rn, #0); `sf` selects X vs W.
    pub fn put_cmp_zero(&mut self, rn: u32, sf: bool) {
        let base = if sf { 0xF100_001F } else { 0x7100_001F };
        self.put_raw(base | ((rn & 0x1F) << 5));
    }

    /// TST Rn, #(1 << bit) (alias of ANDS ZR, Rn, #imm). Bits 32..63
    /// force the 64-bit form; below that the 32-bit form is used, matching
    /// the register width TBZ/TBNZ operate on.
    pub fn put_tst_bit(&mut self, rn: u32, bit: u32) {
        let insn = if bit >= 32 {
            // sf=1, N=1, imms=0 (one set bit), immr rotates it into place.
            let immr = (64 - bit) % 64;
            0xF240_001F | (immr << 16)
        } else {
            let immr = (32 - bit) % 32;
            0x7200_001F | (immr << 16)
        };
        self.put_raw(insn | ((rn & 0x1F) << 5));
    }

    /// ADRP Xd, target page. `pc` is the address this instruction will
    /// execute from once placed. The 21-bit page immediate reaches ±4 GiB;
    /// a target further away than that cannot be encoded.
    pub fn put_adrp(&mut self, rd: u32, pc: u64, target: u64) {
        let page_off = ((target & !0xFFF) as i64 - (pc & !0xFFF) as i64) >> 12;
        debug_assert!(
            (-(1 << 20)..(1 << 20)).contains(&page_off),
            "page delta out of ADRP range"
        );
        let immlo = (page_off as u32) & 0x3;
        let immhi = ((page_off as u32) >> 2) & 0x7FFFF;
        self.put_raw(0x9000_0000 | (immlo << 29) | (immhi << 5) | (rd & 0x1F));
    }

    /// ADD Xd, Xn, #imm12.
    pub fn put_add_imm(&mut self, rd: u32, rn: u32, imm12: u32) {
        self.put_raw(0x9100_0000 | ((imm12 & 0xFFF) << 10) | ((rn & 0x1F) << 5) | (rd & 0x1F));
    }

    /// A 64-bit address as two literal words, low half first.
    pub fn put_addr(&mut self, addr: u64) {
        self.put_raw(addr as u32);
        self.put_raw((addr >> 32) as u32);
    }
}

/// B with an immediate offset from `from` to `to`, or None when out of the
/// ±128 MiB range of a 26-bit branch.
pub fn branch_imm(from: u64, to: u64) -> Option<u32> {
    let off = (to as i64).wrapping_sub(from as i64);
    if off & 3 != 0 || !(-(1 << 27)..(1 << 27)).contains(&off) {
        return None;
    }
    let imm26 = ((off >> 2) as u32) & 0x03FF_FFFF;
    Some(0x1400_0000 | imm26)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ldr_literal_forward_and_back() {
        let mut w = WordWriter::default();
        w.put_ldr_lit(X16, 2); // LDR X16, #0x8
        w.put_ldr_lit(X16, -2); // LDR X16, #-0x8
        let words = w.into_words();
        assert_eq!(words[0], 0x58000050);
        assert_eq!(words[1], 0x58FFFFD0);
    }

    #[test]
    fn encode_br_blr() {
        let mut w = WordWriter::default();
        w.put_br(X16);
        w.put_blr(X16);
        let words = w.into_words();
        assert_eq!(words[0], 0xD61F0200);
        assert_eq!(words[1], 0xD63F0200);
    }

    #[test]
    fn encode_mov_between_link_and_scratch() {
        let mut w = WordWriter::default();
        w.put_mov_reg(X17, X30);
        w.put_mov_reg(X30, X17);
        let words = w.into_words();
        assert_eq!(words[0], 0xAA1E03F1);
        assert_eq!(words[1], 0xAA1103FE);
    }

    #[test]
    fn encode_csel_x16_x16_x17() {
        let mut w = WordWriter::default();
        w.put_csel(X16, X16, X17, COND_EQ);
        w.put_csel(X16, X16, X17, COND_NE);
        let words = w.into_words();
        assert_eq!(words[0], 0x9A910210);
        assert_eq!(words[1], 0x9A911210);
    }

    #[test]
    fn encode_cmp_zero_both_widths() {
        let mut w = WordWriter::default();
        w.put_cmp_zero(5, true); // CMP X5, #0
        w.put_cmp_zero(5, false); // CMP W5, #0
        let words = w.into_words();
        assert_eq!(words[0], 0xF10000BF);
        assert_eq!(words[1], 0x710000BF);
    }

    #[test]
    fn encode_tst_single_bit() {
        let mut w = WordWriter::default();
        w.put_tst_bit(1, 9); // TST W1, #0x200
        w.put_tst_bit(3, 41); // TST X3, #(1<<41)
        w.put_tst_bit(0, 0); // TST W0, #1
        let words = w.into_words();
        assert_eq!(words[0], 0x7217003F); // immr=23
        assert_eq!(words[1], 0xF257007F); // immr=23, 64-bit
        assert_eq!(words[2], 0x7200001F); // immr=0
    }

    #[test]
    fn encode_adrp_add_pair() {
        let mut w = WordWriter::default();
        // From pc 0x2000 to target 0x14E6ABC: page delta 0x14E6000 - 0x2000.
        w.put_adrp(3, 0x2000, 0x14E6ABC);
        w.put_add_imm(3, 3, 0x14E6ABC & 0xFFF);
        let words = w.into_words();
        let page_off = ((0x14E6000u64 - 0x2000) >> 12) as u32;
        let expect = 0x9000_0000 | ((page_off & 3) << 29) | (((page_off >> 2) & 0x7FFFF) << 5) | 3;
        assert_eq!(words[0], expect);
        assert_eq!(words[1], 0x9100_0000 | (0xABC << 10) | (3 << 5) | 3);
    }

    #[test]
    fn encode_adrp_negative_page_delta() {
        let mut w = WordWriter::default();
        w.put_adrp(0, 0x5000, 0x2123);
        let words = w.into_words();
        // page delta = (0x2000 - 0x5000) >> 12 = -3
        let imm = (-3i32) as u32 & 0x1F_FFFF;
        let expect = 0x9000_0000 | ((imm & 3) << 29) | (((imm >> 2) & 0x7FFFF) << 5);
        assert_eq!(words[0], expect);
    }

    #[test]
    #[should_panic(expected = "page delta out of ADRP range")]
    fn adrp_rejects_delta_beyond_imm21() {
        let mut w = WordWriter::default();
        // 8 GiB away, twice the reach of the 21-bit page immediate.
        w.put_adrp(0, 0x1000, 1 << 33);
    }

    #[test]
    fn address_halves_are_low_then_high() {
        let mut w = WordWriter::default();
        w.put_addr(0xFFFF_FFF0_1234_5678);
        let words = w.into_words();
        assert_eq!(words[0], 0x12345678);
        assert_eq!(words[1], 0xFFFFFFF0);
    }

    #[test]
    fn branch_imm_range_checks() {
        assert_eq!(branch_imm(0x1000, 0x1100), Some(0x14000040));
        assert_eq!(branch_imm(0x1000, 0x1000 - 664), Some(0x17FFFF5A));
        assert_eq!(branch_imm(0x1000, 0x1002), None); // unaligned
        assert_eq!(branch_imm(0, 1 << 28), None); // out of range
    }
}
