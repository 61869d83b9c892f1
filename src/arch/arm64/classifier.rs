//! First-instruction classification.
//!
//! Only the instruction classes whose immediates cannot survive relocation
//! get their own category; everything else is `Plain` and is re-emitted
//! verbatim. Decoding is a pure function of fixed bit-fields.

/// An instruction word the classifier refuses to place in any category.
///
/// The only such form today is the unallocated slice of the load-literal
/// class (`opc == 0b11`, `V == 1`). The installer must reject the hook
/// rather than guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedEncoding {
    pub word: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Position-independent; copied verbatim into the trampoline.
    Plain,
    /// B.cond with a 19-bit immediate.
    ConditionalBranch,
    /// CBZ (`branch_if_nonzero == false`) or CBNZ.
    CompareAndBranch { branch_if_nonzero: bool },
    /// TBZ (`branch_if_nonzero == false`) or TBNZ.
    TestBitAndBranch { branch_if_nonzero: bool },
    /// ADR or ADRP.
    AddressRelative,
    /// B with a 26-bit immediate.
    UnconditionalBranch,
    /// BL with a 26-bit immediate.
    UnconditionalBranchWithLink,
    /// Load register (literal), including LDRSW and PRFM, GPR and SIMD/FP.
    LoadRegisterLiteral,
}

impl Category {
    /// Number of words `synthesize` emits for this category, literal
    /// address halves included.
    pub fn trampoline_words(self) -> usize {
        match self {
            Category::Plain => 5,
            Category::ConditionalBranch => 8,
            Category::CompareAndBranch { .. } => 9,
            Category::TestBitAndBranch { .. } => 9,
            Category::AddressRelative => 6,
            Category::UnconditionalBranch => 4,
            Category::UnconditionalBranchWithLink => 10,
            Category::LoadRegisterLiteral => 7,
        }
    }
}

/// Largest trampoline any category synthesizes to.
pub const MAX_TRAMPOLINE_WORDS: usize = 10;

pub fn classify(word: u32) -> Result<Category, UnsupportedEncoding> {
    // B / BL
    match word & 0xFC00_0000 {
        0x1400_0000 => return Ok(Category::UnconditionalBranch),
        0x9400_0000 => return Ok(Category::UnconditionalBranchWithLink),
        _ => {}
    }

    // B.cond: 0b01010100 imm19 0 cond
    if (word & 0xFF00_0010) == 0x5400_0000 {
        return Ok(Category::ConditionalBranch);
    }

    // CBZ/CBNZ and TBZ/TBNZ (sf excluded from the mask)
    match word & 0x7F00_0000 {
        0x3400_0000 => return Ok(Category::CompareAndBranch { branch_if_nonzero: false }),
        0x3500_0000 => return Ok(Category::CompareAndBranch { branch_if_nonzero: true }),
        0x3600_0000 => return Ok(Category::TestBitAndBranch { branch_if_nonzero: false }),
        0x3700_0000 => return Ok(Category::TestBitAndBranch { branch_if_nonzero: true }),
        _ => {}
    }

    // ADR / ADRP
    if (word & 0x1F00_0000) == 0x1000_0000 {
        return Ok(Category::AddressRelative);
    }

    // Load register (literal): opc(2) 011 V 00
    if (word & 0x3B00_0000) == 0x1800_0000 {
        let opc = word >> 30;
        let v = (word >> 26) & 1;
        if opc == 3 && v == 1 {
            // Unallocated form.
            return Err(UnsupportedEncoding { word });
        }
        return Ok(Category::LoadRegisterLiteral);
    }

    Ok(Category::Plain)
}

pub(crate) fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

/// B/BL: imm26, scaled by 4.
pub(crate) fn branch_offset_imm26(word: u32) -> i64 {
    sign_extend((word & 0x03FF_FFFF) as i64, 26) << 2
}

/// B.cond, CBZ/CBNZ, LDR (literal): imm19, scaled by 4.
pub(crate) fn branch_offset_imm19(word: u32) -> i64 {
    sign_extend(((word >> 5) & 0x7FFFF) as i64, 19) << 2
}

/// TBZ/TBNZ: imm14, scaled by 4.
pub(crate) fn branch_offset_imm14(word: u32) -> i64 {
    sign_extend(((word >> 5) & 0x3FFF) as i64, 14) << 2
}

/// ADR/ADRP: immhi:immlo, a 21-bit signed value.
pub(crate) fn adr_offset(word: u32) -> i64 {
    let immlo = ((word >> 29) & 0x3) as i64;
    let immhi = ((word >> 5) & 0x7FFFF) as i64;
    sign_extend((immhi << 2) | immlo, 21)
}

pub(crate) fn rt(word: u32) -> u32 {
    word & 0x1F
}

/// Bit number tested by TBZ/TBNZ: b5:b40.
pub(crate) fn test_bit(word: u32) -> u32 {
    ((word >> 31) << 5) | ((word >> 19) & 0x1F)
}
