//! Type 2 charstring tokens and the integer alphabet the subroutinizer
//! works over.

use fnv::FnvHashMap;
use font_types::Fixed;

use crate::SubrError;

/// Type 2 charstring operators.
///
/// See "Appendix A Type 2 Charstring Command Codes" in
/// <https://adobe-type-tools.github.io/font-tech-notes/pdfs/5177.Type2.pdf>
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    HStem,
    VStem,
    VMoveTo,
    RLineTo,
    HLineTo,
    VLineTo,
    RRCurveTo,
    CallSubr,
    Return,
    EndChar,
    VsIndex,
    Blend,
    HStemHm,
    HintMask,
    CntrMask,
    RMoveTo,
    HMoveTo,
    VStemHm,
    RCurveLine,
    RLineCurve,
    VVCurveTo,
    HHCurveTo,
    CallGsubr,
    VHCurveTo,
    HVCurveTo,
    // Escape-prefixed (two byte) operators.
    And,
    Or,
    Not,
    Abs,
    Add,
    Sub,
    Div,
    Neg,
    Eq,
    Drop,
    Put,
    Get,
    IfElse,
    Random,
    Mul,
    Sqrt,
    Dup,
    Exch,
    Index,
    Roll,
    HFlex,
    Flex,
    HFlex1,
    Flex1,
}

/// Escape byte that introduces a two byte operator.
const ESCAPE: u8 = 12;

impl Op {
    /// The encoded operator bytes: a single opcode, or the escape byte
    /// followed by a second opcode byte.
    pub fn opcode(self) -> (u8, Option<u8>) {
        use Op::*;
        match self {
            HStem => (1, None),
            VStem => (3, None),
            VMoveTo => (4, None),
            RLineTo => (5, None),
            HLineTo => (6, None),
            VLineTo => (7, None),
            RRCurveTo => (8, None),
            CallSubr => (10, None),
            Return => (11, None),
            EndChar => (14, None),
            VsIndex => (15, None),
            Blend => (16, None),
            HStemHm => (18, None),
            HintMask => (19, None),
            CntrMask => (20, None),
            RMoveTo => (21, None),
            HMoveTo => (22, None),
            VStemHm => (23, None),
            RCurveLine => (24, None),
            RLineCurve => (25, None),
            VVCurveTo => (26, None),
            HHCurveTo => (27, None),
            CallGsubr => (29, None),
            VHCurveTo => (30, None),
            HVCurveTo => (31, None),
            And => (ESCAPE, Some(3)),
            Or => (ESCAPE, Some(4)),
            Not => (ESCAPE, Some(5)),
            Abs => (ESCAPE, Some(9)),
            Add => (ESCAPE, Some(10)),
            Sub => (ESCAPE, Some(11)),
            Div => (ESCAPE, Some(12)),
            Neg => (ESCAPE, Some(14)),
            Eq => (ESCAPE, Some(15)),
            Drop => (ESCAPE, Some(18)),
            Put => (ESCAPE, Some(20)),
            Get => (ESCAPE, Some(21)),
            IfElse => (ESCAPE, Some(22)),
            Random => (ESCAPE, Some(23)),
            Mul => (ESCAPE, Some(24)),
            Sqrt => (ESCAPE, Some(26)),
            Dup => (ESCAPE, Some(27)),
            Exch => (ESCAPE, Some(28)),
            Index => (ESCAPE, Some(29)),
            Roll => (ESCAPE, Some(30)),
            HFlex => (ESCAPE, Some(34)),
            Flex => (ESCAPE, Some(35)),
            HFlex1 => (ESCAPE, Some(36)),
            Flex1 => (ESCAPE, Some(37)),
        }
    }

    /// Number of bytes the operator occupies in a charstring.
    pub fn byte_len(self) -> u32 {
        match self.opcode() {
            (_, None) => 1,
            _ => 2,
        }
    }

    /// True for `hintmask` and `cntrmask`.
    pub fn is_mask(self) -> bool {
        matches!(self, Op::HintMask | Op::CntrMask)
    }
}

/// A single unit of a charstring program.
///
/// Programs passed to and returned from the subroutinizer are in
/// *expanded* form: a [`Op::HintMask`] or [`Op::CntrMask`] operator is
/// immediately followed by a [`Token::MaskBytes`] token carrying its
/// mask bits. The fused [`Token::Mask`] form only exists between
/// [`collapse_hintmasks`] and [`expand_hintmasks`]; a subroutine call
/// can never be inserted between the operator and its mask bytes, so
/// the pair moves through the subroutinizer as one token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// An integer operand.
    Int(i32),
    /// A real operand, emitted as a 255-prefixed 16.16 fixed value.
    Real(Fixed),
    /// An operator.
    Op(Op),
    /// The mask bits following a hintmask or cntrmask operator.
    MaskBytes(Vec<u8>),
    /// A mask operator fused with its mask bits.
    Mask(Op, Vec<u8>),
}

impl Token {
    /// Bytes this token occupies when emitted into a charstring.
    pub fn byte_cost(&self) -> u32 {
        match self {
            Token::Int(value) => int_operand_len(*value),
            Token::Real(_) => 5,
            Token::Op(op) => op.byte_len(),
            Token::MaskBytes(bytes) => bytes.len() as u32,
            Token::Mask(op, bytes) => op.byte_len() + bytes.len() as u32,
        }
    }
}

/// Encoded length of an integer operand.
pub(crate) fn int_operand_len(value: i32) -> u32 {
    if (-107..=107).contains(&value) {
        1
    } else if (108..=1131).contains(&value) || (-1131..=-108).contains(&value) {
        2
    } else {
        3
    }
}

/// Fuses each hintmask/cntrmask operator with its trailing mask bytes
/// into a single [`Token::Mask`].
pub fn collapse_hintmasks(glyph: &str, program: &[Token]) -> Result<Vec<Token>, SubrError> {
    let mut collapsed = Vec::with_capacity(program.len());
    let mut tokens = program.iter();
    while let Some(token) = tokens.next() {
        match token {
            Token::Op(op) if op.is_mask() => match tokens.next() {
                Some(Token::MaskBytes(bytes)) => collapsed.push(Token::Mask(*op, bytes.clone())),
                _ => {
                    return Err(SubrError::MissingMaskBytes {
                        glyph: glyph.into(),
                    })
                }
            },
            Token::MaskBytes(_) => {
                return Err(SubrError::StrayMaskBytes {
                    glyph: glyph.into(),
                })
            }
            other => collapsed.push(other.clone()),
        }
    }
    Ok(collapsed)
}

/// Expands fused [`Token::Mask`] pairs back into operator plus mask
/// bytes, in place.
pub fn expand_hintmasks(program: &mut Vec<Token>) {
    let mut i = 0;
    while i < program.len() {
        if let Token::Mask(op, bytes) = &program[i] {
            let (op, bytes) = (*op, bytes.clone());
            program.splice(i..=i, [Token::Op(op), Token::MaskBytes(bytes)]);
            i += 2;
        } else {
            i += 1;
        }
    }
}

/// Bijective mapping from distinct tokens to a dense integer alphabet.
///
/// Suffix sorting and the dynamic program operate on small integer
/// codes rather than tokens; the reverse table recovers the token when
/// final programs are emitted, and the cost table gives each code's
/// emitted byte size in constant time.
#[derive(Clone, Debug, Default)]
pub(crate) struct Alphabet {
    keymap: FnvHashMap<Token, u32>,
    rev_keymap: Vec<Token>,
    cost_map: Vec<u32>,
}

impl Alphabet {
    /// Validates `program`, fuses hintmask pairs, and remaps each token
    /// to its alphabet code, appending new tokens on first sight.
    ///
    /// Source programs must be de-subroutinized: `callsubr`,
    /// `callgsubr` and `return` are rejected, as is an `endchar`
    /// anywhere but the final position.
    pub fn ingest(&mut self, glyph: &str, program: &[Token]) -> Result<Vec<u32>, SubrError> {
        let collapsed = collapse_hintmasks(glyph, program)?;
        let last = collapsed.len().saturating_sub(1);
        let mut codes = Vec::with_capacity(collapsed.len());
        for (i, token) in collapsed.into_iter().enumerate() {
            match token {
                Token::Op(op @ (Op::CallSubr | Op::CallGsubr | Op::Return)) => {
                    return Err(SubrError::ForbiddenOperator {
                        glyph: glyph.into(),
                        op,
                    });
                }
                Token::Op(Op::EndChar) if i != last => {
                    return Err(SubrError::MisplacedEndChar {
                        glyph: glyph.into(),
                    });
                }
                _ => {}
            }
            codes.push(self.code_for(token));
        }
        Ok(codes)
    }

    fn code_for(&mut self, token: Token) -> u32 {
        if let Some(&code) = self.keymap.get(&token) {
            return code;
        }
        let code = self.rev_keymap.len() as u32;
        self.cost_map.push(token.byte_cost());
        self.keymap.insert(token.clone(), code);
        self.rev_keymap.push(token);
        code
    }

    /// Emitted byte size of the token behind `code`.
    pub fn cost(&self, code: u32) -> u32 {
        self.cost_map[code as usize]
    }

    /// The token behind `code`.
    pub fn token(&self, code: u32) -> &Token {
        &self.rev_keymap[code as usize]
    }

    /// Number of distinct tokens seen so far.
    pub fn len(&self) -> usize {
        self.rev_keymap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rev_keymap.is_empty()
    }

    pub(crate) fn cost_map(&self) -> &[u32] {
        &self.cost_map
    }

    /// Maps a code sequence back into tokens.
    pub(crate) fn tokens(&self, codes: &[u32]) -> Vec<Token> {
        codes
            .iter()
            .map(|&code| self.rev_keymap[code as usize].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_costs() {
        assert_eq!(Token::Int(0).byte_cost(), 1);
        assert_eq!(Token::Int(107).byte_cost(), 1);
        assert_eq!(Token::Int(-107).byte_cost(), 1);
        assert_eq!(Token::Int(108).byte_cost(), 2);
        assert_eq!(Token::Int(-1131).byte_cost(), 2);
        assert_eq!(Token::Int(1132).byte_cost(), 3);
        assert_eq!(Token::Int(-32768).byte_cost(), 3);
        assert_eq!(Token::Real(Fixed::from_f64(0.125)).byte_cost(), 5);
    }

    #[test]
    fn operator_costs() {
        assert_eq!(Token::Op(Op::RRCurveTo).byte_cost(), 1);
        assert_eq!(Token::Op(Op::EndChar).byte_cost(), 1);
        assert_eq!(Token::Op(Op::Flex1).byte_cost(), 2);
        assert_eq!(Token::Op(Op::Abs).byte_cost(), 2);
        assert_eq!(Token::Mask(Op::HintMask, vec![0xf0, 0x01]).byte_cost(), 3);
    }

    #[test]
    fn collapse_expand_round_trip() {
        let program = vec![
            Token::Int(3),
            Token::Op(Op::HStem),
            Token::Op(Op::HintMask),
            Token::MaskBytes(vec![0xa0]),
            Token::Int(20),
            Token::Op(Op::RMoveTo),
            Token::Op(Op::CntrMask),
            Token::MaskBytes(vec![0x0f, 0x80]),
        ];
        let collapsed = collapse_hintmasks("g", &program).unwrap();
        assert_eq!(collapsed.len(), program.len() - 2);
        assert_eq!(collapsed[2], Token::Mask(Op::HintMask, vec![0xa0]));
        let mut expanded = collapsed;
        expand_hintmasks(&mut expanded);
        assert_eq!(expanded, program);
    }

    #[test]
    fn collapse_rejects_broken_masks() {
        let missing = vec![Token::Op(Op::HintMask)];
        assert!(matches!(
            collapse_hintmasks("g", &missing),
            Err(SubrError::MissingMaskBytes { .. })
        ));
        let stray = vec![Token::Int(1), Token::MaskBytes(vec![0x80])];
        assert!(matches!(
            collapse_hintmasks("g", &stray),
            Err(SubrError::StrayMaskBytes { .. })
        ));
    }

    #[test]
    fn alphabet_is_injective() {
        let program = vec![
            Token::Int(-3),
            Token::Int(250),
            Token::Op(Op::RLineTo),
            Token::Int(-3),
            Token::Op(Op::RLineTo),
            Token::Op(Op::EndChar),
        ];
        let mut alphabet = Alphabet::default();
        let codes = alphabet.ingest("g", &program).unwrap();
        // repeated tokens share a code
        assert_eq!(codes[0], codes[3]);
        assert_eq!(codes[2], codes[4]);
        assert_eq!(alphabet.len(), 4);
        // the reverse table composed with the forward map is the identity
        assert_eq!(alphabet.tokens(&codes), program);
        for &code in &codes {
            assert_eq!(alphabet.cost(code), alphabet.token(code).byte_cost());
        }
    }

    #[test]
    fn ingest_rejects_malformed_input() {
        let mut alphabet = Alphabet::default();
        assert!(matches!(
            alphabet.ingest("g", &[Token::Op(Op::CallSubr)]),
            Err(SubrError::ForbiddenOperator { op: Op::CallSubr, .. })
        ));
        assert!(matches!(
            alphabet.ingest("g", &[Token::Op(Op::Return)]),
            Err(SubrError::ForbiddenOperator { op: Op::Return, .. })
        ));
        assert!(matches!(
            alphabet.ingest(
                "g",
                &[Token::Op(Op::EndChar), Token::Int(1), Token::Op(Op::RLineTo)]
            ),
            Err(SubrError::MisplacedEndChar { .. })
        ));
        // endchar in final position is fine
        assert!(alphabet
            .ingest("g", &[Token::Int(1), Token::Op(Op::EndChar)])
            .is_ok());
    }
}
