//! Z80 register description.
//!
//! Registers are modeled over *register units*, the smallest granules of allocation: one unit
//! per 8-bit register, with the 16-bit pairs covering the two units of their halves. A unit
//! mask (`u16`) describes which units a register occupies, so the allocator can check pair
//! conflicts with plain bit arithmetic. The index registers occupy one unit each; they are
//! never split into halves here.

use crate::mir::ParamLoc;
use crate::mir::{AbiParam, Signature};
use core::fmt;
use core::str::FromStr;

/// Number of register units tracked by the allocator: A, B, C, D, E, H, L, IX, IY.
pub const NUM_UNITS: u16 = 9;

/// An 8-bit register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Reg8 {
    /// The accumulator.
    A,
    /// B; also the DJNZ loop counter.
    B,
    /// C.
    C,
    /// D.
    D,
    /// E.
    E,
    /// H.
    H,
    /// L.
    L,
}

impl Reg8 {
    /// The register unit this register occupies.
    pub fn unit(self) -> u16 {
        match self {
            Reg8::A => 0,
            Reg8::B => 1,
            Reg8::C => 2,
            Reg8::D => 3,
            Reg8::E => 4,
            Reg8::H => 5,
            Reg8::L => 6,
        }
    }

    /// Unit mask for the allocator.
    pub fn mask(self) -> u16 {
        1 << self.unit()
    }
}

impl fmt::Display for Reg8 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Reg8::A => "A",
            Reg8::B => "B",
            Reg8::C => "C",
            Reg8::D => "D",
            Reg8::E => "E",
            Reg8::H => "H",
            Reg8::L => "L",
        })
    }
}

/// A 16-bit register or pair.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Reg16 {
    /// The BC pair.
    BC,
    /// The DE pair.
    DE,
    /// The HL pair; the 16-bit accumulator.
    HL,
    /// Index register IX; reserved for stack frames.
    IX,
    /// Index register IY.
    IY,
}

impl Reg16 {
    /// Unit mask covering both halves (or the single index unit).
    pub fn mask(self) -> u16 {
        match self {
            Reg16::BC => Reg8::B.mask() | Reg8::C.mask(),
            Reg16::DE => Reg8::D.mask() | Reg8::E.mask(),
            Reg16::HL => Reg8::H.mask() | Reg8::L.mask(),
            Reg16::IX => 1 << 7,
            Reg16::IY => 1 << 8,
        }
    }

    /// The high half of a pair.
    pub fn high(self) -> Option<Reg8> {
        match self {
            Reg16::BC => Some(Reg8::B),
            Reg16::DE => Some(Reg8::D),
            Reg16::HL => Some(Reg8::H),
            _ => None,
        }
    }

    /// The low half of a pair.
    pub fn low(self) -> Option<Reg8> {
        match self {
            Reg16::BC => Some(Reg8::C),
            Reg16::DE => Some(Reg8::E),
            Reg16::HL => Some(Reg8::L),
            _ => None,
        }
    }
}

impl fmt::Display for Reg16 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Reg16::BC => "BC",
            Reg16::DE => "DE",
            Reg16::HL => "HL",
            Reg16::IX => "IX",
            Reg16::IY => "IY",
        })
    }
}

/// Any register the allocator can name.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Reg {
    /// An 8-bit register.
    R8(Reg8),
    /// A 16-bit register or pair.
    R16(Reg16),
}

impl Reg {
    /// Unit mask for the allocator.
    pub fn mask(self) -> u16 {
        match self {
            Reg::R8(r) => r.mask(),
            Reg::R16(r) => r.mask(),
        }
    }

    /// Is this a 16-bit register?
    pub fn is_wide(self) -> bool {
        matches!(self, Reg::R16(_))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Reg::R8(r) => r.fmt(f),
            Reg::R16(r) => r.fmt(f),
        }
    }
}

impl FromStr for Reg {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Reg::R8(Reg8::A)),
            "B" => Ok(Reg::R8(Reg8::B)),
            "C" => Ok(Reg::R8(Reg8::C)),
            "D" => Ok(Reg::R8(Reg8::D)),
            "E" => Ok(Reg::R8(Reg8::E)),
            "H" => Ok(Reg::R8(Reg8::H)),
            "L" => Ok(Reg::R8(Reg8::L)),
            "BC" => Ok(Reg::R16(Reg16::BC)),
            "DE" => Ok(Reg::R16(Reg16::DE)),
            "HL" => Ok(Reg::R16(Reg16::HL)),
            "IX" => Ok(Reg::R16(Reg16::IX)),
            "IY" => Ok(Reg::R16(Reg16::IY)),
            _ => Err(()),
        }
    }
}

/// 8-bit parameter registers of the register convention, in assignment order.
pub const PARAM_ORDER_8: [Reg8; 7] = [
    Reg8::A,
    Reg8::E,
    Reg8::D,
    Reg8::C,
    Reg8::B,
    Reg8::L,
    Reg8::H,
];

/// 16-bit parameter pairs of the register convention, in assignment order.
pub const PARAM_ORDER_16: [Reg16; 3] = [Reg16::HL, Reg16::DE, Reg16::BC];

/// Where a register-convention parameter arrives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ParamPlace {
    /// In the named register.
    Reg(Reg),
    /// On the stack (overflow or forced).
    Stack,
}

/// Assign incoming locations for a register-convention signature.
///
/// 8-bit parameters take `A, E, D, C, B, L, H`; 16-bit parameters take `HL, DE, BC`. An
/// `abi_override` placement wins over the default order, and a register claimed by an override
/// is skipped by the automatic assignment.
pub fn param_assignment(sig: &Signature) -> Vec<ParamPlace> {
    let mut taken: u16 = 0;
    let mut places = vec![ParamPlace::Stack; sig.params.len()];

    // Forced placements claim their registers first.
    for (index, param) in sig.params.iter().enumerate() {
        match &param.loc {
            ParamLoc::Reg(name) => {
                if let Ok(reg) = name.parse::<Reg>() {
                    taken |= reg.mask();
                    places[index] = ParamPlace::Reg(reg);
                }
            }
            ParamLoc::Stack => {}
            ParamLoc::Auto => {}
        }
    }

    for (index, param) in sig.params.iter().enumerate() {
        if !matches!(param.loc, ParamLoc::Auto) {
            continue;
        }
        let place = if wide_param(param) {
            PARAM_ORDER_16
                .iter()
                .find(|pair| pair.mask() & taken == 0)
                .map(|&pair| Reg::R16(pair))
        } else {
            PARAM_ORDER_8
                .iter()
                .find(|reg| reg.mask() & taken == 0)
                .map(|&reg| Reg::R8(reg))
        };
        if let Some(reg) = place {
            taken |= reg.mask();
            places[index] = ParamPlace::Reg(reg);
        }
    }
    places
}

fn wide_param(param: &AbiParam) -> bool {
    !param.ty.is_byte()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Type;

    #[test]
    fn pair_masks_cover_their_halves() {
        assert_eq!(Reg16::BC.mask(), Reg8::B.mask() | Reg8::C.mask());
        assert_ne!(Reg16::BC.mask() & Reg16::DE.mask(), Reg16::DE.mask());
        assert_eq!(Reg16::HL.low(), Some(Reg8::L));
        assert_eq!(Reg16::IX.low(), None);
    }

    #[test]
    fn two_byte_params_take_a_then_e() {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U8));
        sig.params.push(AbiParam::new("b", Type::U8));
        let places = param_assignment(&sig);
        assert_eq!(places[0], ParamPlace::Reg(Reg::R8(Reg8::A)));
        assert_eq!(places[1], ParamPlace::Reg(Reg::R8(Reg8::E)));
    }

    #[test]
    fn wide_params_take_pairs_and_skip_claimed_halves() {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("p", Type::U16));
        sig.params.push(AbiParam::new("q", Type::U8));
        let places = param_assignment(&sig);
        assert_eq!(places[0], ParamPlace::Reg(Reg::R16(Reg16::HL)));
        // A is free; HL's halves are not.
        assert_eq!(places[1], ParamPlace::Reg(Reg::R8(Reg8::A)));
    }

    #[test]
    fn override_wins() {
        let mut sig = Signature::new();
        let mut p = AbiParam::new("x", Type::U8);
        p.loc = ParamLoc::Reg("C".to_string());
        sig.params.push(p);
        sig.params.push(AbiParam::new("y", Type::U8));
        let places = param_assignment(&sig);
        assert_eq!(places[0], ParamPlace::Reg(Reg::R8(Reg8::C)));
        assert_eq!(places[1], ParamPlace::Reg(Reg::R8(Reg8::A)));
    }
}
