//! Shared settings for the compilation pipeline.
//!
//! A `Flags` value is built once per compilation and passed explicitly through the `Context`;
//! there is no global state. The builder rejects nothing at this level; per-target validation
//! happens when a backend is looked up.

use core::fmt;
use core::str::FromStr;

/// How hard the optimizer tries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// Straight lowering, no rewrites.
    None,
    /// Cheap rewrites only: folding, dead code removal.
    Basic,
    /// The whole pipeline, including SMC conventions and tail-call rewriting.
    Full,
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            OptLevel::None => "none",
            OptLevel::Basic => "basic",
            OptLevel::Full => "full",
        })
    }
}

impl FromStr for OptLevel {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "0" => Ok(OptLevel::None),
            "basic" | "1" => Ok(OptLevel::Basic),
            "full" | "2" => Ok(OptLevel::Full),
            _ => Err(()),
        }
    }
}

/// Flags carried through the whole pipeline.
#[derive(Clone, Debug)]
pub struct Flags {
    /// Optimization level.
    pub opt_level: OptLevel,
    /// Allow self-modifying conventions at all.
    pub enable_smc: bool,
    /// Base address for the fixed low-memory register tier. `None` takes the backend default.
    pub lowmem_base: Option<u16>,
    /// Allow shadow-register allocation outside interrupt handlers.
    pub enable_shadow: bool,
    /// Inliner budget: callee body cost above this is never inlined.
    pub inline_budget: u32,
    /// TSMC for reference parameters. Experimental; see the design notes.
    pub experimental_ref_tsmc: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Full,
            enable_smc: true,
            lowmem_base: None,
            enable_shadow: true,
            inline_budget: 12,
            experimental_ref_tsmc: false,
        }
    }
}

impl Flags {
    /// Start building a flags value.
    pub fn builder() -> FlagsBuilder {
        FlagsBuilder {
            flags: Flags::default(),
        }
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "opt_level = {}", self.opt_level)?;
        writeln!(f, "enable_smc = {}", self.enable_smc)?;
        match self.lowmem_base {
            Some(base) => writeln!(f, "lowmem_base = ${:04X}", base)?,
            None => writeln!(f, "lowmem_base = default")?,
        }
        writeln!(f, "enable_shadow = {}", self.enable_shadow)?;
        writeln!(f, "inline_budget = {}", self.inline_budget)?;
        writeln!(f, "experimental_ref_tsmc = {}", self.experimental_ref_tsmc)
    }
}

/// Builder for `Flags`.
pub struct FlagsBuilder {
    flags: Flags,
}

impl FlagsBuilder {
    /// Set the optimization level.
    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.flags.opt_level = level;
        self
    }

    /// Enable or disable SMC conventions.
    pub fn enable_smc(mut self, enable: bool) -> Self {
        self.flags.enable_smc = enable;
        self
    }

    /// Override the low-memory tier base address.
    pub fn lowmem_base(mut self, base: u16) -> Self {
        self.flags.lowmem_base = Some(base);
        self
    }

    /// Enable or disable shadow-register allocation outside interrupt handlers.
    pub fn enable_shadow(mut self, enable: bool) -> Self {
        self.flags.enable_shadow = enable;
        self
    }

    /// Set the inliner budget.
    pub fn inline_budget(mut self, budget: u32) -> Self {
        self.flags.inline_budget = budget;
        self
    }

    /// Gate TSMC for reference parameters.
    pub fn experimental_ref_tsmc(mut self, enable: bool) -> Self {
        self.flags.experimental_ref_tsmc = enable;
        self
    }

    /// Finish building.
    pub fn build(self) -> Flags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_level_ordering() {
        assert!(OptLevel::None < OptLevel::Basic);
        assert!(OptLevel::Basic < OptLevel::Full);
        assert_eq!("2".parse::<OptLevel>(), Ok(OptLevel::Full));
        assert_eq!("basic".parse::<OptLevel>(), Ok(OptLevel::Basic));
    }

    #[test]
    fn builder_overrides() {
        let flags = Flags::builder()
            .opt_level(OptLevel::Basic)
            .enable_smc(false)
            .lowmem_base(0xC000)
            .build();
        assert_eq!(flags.opt_level, OptLevel::Basic);
        assert!(!flags.enable_smc);
        assert_eq!(flags.lowmem_base, Some(0xC000));
        let display = flags.to_string();
        assert!(display.contains("lowmem_base = $C000"));
    }
}
