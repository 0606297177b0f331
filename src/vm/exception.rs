use std::fmt;

/// Architectural CPU exception, propagated out of fallible operations and
/// delivered through the interrupt protocol by the main loop.
///
/// Selector-error exceptions carry the 16-bit error code that gets pushed;
/// #PF additionally carries the faulting linear address for CR2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// #DE
    DivideError,
    /// #DB
    Debug,
    /// #BP
    Breakpoint,
    /// #OF
    Overflow,
    /// #BR
    BoundRange,
    /// #UD
    InvalidOpcode,
    /// #NM
    NoMathUnit,
    /// #DF
    DoubleFault,
    /// #TS(selector error code)
    InvalidTss(u16),
    /// #NP(selector error code)
    NotPresent(u16),
    /// #SS(selector error code)
    StackFault(u16),
    /// #GP(selector error code)
    GeneralProtection(u16),
    /// #PF(page fault error code), CR2 = address
    PageFault { code: u16, address: u32 },
    /// #MF
    MathFault,
    /// #AC
    AlignmentCheck,
}

/// #PF error code bits.
pub const PF_PROTECTION: u16 = 1 << 0;
pub const PF_WRITE: u16 = 1 << 1;
pub const PF_USER: u16 = 1 << 2;
pub const PF_FETCH: u16 = 1 << 4;

impl Exception {
    #[inline]
    pub fn gp0() -> Self {
        Self::GeneralProtection(0)
    }

    #[inline]
    pub fn ss0() -> Self {
        Self::StackFault(0)
    }

    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::NoMathUnit => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::NotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::MathFault => 16,
            Exception::AlignmentCheck => 17,
        }
    }

    /// The error code pushed on delivery, when the vector carries one.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(code)
            | Exception::NotPresent(code)
            | Exception::StackFault(code)
            | Exception::GeneralProtection(code) => Some(*code),
            Exception::PageFault { code, .. } => Some(*code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Exception::DivideError => "#DE",
            Exception::Debug => "#DB",
            Exception::Breakpoint => "#BP",
            Exception::Overflow => "#OF",
            Exception::BoundRange => "#BR",
            Exception::InvalidOpcode => "#UD",
            Exception::NoMathUnit => "#NM",
            Exception::DoubleFault => "#DF",
            Exception::InvalidTss(_) => "#TS",
            Exception::NotPresent(_) => "#NP",
            Exception::StackFault(_) => "#SS",
            Exception::GeneralProtection(_) => "#GP",
            Exception::PageFault { .. } => "#PF",
            Exception::MathFault => "#MF",
            Exception::AlignmentCheck => "#AC",
        }
    }

    /// Contributing faults escalate to #DF when they hit during the delivery
    /// of another contributing fault (Intel SDM interrupt 8 rules).
    pub fn is_contributory(&self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::InvalidTss(_)
                | Exception::NotPresent(_)
                | Exception::StackFault(_)
                | Exception::GeneralProtection(_)
        )
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::PageFault { code, address } => {
                write!(f, "#PF(code={code:#06x}, addr={address:#010x})")
            }
            other => match other.error_code() {
                Some(code) => write!(f, "{}({:#06x})", other.mnemonic(), code),
                None => f.write_str(other.mnemonic()),
            },
        }
    }
}

impl std::error::Error for Exception {}
