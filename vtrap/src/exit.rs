//! SVM exit reasons and exit information.
use crate::VmError;
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

/// Exit codes outside the CR/DR/exception ranges.
///
/// ## Details
/// See AMD64 Architecture Programmer's Manual Volume 2, Appendix C. SVM Intercept Exit Codes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum ExitCode {
    Intr = 0x60,
    Nmi = 0x61,
    Smi = 0x62,
    Init = 0x63,
    Vintr = 0x64,
    Cr0SelWrite = 0x65,
    IdtrRead = 0x66,
    GdtrRead = 0x67,
    LdtrRead = 0x68,
    TrRead = 0x69,
    IdtrWrite = 0x6a,
    GdtrWrite = 0x6b,
    LdtrWrite = 0x6c,
    TrWrite = 0x6d,
    Rdtsc = 0x6e,
    Rdpmc = 0x6f,
    Pushf = 0x70,
    Popf = 0x71,
    Cpuid = 0x72,
    Rsm = 0x73,
    Iret = 0x74,
    Swint = 0x75,
    Invd = 0x76,
    Pause = 0x77,
    Hlt = 0x78,
    Invlpg = 0x79,
    Invlpga = 0x7a,
    Ioio = 0x7b,
    Msr = 0x7c,
    TaskSwitch = 0x7d,
    FerrFreeze = 0x7e,
    Shutdown = 0x7f,
    Vmrun = 0x80,
    Vmmcall = 0x81,
    Vmload = 0x82,
    Vmsave = 0x83,
    Stgi = 0x84,
    Clgi = 0x85,
    Skinit = 0x86,
    Rdtscp = 0x87,
    Icebp = 0x88,
    Wbinvd = 0x89,
    Monitor = 0x8a,
    Mwait = 0x8b,
    MwaitConditional = 0x8c,
    Xsetbv = 0x8d,
    Npf = 0x400,
    Invalid = 0xffff_ffff_ffff_ffff,
}

impl ExitCode {
    fn name(self) -> &'static str {
        match self {
            ExitCode::Intr => "VMEXIT_INTR",
            ExitCode::Nmi => "VMEXIT_NMI",
            ExitCode::Smi => "VMEXIT_SMI",
            ExitCode::Init => "VMEXIT_INIT",
            ExitCode::Vintr => "VMEXIT_VINTR",
            ExitCode::Cr0SelWrite => "VMEXIT_CR0_SEL_WRITE",
            ExitCode::IdtrRead => "VMEXIT_IDTR_READ",
            ExitCode::GdtrRead => "VMEXIT_GDTR_READ",
            ExitCode::LdtrRead => "VMEXIT_LDTR_READ",
            ExitCode::TrRead => "VMEXIT_TR_READ",
            ExitCode::IdtrWrite => "VMEXIT_IDTR_WRITE",
            ExitCode::GdtrWrite => "VMEXIT_GDTR_WRITE",
            ExitCode::LdtrWrite => "VMEXIT_LDTR_WRITE",
            ExitCode::TrWrite => "VMEXIT_TR_WRITE",
            ExitCode::Rdtsc => "VMEXIT_RDTSC",
            ExitCode::Rdpmc => "VMEXIT_RDPMC",
            ExitCode::Pushf => "VMEXIT_PUSHF",
            ExitCode::Popf => "VMEXIT_POPF",
            ExitCode::Cpuid => "VMEXIT_CPUID",
            ExitCode::Rsm => "VMEXIT_RSM",
            ExitCode::Iret => "VMEXIT_IRET",
            ExitCode::Swint => "VMEXIT_SWINT",
            ExitCode::Invd => "VMEXIT_INVD",
            ExitCode::Pause => "VMEXIT_PAUSE",
            ExitCode::Hlt => "VMEXIT_HLT",
            ExitCode::Invlpg => "VMEXIT_INVLPG",
            ExitCode::Invlpga => "VMEXIT_INVLPGA",
            ExitCode::Ioio => "VMEXIT_IOIO",
            ExitCode::Msr => "VMEXIT_MSR",
            ExitCode::TaskSwitch => "VMEXIT_TASK_SWITCH",
            ExitCode::FerrFreeze => "VMEXIT_FERR_FREEZE",
            ExitCode::Shutdown => "VMEXIT_SHUTDOWN",
            ExitCode::Vmrun => "VMEXIT_VMRUN",
            ExitCode::Vmmcall => "VMEXIT_VMMCALL",
            ExitCode::Vmload => "VMEXIT_VMLOAD",
            ExitCode::Vmsave => "VMEXIT_VMSAVE",
            ExitCode::Stgi => "VMEXIT_STGI",
            ExitCode::Clgi => "VMEXIT_CLGI",
            ExitCode::Skinit => "VMEXIT_SKINIT",
            ExitCode::Rdtscp => "VMEXIT_RDTSCP",
            ExitCode::Icebp => "VMEXIT_ICEBP",
            ExitCode::Wbinvd => "VMEXIT_WBINVD",
            ExitCode::Monitor => "VMEXIT_MONITOR",
            ExitCode::Mwait => "VMEXIT_MWAIT",
            ExitCode::MwaitConditional => "VMEXIT_MWAIT_CONDITIONAL",
            ExitCode::Xsetbv => "VMEXIT_XSETBV",
            ExitCode::Npf => "VMEXIT_NPF",
            ExitCode::Invalid => "VMEXIT_INVALID_VMCB",
        }
    }
}

/// Page fault vector.
pub const PF_VECTOR: u8 = 14;

/// Reason of a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Read of CRn.
    CrRead(u8),
    /// Write of CRn.
    CrWrite(u8),
    /// Read of DRn.
    DrRead(u8),
    /// Write of DRn.
    DrWrite(u8),
    /// Exception with the vector.
    Exception(u8),
    /// Any other known exit.
    Code(ExitCode),
    /// An exit code this core does not know.
    Unknown(u64),
}

impl ExitReason {
    /// Classify a raw exit code.
    pub fn from_code(code: u64) -> Self {
        match code {
            0x00..=0x0f => ExitReason::CrRead(code as u8),
            0x10..=0x1f => ExitReason::CrWrite((code - 0x10) as u8),
            0x20..=0x2f => ExitReason::DrRead((code - 0x20) as u8),
            0x30..=0x3f => ExitReason::DrWrite((code - 0x30) as u8),
            0x40..=0x5f => ExitReason::Exception((code - 0x40) as u8),
            code => ExitCode::try_from(code)
                .map(ExitReason::Code)
                .unwrap_or(ExitReason::Unknown(code)),
        }
    }

    /// The raw exit code.
    pub fn code(&self) -> u64 {
        match *self {
            ExitReason::CrRead(n) => n as u64,
            ExitReason::CrWrite(n) => 0x10 + n as u64,
            ExitReason::DrRead(n) => 0x20 + n as u64,
            ExitReason::DrWrite(n) => 0x30 + n as u64,
            ExitReason::Exception(n) => 0x40 + n as u64,
            ExitReason::Code(c) => c as u64,
            ExitReason::Unknown(c) => c,
        }
    }
}

impl core::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExitReason::CrRead(n) => write!(f, "VMEXIT_CR{n}_READ"),
            ExitReason::CrWrite(n) => write!(f, "VMEXIT_CR{n}_WRITE"),
            ExitReason::DrRead(n) => write!(f, "VMEXIT_DR{n}_READ"),
            ExitReason::DrWrite(n) => write!(f, "VMEXIT_DR{n}_WRITE"),
            ExitReason::Exception(n) => write!(f, "VMEXIT_EXCP{n}"),
            ExitReason::Code(c) => f.write_str(c.name()),
            ExitReason::Unknown(c) => write!(f, "VMEXIT_UNKNOWN(0x{c:x})"),
        }
    }
}

/// Decoded EXITINFO1 of an IOIO exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoInfo {
    /// Port.
    pub port: u16,
    /// IN or INS.
    pub is_in: bool,
    /// INS or OUTS.
    pub string: bool,
    /// REP prefixed.
    pub rep: bool,
    /// Operand size in bytes.
    pub size: usize,
    /// Address size in bytes, if the processor reported it.
    pub addr_size: Option<usize>,
}

impl IoInfo {
    /// Decode EXITINFO1.
    pub fn decode(info: u64) -> Result<Self, VmError> {
        let bit = |n: u32| info & (1 << n) != 0;
        let size = if bit(4) {
            1
        } else if bit(5) {
            2
        } else if bit(6) {
            4
        } else {
            return Err(VmError::InvalidExitInfo(info));
        };
        let addr_size = if bit(7) {
            Some(2)
        } else if bit(8) {
            Some(4)
        } else if bit(9) {
            Some(8)
        } else {
            None
        };
        Ok(Self {
            port: (info >> 16) as u16,
            is_in: bit(0),
            string: bit(2),
            rep: bit(3),
            size,
            addr_size,
        })
    }

    /// Mask of the address registers, if the address size is known.
    pub fn addr_mask(&self) -> Option<u64> {
        self.addr_size.map(|s| match s {
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => u64::MAX,
        })
    }
}

bitflags! {
    /// Page fault error code (EXITINFO1 of #PF and NPF exits).
    pub struct PageFaultErrorCode: u64 {
        /// The page was present.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access was from user mode.
        const USER = 1 << 2;
        /// Reserved bit set in a paging entry.
        const RSVD = 1 << 3;
        /// The access was an instruction fetch.
        const FETCH = 1 << 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        assert_eq!(ExitReason::from_code(0x0), ExitReason::CrRead(0));
        assert_eq!(ExitReason::from_code(0x13), ExitReason::CrWrite(3));
        assert_eq!(ExitReason::from_code(0x4e), ExitReason::Exception(PF_VECTOR));
        assert_eq!(ExitReason::from_code(0x7b), ExitReason::Code(ExitCode::Ioio));
        assert_eq!(ExitReason::from_code(0x400), ExitReason::Code(ExitCode::Npf));
        assert_eq!(ExitReason::from_code(u64::MAX), ExitReason::Code(ExitCode::Invalid));
        assert_eq!(ExitReason::from_code(0x90), ExitReason::Unknown(0x90));
        for code in [0x0, 0x1f, 0x2a, 0x3f, 0x5f, 0x60, 0x8d, 0x400, 0x401] {
            assert_eq!(ExitReason::from_code(code).code(), code);
        }
        assert_eq!(format!("{}", ExitReason::from_code(0x78)), "VMEXIT_HLT");
        assert_eq!(format!("{}", ExitReason::from_code(0x10)), "VMEXIT_CR0_WRITE");
        assert_eq!(format!("{}", ExitReason::from_code(0x4e)), "VMEXIT_EXCP14");
    }

    #[test]
    fn io_info() {
        // rep outsb on port 0x3f8, 32-bit addressing.
        let info = IoInfo::decode((0x3f8 << 16) | (1 << 8) | (1 << 4) | (1 << 3) | (1 << 2)).unwrap();
        assert_eq!(
            info,
            IoInfo {
                port: 0x3f8,
                is_in: false,
                string: true,
                rep: true,
                size: 1,
                addr_size: Some(4),
            }
        );
        assert_eq!(info.addr_mask(), Some(0xffff_ffff));
        let info = IoInfo::decode((0x60 << 16) | (1 << 6) | 1).unwrap();
        assert!(info.is_in && !info.string);
        assert_eq!((info.size, info.addr_mask()), (4, None));
        assert!(IoInfo::decode(0x60 << 16).is_err());
    }
}
