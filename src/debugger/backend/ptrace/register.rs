use crate::debugger::register::RegisterSet;
use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    FsBase,
    GsBase,
    OrigRax,
}

impl Register {
    /// Map a DWARF register number (x86-64 psABI) to a machine register.
    pub fn from_dwarf(register: gimli::Register) -> Option<Self> {
        Some(match register.0 {
            0 => Register::Rax,
            1 => Register::Rdx,
            2 => Register::Rcx,
            3 => Register::Rbx,
            4 => Register::Rsi,
            5 => Register::Rdi,
            6 => Register::Rbp,
            7 => Register::Rsp,
            8 => Register::R8,
            9 => Register::R9,
            10 => Register::R10,
            11 => Register::R11,
            12 => Register::R12,
            13 => Register::R13,
            14 => Register::R14,
            15 => Register::R15,
            16 => Register::Rip,
            49 => Register::Eflags,
            50 => Register::Es,
            51 => Register::Cs,
            52 => Register::Ss,
            53 => Register::Ds,
            54 => Register::Fs,
            55 => Register::Gs,
            58 => Register::FsBase,
            59 => Register::GsBase,
            _ => return None,
        })
    }
}

/// General purpose registers of a stopped thread.
#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        sys::ptrace::getregs(pid).map(Self)
    }

    pub fn value(&self, register: Register) -> u64 {
        let regs = &self.0;
        match register {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rsi => regs.rsi,
            Register::Rdi => regs.rdi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::OrigRax => regs.orig_rax,
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        let regs = &mut self.0;
        let slot = match register {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rsi => &mut regs.rsi,
            Register::Rdi => &mut regs.rdi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
            Register::Cs => &mut regs.cs,
            Register::Ss => &mut regs.ss,
            Register::Ds => &mut regs.ds,
            Register::Es => &mut regs.es,
            Register::Fs => &mut regs.fs,
            Register::Gs => &mut regs.gs,
            Register::FsBase => &mut regs.fs_base,
            Register::GsBase => &mut regs.gs_base,
            Register::OrigRax => &mut regs.orig_rax,
        };
        *slot = value;
    }

    pub fn pc(&self) -> u64 {
        self.value(Register::Rip)
    }

    pub fn sp(&self) -> u64 {
        self.value(Register::Rsp)
    }

    pub fn fp(&self) -> u64 {
        self.value(Register::Rbp)
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.0)
    }
}

impl From<&RegisterMap> for RegisterSet {
    fn from(map: &RegisterMap) -> Self {
        Register::iter()
            .map(|r| (r.to_string(), map.value(r)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_dwarf_mapping() {
        struct TestCase {
            dwarf: u16,
            expected: Option<Register>,
        }

        let cases = vec![
            TestCase {
                dwarf: 1,
                expected: Some(Register::Rdx),
            },
            TestCase {
                dwarf: 6,
                expected: Some(Register::Rbp),
            },
            TestCase {
                dwarf: 16,
                expected: Some(Register::Rip),
            },
            TestCase {
                dwarf: 17,
                expected: None,
            },
        ];

        for tc in cases {
            assert_eq!(Register::from_dwarf(gimli::Register(tc.dwarf)), tc.expected);
        }
    }

    #[test]
    fn test_register_set_order() {
        // SAFETY: user_regs_struct is plain old data
        let regs: user_regs_struct = unsafe { std::mem::zeroed() };
        let mut map = RegisterMap(regs);
        map.update(Register::Rip, 0x401000);
        map.update(Register::FsBase, 7);

        let set = RegisterSet::from(&map);
        assert_eq!(set.iter().next(), Some(("rax", 0)));
        assert_eq!(set.get("rip"), Some(0x401000));
        assert_eq!(set.get("fs_base"), Some(7));
        assert_eq!(Register::from_str("orig_rax").unwrap(), Register::OrigRax);
    }
}
