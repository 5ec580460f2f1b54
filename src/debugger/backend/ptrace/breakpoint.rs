use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::error::Error;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

const INT3: u64 = 0xCC;

/// Breakpoint owner of an address.
#[derive(Clone, Debug, PartialEq)]
pub struct UserBreakpoint {
    pub id: BreakpointId,
    /// Hits left to skip before the breakpoint stops the debuggee.
    pub ignore: u32,
}

/// Temporary breakpoint set by run-to and step-out commands.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Temporary {
    /// Frame the stop is expected in. `None` means any frame.
    pub cfa: Option<u64>,
}

/// Patched instruction with its owners.
#[derive(Debug)]
pub struct Site {
    pub addr: u64,
    saved_data: u8,
    pub users: Vec<UserBreakpoint>,
    pub temporary: Option<Temporary>,
}

impl Site {
    fn enable(pid: Pid, addr: u64) -> nix::Result<u8> {
        let data = sys::ptrace::read(pid, addr as *mut c_void)? as u64;
        let with_int3 = (data & !0xff) | INT3;
        unsafe {
            sys::ptrace::write(pid, addr as *mut c_void, with_int3 as *mut c_void)?;
        }
        Ok((data & 0xff) as u8)
    }

    fn disable(&self, pid: Pid) -> nix::Result<()> {
        let data = sys::ptrace::read(pid, self.addr as *mut c_void)? as u64;
        let restored = (data & !0xff) | self.saved_data as u64;
        unsafe { sys::ptrace::write(pid, self.addr as *mut c_void, restored as *mut c_void) }
    }

    fn is_unused(&self) -> bool {
        self.users.is_empty() && self.temporary.is_none()
    }
}

/// All patched addresses of a debuggee.
#[derive(Default)]
pub struct Sites {
    sites: HashMap<u64, Site>,
    by_id: HashMap<BreakpointId, u64>,
}

impl Sites {
    pub fn get(&self, addr: u64) -> Option<&Site> {
        self.sites.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut Site> {
        self.sites.get_mut(&addr)
    }

    pub fn address_of(&self, id: BreakpointId) -> Option<u64> {
        self.by_id.get(&id).copied()
    }

    fn site(&mut self, pid: Pid, addr: u64) -> nix::Result<&mut Site> {
        match self.sites.entry(addr) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let saved_data = Site::enable(pid, addr)?;
                Ok(e.insert(Site {
                    addr,
                    saved_data,
                    users: vec![],
                    temporary: None,
                }))
            }
        }
    }

    pub fn add_user(&mut self, pid: Pid, addr: u64, user: UserBreakpoint) -> nix::Result<()> {
        let id = user.id;
        let site = self.site(pid, addr)?;
        site.users.retain(|u| u.id != id);
        site.users.push(user);
        self.by_id.insert(id, addr);
        Ok(())
    }

    pub fn remove_user(&mut self, pid: Pid, id: BreakpointId) -> nix::Result<()> {
        let Some(addr) = self.by_id.remove(&id) else {
            return Ok(());
        };
        if let Some(site) = self.sites.get_mut(&addr) {
            site.users.retain(|u| u.id != id);
        }
        self.release(pid, addr)
    }

    pub fn set_temporary(&mut self, pid: Pid, addr: u64, temporary: Temporary) -> nix::Result<()> {
        self.clear_temporary(pid)?;
        self.site(pid, addr)?.temporary = Some(temporary);
        Ok(())
    }

    pub fn clear_temporary(&mut self, pid: Pid) -> nix::Result<()> {
        let addrs: Vec<u64> = self
            .sites
            .values()
            .filter(|s| s.temporary.is_some())
            .map(|s| s.addr)
            .collect();
        for addr in addrs {
            if let Some(site) = self.sites.get_mut(&addr) {
                site.temporary = None;
            }
            self.release(pid, addr)?;
        }
        Ok(())
    }

    fn release(&mut self, pid: Pid, addr: u64) -> nix::Result<()> {
        if self.sites.get(&addr).is_some_and(Site::is_unused) {
            if let Some(site) = self.sites.remove(&addr) {
                site.disable(pid)?;
            }
        }
        Ok(())
    }

    /// Restore the original instruction at `addr` for the duration of `f`.
    pub fn lifted<T>(
        &self,
        pid: Pid,
        addr: u64,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let Some(site) = self.sites.get(&addr) else {
            return f();
        };
        site.disable(pid).map_err(Error::Ptrace)?;
        let result = f();
        Site::enable(pid, addr).map_err(Error::Ptrace)?;
        result
    }

    /// Replace patched bytes in a memory image read from the debuggee with the original ones.
    pub fn unpatch(&self, addr: u64, data: &mut [u8]) {
        for site in self.sites.values() {
            if site.addr >= addr && site.addr < addr + data.len() as u64 {
                data[(site.addr - addr) as usize] = site.saved_data;
            }
        }
    }

    /// Keep patched bytes in place when the debuggee memory is overwritten, remember new originals.
    pub fn repatch(&mut self, addr: u64, data: &mut [u8]) {
        for site in self.sites.values_mut() {
            if site.addr >= addr && site.addr < addr + data.len() as u64 {
                let idx = (site.addr - addr) as usize;
                site.saved_data = data[idx];
                data[idx] = INT3 as u8;
            }
        }
    }

    /// Restore every original instruction, used before detaching.
    pub fn disable_all(&mut self, pid: Pid) -> nix::Result<()> {
        for site in self.sites.values() {
            site.disable(pid)?;
        }
        self.sites.clear();
        self.by_id.clear();
        Ok(())
    }

    /// Forget all sites without touching memory, the process is gone.
    pub fn forget(&mut self) {
        self.sites.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sites_with(addrs: &[(u64, u8)]) -> Sites {
        let mut sites = Sites::default();
        for (addr, saved) in addrs {
            sites.sites.insert(
                *addr,
                Site {
                    addr: *addr,
                    saved_data: *saved,
                    users: vec![],
                    temporary: None,
                },
            );
        }
        sites
    }

    #[test]
    fn test_unpatch_memory_image() {
        let sites = sites_with(&[(0x1001, 0x55), (0x1010, 0x48)]);
        let mut image = vec![0x90, 0xCC, 0x90, 0x90];
        sites.unpatch(0x1000, &mut image);
        assert_eq!(image, vec![0x90, 0x55, 0x90, 0x90]);
    }

    #[test]
    fn test_repatch_keeps_int3() {
        let mut sites = sites_with(&[(0x2002, 0x55)]);
        let mut data = vec![1, 2, 3, 4];
        sites.repatch(0x2000, &mut data);
        assert_eq!(data, vec![1, 2, 0xCC, 4]);
        assert_eq!(sites.get(0x2002).unwrap().saved_data, 3);
    }
}
