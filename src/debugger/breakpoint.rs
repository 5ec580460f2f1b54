//! Requested vs installed breakpoints.
use crate::debugger::backend::InstallRequest;
use crate::debugger::error::Error;
use crate::debugger::location::Location;
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointId(pub u32);

impl Display for BreakpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the user asked a breakpoint to be.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointRequest {
    Function(String),
    Line { file: PathBuf, line: u64 },
    Address(u64),
}

impl Display for BreakpointRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointRequest::Function(name) => f.write_str(name),
            BreakpointRequest::Line { file, line } => write!(f, "{}:{line}", file.display()),
            BreakpointRequest::Address(addr) => write!(f, "{addr:#x}"),
        }
    }
}

/// Outcome of one breakpoint synchronization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Exact(Location),
    /// Installed, but not where requested (a line without code snaps to the next line with code).
    Adjusted {
        requested: BreakpointRequest,
        obtained: Location,
    },
    Failed(String),
}

/// Installation primitives a synchronizer needs from a backend.
pub trait BreakpointBackend {
    /// Install a breakpoint, return the location the backend actually obtained.
    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error>;

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub request: BreakpointRequest,
    pub condition: Option<String>,
    pub ignore_count: u32,
    pub enabled: bool,
    /// Defined iff enabled and synchronized at least once.
    pub obtained: Option<Location>,
    pub last_error: Option<String>,
    pub hit_count: u64,
    installed: bool,
    /// Module generation at which an adjusted location was refused.
    declined_at: Option<u64>,
}

impl Breakpoint {
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Compare a request with the location a backend obtained for it.
fn resolution(request: &BreakpointRequest, obtained: &Location) -> Resolution {
    let exact = match request {
        BreakpointRequest::Function(_) => true,
        BreakpointRequest::Line { file, line } => {
            obtained.line == Some(*line) && (obtained.file.is_none() || obtained.same_file(file))
        }
        BreakpointRequest::Address(addr) => obtained.address.map(|a| a == *addr).unwrap_or(true),
    };

    if exact {
        Resolution::Exact(obtained.clone())
    } else {
        Resolution::Adjusted {
            requested: request.clone(),
            obtained: obtained.clone(),
        }
    }
}

/// Callback asked whether an adjusted breakpoint may stay where it landed.
pub type ConfirmAdjusted<'a> = &'a mut dyn FnMut(BreakpointId, &BreakpointRequest, &Location) -> bool;

#[derive(Default)]
pub struct BreakpointSynchronizer {
    table: IndexMap<BreakpointId, Breakpoint>,
    next_id: u32,
    /// Bumped on every module load/unload.
    module_generation: u64,
    /// Last obtained location per request, valid for one module generation.
    cache: HashMap<BreakpointRequest, (u64, Location)>,
    /// Deleted breakpoints still present in the backend.
    orphans: Vec<BreakpointId>,
    confirm_adjusted: bool,
}

impl BreakpointSynchronizer {
    pub fn new(confirm_adjusted: bool) -> Self {
        Self {
            confirm_adjusted,
            ..Default::default()
        }
    }

    pub fn add(
        &mut self,
        request: BreakpointRequest,
        condition: Option<String>,
        ignore_count: u32,
    ) -> BreakpointId {
        self.next_id += 1;
        let id = BreakpointId(self.next_id);
        debug!(target: "breakpoint", "add breakpoint {id} at {request}");
        self.table.insert(
            id,
            Breakpoint {
                id,
                request,
                condition,
                ignore_count,
                enabled: true,
                obtained: None,
                last_error: None,
                hit_count: 0,
                installed: false,
                declined_at: None,
            },
        );
        id
    }

    fn get_mut(&mut self, id: BreakpointId) -> Result<&mut Breakpoint, Error> {
        self.table
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("breakpoint {id}")))
    }

    pub fn enable(&mut self, id: BreakpointId) -> Result<(), Error> {
        let bp = self.get_mut(id)?;
        bp.enabled = true;
        bp.declined_at = None;
        Ok(())
    }

    /// Disable a breakpoint, it is uninstalled on the next synchronization.
    pub fn disable(&mut self, id: BreakpointId) -> Result<(), Error> {
        let bp = self.get_mut(id)?;
        bp.enabled = false;
        bp.obtained = None;
        Ok(())
    }

    pub fn delete(&mut self, id: BreakpointId) -> Result<Breakpoint, Error> {
        let bp = self
            .table
            .shift_remove(&id)
            .ok_or_else(|| Error::NotFound(format!("breakpoint {id}")))?;
        if bp.installed {
            self.orphans.push(id);
        }
        Ok(bp)
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.table.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.table.values()
    }

    pub fn module_generation(&self) -> u64 {
        self.module_generation
    }

    /// A module appeared or vanished, obtained locations may change.
    pub fn on_module_changed(&mut self) {
        self.module_generation += 1;
        debug!(target: "breakpoint", "module generation {}", self.module_generation);
    }

    pub fn record_hit(&mut self, id: BreakpointId) {
        if let Some(bp) = self.table.get_mut(&id) {
            bp.hit_count += 1;
        }
    }

    /// True if a stop on this breakpoint must not be reported (deleted or disabled meanwhile).
    pub fn is_stale_hit(&self, id: BreakpointId) -> bool {
        self.table.get(&id).map(|bp| !bp.enabled).unwrap_or(true)
    }

    /// True if a synchronization would touch the backend.
    pub fn has_pending(&self) -> bool {
        !self.orphans.is_empty()
            || self.table.values().any(|bp| {
                (bp.enabled && !bp.installed && bp.declined_at != Some(self.module_generation))
                    || (!bp.enabled && bp.installed)
            })
    }

    /// Debuggee is gone: nothing is installed anymore, obtained locations stay for display.
    pub fn reset_installation(&mut self) {
        self.orphans.clear();
        self.table.values_mut().for_each(|bp| bp.installed = false);
    }

    /// Diff requested breakpoints against installed ones and fix the backend accordingly.
    ///
    /// Failure of one breakpoint never blocks the others, only fatal errors abort the pass.
    pub fn sync<B: BreakpointBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        confirm: ConfirmAdjusted,
    ) -> Result<Vec<(BreakpointId, Resolution)>, Error> {
        for id in std::mem::take(&mut self.orphans) {
            match backend.remove_breakpoint(id) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(target: "breakpoint", "remove deleted breakpoint {id}: {e:#}"),
                Ok(()) => {}
            }
        }

        let generation = self.module_generation;
        let mut resolutions = vec![];

        for bp in self.table.values_mut() {
            if !bp.enabled {
                if bp.installed {
                    match backend.remove_breakpoint(bp.id) {
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => warn!(target: "breakpoint", "remove breakpoint {}: {e:#}", bp.id),
                        Ok(()) => {}
                    }
                    bp.installed = false;
                }
                continue;
            }
            if bp.installed || bp.declined_at == Some(generation) {
                continue;
            }

            let cached = self
                .cache
                .get(&bp.request)
                .filter(|(gen, _)| *gen == generation)
                .map(|(_, loc)| loc.clone());
            let install_as = match &cached {
                Some(Location {
                    address: Some(addr),
                    ..
                }) => BreakpointRequest::Address(*addr),
                Some(Location {
                    file: Some(file),
                    line: Some(line),
                    ..
                }) => BreakpointRequest::Line {
                    file: file.clone(),
                    line: *line,
                },
                _ => bp.request.clone(),
            };

            let install = InstallRequest {
                id: bp.id,
                request: install_as,
                condition: bp.condition.clone(),
                ignore_count: bp.ignore_count,
            };

            let obtained = match backend.insert_breakpoint(&install) {
                Ok(loc) => cached.unwrap_or(loc),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    info!(target: "breakpoint", "breakpoint {} at {} not installed: {e}", bp.id, bp.request);
                    bp.obtained = None;
                    bp.last_error = Some(e.to_string());
                    resolutions.push((bp.id, Resolution::Failed(e.to_string())));
                    continue;
                }
            };

            let resolution = resolution(&bp.request, &obtained);
            if matches!(resolution, Resolution::Adjusted { .. })
                && self.confirm_adjusted
                && !confirm(bp.id, &bp.request, &obtained)
            {
                match backend.remove_breakpoint(bp.id) {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(target: "breakpoint", "remove declined breakpoint {}: {e:#}", bp.id),
                    Ok(()) => {}
                }
                let reason = format!("adjusted location {obtained} declined");
                bp.obtained = None;
                bp.declined_at = Some(generation);
                bp.last_error = Some(reason.clone());
                resolutions.push((bp.id, Resolution::Failed(reason)));
                continue;
            }

            debug!(target: "breakpoint", "breakpoint {} installed at {obtained}", bp.id);
            self.cache
                .insert(bp.request.clone(), (generation, obtained.clone()));
            bp.installed = true;
            bp.obtained = Some(obtained);
            bp.last_error = None;
            resolutions.push((bp.id, resolution));
        }

        Ok(resolutions)
    }
}
