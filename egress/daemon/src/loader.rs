//! eBPF program loader
//!
//! Handles relaxing the locked-memory limit and instantiating the
//! compiled filtering program.

use crate::error::EngineError;
use aya::{
    maps::Map,
    programs::Program,
    Bpf,
};
use log::{debug, info};
use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

static MEMLOCK: OnceLock<Result<(), i32>> = OnceLock::new();

/// Remove the locked memory limit for this process
///
/// Needed on kernels that still charge BPF maps against RLIMIT_MEMLOCK.
/// The syscall runs at most once; later calls return the first outcome.
pub fn relax_memlock() -> Result<(), EngineError> {
    let outcome = MEMLOCK.get_or_init(|| {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        // SAFETY: setrlimit only reads the struct we pass in.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EPERM))
        }
    });

    match outcome {
        Ok(()) => Ok(()),
        Err(errno) => Err(EngineError::Memlock(io::Error::from_raw_os_error(*errno))),
    }
}

/// Whether the effective user is root
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// eBPF program loader and manager
pub struct ProbeLoader {
    path: PathBuf,
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load the eBPF object at `path`
    ///
    /// Maps are created here; programs are loaded into the kernel when
    /// they are attached.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        info!("Loading eBPF object from: {:?}", path);

        let data = std::fs::read(path).map_err(|source| EngineError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let ebpf = Bpf::load(&data).map_err(|e| EngineError::from_load(path.to_path_buf(), e))?;

        for (name, _) in ebpf.programs() {
            debug!("loaded program: {}", name);
        }

        info!("eBPF program loaded successfully");

        Ok(Self {
            path: path.to_path_buf(),
            ebpf,
        })
    }

    /// Every program declared in the object, by name
    pub fn programs_mut(&mut self) -> impl Iterator<Item = (&str, &mut Program)> {
        self.ebpf.programs_mut()
    }

    /// Borrow a map that stays owned by the collection
    pub fn map_mut(&mut self, name: &'static str) -> Result<&mut Map, EngineError> {
        self.ebpf.map_mut(name).ok_or(EngineError::MissingMap(name))
    }

    /// Take ownership of a map out of the collection
    pub fn take_map(&mut self, name: &'static str) -> Result<Map, EngineError> {
        self.ebpf.take_map(name).ok_or(EngineError::MissingMap(name))
    }

    /// Release the collection
    pub fn clean(self) {
        info!("Releasing eBPF collection {:?}", self.path);
        drop(self.ebpf);
    }
}
