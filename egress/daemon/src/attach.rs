//! Hook attachment
//!
//! Every program in the collection declares the kind of hook it expects.
//! The kinds form a closed set; each has exactly one way of computing its
//! target and one way of attaching.

use crate::error::AttachError;
use aya::{
    programs::{
        cgroup_skb::CgroupSkbLink, fentry::FEntryLink, fexit::FExitLink, kprobe::KProbeLink,
        tp_btf::BtfTracePointLink, trace_point::TracePointLink, CgroupSkbAttachType, Program,
        ProgramError,
    },
    Btf,
};
use kntrl_common::{ROOT_CGROUP, TRACEPOINT_CATEGORY, TRACEPOINT_CONNECT};
use log::{debug, info, warn};
use std::{collections::BTreeMap, fmt, fs::File, path::PathBuf};

/// Kernel hook mechanisms the control plane knows how to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// kprobe on a kernel function
    FunctionEntry,
    /// BTF-enabled tracing (fentry, fexit, tp_btf)
    Tracing,
    /// Static tracepoint
    Tracepoint,
    /// cgroup socket buffer hook, egress direction
    CgroupEgress,
}

impl HookKind {
    /// Classify an aya program, `None` for kinds this engine does not attach
    pub fn of(program: &Program) -> Option<Self> {
        match program {
            Program::KProbe(_) => Some(HookKind::FunctionEntry),
            Program::FEntry(_) | Program::FExit(_) | Program::BtfTracePoint(_) => {
                Some(HookKind::Tracing)
            }
            Program::TracePoint(_) => Some(HookKind::Tracepoint),
            Program::CgroupSkb(_) => Some(HookKind::CgroupEgress),
            _ => None,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::FunctionEntry => f.write_str("Kprobe"),
            HookKind::Tracing => f.write_str("tracing"),
            HookKind::Tracepoint => f.write_str("tracepoint"),
            HookKind::CgroupEgress => f.write_str("CGroupSKB"),
        }
    }
}

/// Where a program gets attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Kernel symbol for a kprobe
    Symbol(String),
    /// BTF function or tracepoint, bound when the program is loaded
    Btf(String),
    /// Static tracepoint
    Tracepoint {
        category: &'static str,
        name: &'static str,
    },
    /// cgroup directory, egress direction
    Cgroup(PathBuf),
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachTarget::Symbol(symbol) => write!(f, "symbol {}", symbol),
            AttachTarget::Btf(name) => write!(f, "btf {}", name),
            AttachTarget::Tracepoint { category, name } => {
                write!(f, "tracepoint {}:{}", category, name)
            }
            AttachTarget::Cgroup(path) => write!(f, "cgroup {} (egress)", path.display()),
        }
    }
}

/// Attach targets per program, with per-program symbol overrides
#[derive(Debug, Clone)]
pub struct AttachTargets {
    overrides: BTreeMap<String, String>,
    cgroup_root: PathBuf,
}

impl AttachTargets {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self {
            overrides,
            cgroup_root: PathBuf::from(ROOT_CGROUP),
        }
    }

    /// Target for a program of the given kind
    pub fn resolve(&self, kind: HookKind, program: &str) -> AttachTarget {
        let symbol = || {
            self.overrides
                .get(program)
                .cloned()
                .unwrap_or_else(|| program.to_string())
        };

        match kind {
            HookKind::FunctionEntry => AttachTarget::Symbol(symbol()),
            HookKind::Tracing => AttachTarget::Btf(symbol()),
            HookKind::Tracepoint => AttachTarget::Tracepoint {
                category: TRACEPOINT_CATEGORY,
                name: TRACEPOINT_CONNECT,
            },
            HookKind::CgroupEgress => AttachTarget::Cgroup(self.cgroup_root.clone()),
        }
    }
}

impl Default for AttachTargets {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// A program that can be bound to a kernel hook
pub trait HookProgram {
    /// Owned handle; dropping it releases the hook
    type Link;

    fn kind(&self) -> Option<HookKind>;

    fn attach(&mut self, name: &str, target: &AttachTarget) -> Result<Self::Link, AttachError>;
}

/// Owned kernel link for one attached program
pub enum Link {
    KProbe(KProbeLink),
    FEntry(FEntryLink),
    FExit(FExitLink),
    BtfTracePoint(BtfTracePointLink),
    TracePoint(TracePointLink),
    CgroupSkb(CgroupSkbLink),
}

/// Live binding between one program and one hook point
///
/// Dropping it detaches the program.
pub struct Attachment {
    program: String,
    target: AttachTarget,
    _link: Link,
}

impl Attachment {
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        debug!("detaching {} from {}", self.program, self.target);
    }
}

fn load_err(program: &str) -> impl FnOnce(ProgramError) -> AttachError + '_ {
    move |source| AttachError::Load {
        program: program.to_string(),
        source,
    }
}

fn link_err(program: &str) -> impl FnOnce(ProgramError) -> AttachError + '_ {
    move |source| AttachError::Link {
        program: program.to_string(),
        source,
    }
}

fn kernel_btf(program: &str) -> Result<Btf, AttachError> {
    Btf::from_sys_fs().map_err(|source| AttachError::Btf {
        program: program.to_string(),
        source,
    })
}

impl HookProgram for Program {
    type Link = Attachment;

    fn kind(&self) -> Option<HookKind> {
        HookKind::of(self)
    }

    fn attach(&mut self, name: &str, target: &AttachTarget) -> Result<Attachment, AttachError> {
        let link = match (self, target) {
            (Program::KProbe(program), AttachTarget::Symbol(symbol)) => {
                program.load().map_err(load_err(name))?;
                let id = program.attach(symbol, 0).map_err(link_err(name))?;
                Link::KProbe(program.take_link(id).map_err(link_err(name))?)
            }
            (Program::FEntry(program), AttachTarget::Btf(function)) => {
                program
                    .load(function, &kernel_btf(name)?)
                    .map_err(load_err(name))?;
                let id = program.attach().map_err(link_err(name))?;
                Link::FEntry(program.take_link(id).map_err(link_err(name))?)
            }
            (Program::FExit(program), AttachTarget::Btf(function)) => {
                program
                    .load(function, &kernel_btf(name)?)
                    .map_err(load_err(name))?;
                let id = program.attach().map_err(link_err(name))?;
                Link::FExit(program.take_link(id).map_err(link_err(name))?)
            }
            (Program::BtfTracePoint(program), AttachTarget::Btf(tracepoint)) => {
                program
                    .load(tracepoint, &kernel_btf(name)?)
                    .map_err(load_err(name))?;
                let id = program.attach().map_err(link_err(name))?;
                Link::BtfTracePoint(program.take_link(id).map_err(link_err(name))?)
            }
            (Program::TracePoint(program), AttachTarget::Tracepoint { category, name: tp }) => {
                program.load().map_err(load_err(name))?;
                let id = program.attach(category, tp).map_err(link_err(name))?;
                Link::TracePoint(program.take_link(id).map_err(link_err(name))?)
            }
            (Program::CgroupSkb(program), AttachTarget::Cgroup(path)) => {
                let cgroup = File::open(path).map_err(|source| AttachError::Cgroup {
                    path: path.clone(),
                    source,
                })?;
                program.load().map_err(load_err(name))?;
                let id = program
                    .attach(&cgroup, CgroupSkbAttachType::Egress)
                    .map_err(link_err(name))?;
                Link::CgroupSkb(program.take_link(id).map_err(link_err(name))?)
            }
            _ => {
                return Err(AttachError::TargetMismatch {
                    program: name.to_string(),
                    target: target.to_string(),
                })
            }
        };

        Ok(Attachment {
            program: name.to_string(),
            target: target.clone(),
            _link: link,
        })
    }
}

/// Attach every recognized program in the collection
///
/// Programs of an unknown kind are skipped with a warning. The first
/// failure aborts; links collected up to that point are dropped, which
/// detaches them.
pub fn attach_all<'a, P, I>(programs: I, targets: &AttachTargets) -> Result<Vec<P::Link>, AttachError>
where
    P: HookProgram + 'a,
    I: IntoIterator<Item = (&'a str, &'a mut P)>,
{
    let mut links = Vec::new();

    for (name, program) in programs {
        let Some(kind) = program.kind() else {
            warn!("ebpf program unrecognized: {}", name);
            continue;
        };

        let target = targets.resolve(kind, name);
        info!("linking {} [{}] -> {}", kind, name, target);
        links.push(program.attach(name, &target)?);
    }

    info!("{} program(s) attached", links.len());
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct FakeLink {
        released: Arc<AtomicUsize>,
    }

    impl Drop for FakeLink {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeProgram {
        kind: Option<HookKind>,
        fail: bool,
        attached_to: Option<AttachTarget>,
        released: Arc<AtomicUsize>,
    }

    impl FakeProgram {
        fn new(kind: Option<HookKind>, released: &Arc<AtomicUsize>) -> Self {
            Self {
                kind,
                fail: false,
                attached_to: None,
                released: Arc::clone(released),
            }
        }
    }

    impl HookProgram for FakeProgram {
        type Link = FakeLink;

        fn kind(&self) -> Option<HookKind> {
            self.kind
        }

        fn attach(&mut self, name: &str, target: &AttachTarget) -> Result<FakeLink, AttachError> {
            if self.fail {
                return Err(AttachError::TargetMismatch {
                    program: name.to_string(),
                    target: target.to_string(),
                });
            }
            self.attached_to = Some(target.clone());
            Ok(FakeLink {
                released: Arc::clone(&self.released),
            })
        }
    }

    #[test]
    fn test_resolve_targets() {
        let mut overrides = BTreeMap::new();
        overrides.insert("kprobe_connect".to_string(), "tcp_v4_connect".to_string());
        let targets = AttachTargets::new(overrides);

        assert_eq!(
            targets.resolve(HookKind::FunctionEntry, "kprobe_connect"),
            AttachTarget::Symbol("tcp_v4_connect".to_string())
        );
        assert_eq!(
            targets.resolve(HookKind::FunctionEntry, "tcp_close"),
            AttachTarget::Symbol("tcp_close".to_string())
        );
        assert_eq!(
            targets.resolve(HookKind::Tracing, "inet_sock_set_state"),
            AttachTarget::Btf("inet_sock_set_state".to_string())
        );
        assert_eq!(
            targets.resolve(HookKind::Tracepoint, "anything"),
            AttachTarget::Tracepoint {
                category: "syscalls",
                name: "sys_enter_connect"
            }
        );
        assert_eq!(
            targets.resolve(HookKind::CgroupEgress, "egress_filter"),
            AttachTarget::Cgroup(PathBuf::from("/sys/fs/cgroup"))
        );
    }

    #[test]
    fn test_unrecognized_kind_is_skipped() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut programs = vec![
            ("kprobe_connect".to_string(), FakeProgram::new(Some(HookKind::FunctionEntry), &released)),
            ("xdp_prog".to_string(), FakeProgram::new(None, &released)),
            ("tp_connect".to_string(), FakeProgram::new(Some(HookKind::Tracepoint), &released)),
            ("egress".to_string(), FakeProgram::new(Some(HookKind::CgroupEgress), &released)),
        ];

        let links = attach_all(
            programs.iter_mut().map(|(n, p)| (n.as_str(), p)),
            &AttachTargets::default(),
        )
        .unwrap();

        assert_eq!(links.len(), 3);
        assert!(programs[0].1.attached_to.is_some());
        assert!(programs[1].1.attached_to.is_none());
        assert!(programs[2].1.attached_to.is_some());
        assert!(programs[3].1.attached_to.is_some());

        drop(links);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failure_releases_earlier_links() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut failing = FakeProgram::new(Some(HookKind::Tracing), &released);
        failing.fail = true;
        let mut programs = vec![
            ("first".to_string(), FakeProgram::new(Some(HookKind::FunctionEntry), &released)),
            ("second".to_string(), FakeProgram::new(Some(HookKind::Tracepoint), &released)),
            ("broken".to_string(), failing),
            ("never".to_string(), FakeProgram::new(Some(HookKind::CgroupEgress), &released)),
        ];

        let result = attach_all(
            programs.iter_mut().map(|(n, p)| (n.as_str(), p)),
            &AttachTargets::default(),
        );

        assert!(result.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(programs[3].1.attached_to.is_none());
    }
}
