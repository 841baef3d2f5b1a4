//! The control-plane engine
//!
//! One entry point for every architecture: the artifact path and attach
//! targets come from [`EngineConfig`]. Seed names are resolved before any
//! kernel resource exists, since an enforcing egress hook may drop the
//! lookups. Kernel-side state lives in [`EngineContext`]; its field order is
//! the release order, so every exit path, early or not, tears down
//! attachments before the maps and the collection.

use crate::{
    allow::{AllowManager, AllowMap},
    attach::{attach_all, AttachTargets, Attachment},
    config::{EngineConfig, Mode},
    consumer::{drain, ConsumerStats, EventConsumer},
    error::EngineError,
    events::PerfReader,
    loader::{is_root, relax_memlock, ProbeLoader},
    mode,
    reporter::Reporter,
    resolver::{Resolver, SystemResolver},
    seed,
    shutdown::ShutdownCoordinator,
};
use kntrl_common::{MAP_ALLOW, MAP_IPV4_CLOSED_EVENTS, MAP_IPV4_EVENTS, MAP_MODE};
use log::{debug, info, warn};
use std::{collections::BTreeSet, net::Ipv4Addr};

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: Mode,
    pub consumer: ConsumerStats,
    pub closed_events: u64,
    pub seeded: usize,
    pub allow_extended: usize,
    pub unique_connections: usize,
}

/// Kernel resources held for the lifetime of a run
pub struct EngineContext {
    attachments: Vec<Attachment>,
    allow: AllowManager<AllowMap>,
    loader: ProbeLoader,
}

impl EngineContext {
    /// Load, attach, set the mode and write the seed addresses
    fn setup(
        config: &EngineConfig,
        mode: Mode,
        seeds: BTreeSet<Ipv4Addr>,
    ) -> Result<(Self, usize), EngineError> {
        if !is_root() {
            return Err(EngineError::Privilege);
        }

        relax_memlock()?;

        let mut loader = ProbeLoader::load(&config.artifact)?;

        let targets = AttachTargets::new(config.attach_overrides.clone());
        let attachments = attach_all(loader.programs_mut(), &targets)?;

        mode::apply(loader.map_mut(MAP_MODE)?, mode)?;

        let mut allow = AllowManager::new(
            AllowMap::new(loader.take_map(MAP_ALLOW)?)?,
            config.allow_suffixes.clone(),
        );
        let seeded = allow.seed(seeds)?;

        Ok((
            Self {
                attachments,
                allow,
                loader,
            },
            seeded,
        ))
    }

    /// Release attachments, maps and the collection, in that order
    fn release(self) {
        let Self {
            attachments,
            allow,
            loader,
        } = self;

        let programs: Vec<&str> = attachments.iter().map(Attachment::program).collect();
        info!("Detaching {} program(s): {}", programs.len(), programs.join(", "));
        drop(attachments);
        debug!("allow-list holds {} address(es) at exit", allow.list().addresses().len());
        drop(allow);
        loader.clean();
    }
}

/// Run the engine with the system resolver until a termination signal arrives
pub async fn run(config: EngineConfig) -> Result<RunSummary, EngineError> {
    run_with(config, &SystemResolver::from_system_conf()).await
}

/// Run the engine until a termination signal arrives
pub async fn run_with<R: Resolver>(
    config: EngineConfig,
    resolver: &R,
) -> Result<RunSummary, EngineError> {
    let mode: Mode = config.mode.parse()?;
    debug!("engine configuration: {:?}", config);

    let mut reporter =
        Reporter::new(config.report_file.as_deref()).map_err(EngineError::Reporter)?;

    let seeds = seed::collect(&config.seed, resolver).await;

    let (mut ctx, seeded) = EngineContext::setup(&config, mode, seeds)?;

    let mut opened = PerfReader::open(
        MAP_IPV4_EVENTS,
        ctx.loader.take_map(MAP_IPV4_EVENTS)?,
        config.perf_buffer_bytes,
    )?;
    let closed = PerfReader::open(
        MAP_IPV4_CLOSED_EVENTS,
        ctx.loader.take_map(MAP_IPV4_CLOSED_EVENTS)?,
        config.perf_buffer_bytes,
    )?;

    let shutdown = ShutdownCoordinator::arm_signals(opened.closer())?;

    let closed_closer = closed.closer();
    let draining = tokio::spawn(drain(closed));

    info!("kntrl running in {} mode, press Ctrl-C to stop", mode);
    let consumer = EventConsumer::new(&mut ctx.allow, resolver, &mut reporter)
        .run(&mut opened)
        .await;

    // Finalization
    let cause = shutdown.wait().await;
    debug!("shutdown cause: {:?}", cause);
    drop(opened);

    closed_closer.close();
    let closed_events = draining.await.unwrap_or_default();

    reporter.print();
    reporter.clean();
    if let Some(path) = config.summary_file.as_deref() {
        match reporter.export_json(path) {
            Ok(()) => info!("Summary written to {:?}", path),
            Err(e) => warn!("{:#}", e),
        }
    }

    let summary = RunSummary {
        mode,
        consumer,
        closed_events,
        seeded,
        allow_extended: ctx.allow.extended(),
        unique_connections: reporter.connection_count(),
    };
    ctx.release();

    Ok(summary)
}
