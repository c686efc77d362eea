use agent::{CgroupMode, CgroupProfiler, Record, Sink, SystemdUnitTarget};
use clap::Parser;
use debuginfo::{DebuginfoClient, GrpcDebuginfoClient, NoopDebuginfoClient};
use ksym::{KernelSymbols, KsymCache};
use profile::executableinfo::{kernel_build_id, KERNEL_NOTES};
use profile_store::{GrpcProfileStoreClient, NoopProfileStoreClient, ProfileStoreClient};
use sampler::ProcStackSampler;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

mod agent;
mod config;
mod debuginfo;
mod error;
mod ksym;
mod process;
mod profile;
mod profile_store;
mod sampler;
mod symbolizer;
mod symbols;
#[cfg(test)]
mod testutil;

pub(crate) mod profilestorepb {
    tonic::include_proto!("parca.profilestore.v1alpha1");
}

pub(crate) mod debuginfopb {
    tonic::include_proto!("parca.debuginfo.v1alpha1");
}

pub(crate) mod pprofpb {
    tonic::include_proto!("perftools.profiles");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    colog::init();

    let args = config::Args::parse();
    let node = args.node_name();
    let cgroup_mode = CgroupMode::detect(Path::new(agent::CGROUP_ROOT));
    log::info!("Starting agent on {} ({} cgroups)", node, cgroup_mode);

    let ksyms: Arc<dyn KernelSymbols> =
        Arc::new(KsymCache::new(&args.kallsyms).with_update_interval(args.kallsyms_refresh()));
    let kernel_build_id = kernel_build_id(Path::new(KERNEL_NOTES)).unwrap_or_else(|e| {
        log::warn!("Failed to read kernel build ID: {:#}", e);
        None
    });

    let (profile_store, debuginfo): (Arc<dyn ProfileStoreClient>, Arc<dyn DebuginfoClient>) =
        match &args.store_address {
            Some(address) => {
                log::info!("Sending profiles to {}", address);
                let channel = Channel::from_shared(address.clone())?.connect_lazy();
                (
                    Arc::new(GrpcProfileStoreClient::new(channel.clone())),
                    Arc::new(GrpcDebuginfoClient::new(channel)),
                )
            }
            None => {
                log::info!("No store address configured, profiles are only kept locally");
                (Arc::new(NoopProfileStoreClient), Arc::new(NoopDebuginfoClient))
            }
        };

    let cancel = CancellationToken::new();
    let mut profilers = JoinSet::new();

    for unit in args.systemd_units.iter() {
        let target = SystemdUnitTarget::new(unit.as_str(), node.as_str(), cgroup_mode);
        let sampler = ProcStackSampler::new(args.sample_frequency);
        let name = unit.clone();
        let sink: Sink = Box::new(move |record: Record| {
            log::debug!(
                "{}: delivered profile with {} samples",
                name,
                record.profile.sample.len()
            )
        });

        let mut profiler = CgroupProfiler::new(
            args.external_labels(),
            Arc::clone(&ksyms),
            Arc::clone(&profile_store),
            Arc::clone(&debuginfo),
            target,
            args.sampling_duration(),
            sink,
            args.scratch_path(unit),
        )
        .with_sampler(Arc::new(sampler))
        .with_jvm_attach(args.jvm_attach())
        .with_kernel_build_id(kernel_build_id.clone());

        let cancel = cancel.clone();
        let unit = unit.clone();
        profilers.spawn(async move {
            let result = profiler.run(cancel).await;
            (unit, profiler.state(), result)
        });
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Shutting down");
                    cancel.cancel();
                }
                Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    });

    while let Some(joined) = profilers.join_next().await {
        let (unit, state, result) = joined?;
        match result {
            Ok(()) => log::info!("Profiler for {} stopped", unit),
            Err(e) => log::error!("Profiler for {} ended {:?}: {}", unit, state, e),
        }
    }

    Ok(())
}
