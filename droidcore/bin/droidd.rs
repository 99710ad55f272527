use clap::Parser;
use droidcore::{
    cli::{DroiddArgs, DroiddSubcommand},
    config::DroidConfig,
    health::{reporter_from_config, HealthMonitor},
    orchestration::Orchestrator,
    DroidcoreResult,
};
use serde::Serialize;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> DroidcoreResult<()> {
    // Loads `.env` before the arguments so it can provide `LOG_FILE_PATH` too.
    let config = DroidConfig::from_env()?;
    let args = DroiddArgs::parse();
    let _guard = droidcore::init_tracing(args.log_file.as_deref())?;

    let orchestrator = Orchestrator::new(config).await?;
    match args.subcommand.unwrap_or(DroiddSubcommand::Serve) {
        DroiddSubcommand::Serve => serve(&orchestrator).await?,
        DroiddSubcommand::List => print_json(&orchestrator.list_with_info().await)?,
        DroiddSubcommand::Sync => print_json(&orchestrator.sync_cvd_state().await?)?,
        DroiddSubcommand::Snapshots { org: Some(org) } => {
            print_json(&orchestrator.snapshots().list_org_snapshots(&org).await?)?
        }
        DroiddSubcommand::Snapshots { org: None } => {
            print_json(&orchestrator.snapshots().list_snapshots_with_info().await?)?
        }
        DroiddSubcommand::Metrics => print_json(&orchestrator.host_metrics().await?)?,
        DroiddSubcommand::Upload { org, name } => {
            print_json(&orchestrator.transfer().upload_snapshot(&org, &name).await?)?
        }
        DroiddSubcommand::Download { org, name } => {
            print_json(&orchestrator.transfer().download_snapshot(&org, &name).await?)?
        }
        DroiddSubcommand::Exists { org, name } => {
            print_json(&orchestrator.transfer().snapshot_exists(&org, &name).await?)?
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

async fn serve(orchestrator: &Orchestrator) -> DroidcoreResult<()> {
    let config = orchestrator.config();
    tracing::info!(
        remote = config.is_remote(),
        base_instance = *config.get_base_instance(),
        max_instances = *config.get_max_instances(),
        "starting droidd"
    );

    match orchestrator.recover_orphaned_sandboxes().await {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::info!(count = recovered.len(), "recovered sandboxes from disk")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to recover orphaned sandboxes"),
    }

    if let Err(e) = orchestrator.sync_cvd_state().await {
        tracing::warn!(error = %e, "failed to sync toolchain state");
    }

    let checker = orchestrator.health_checker(reporter_from_config(config));
    let monitor = HealthMonitor::new(checker, *config.get_health_interval());
    monitor.start().await;

    shutdown_signal().await?;
    tracing::info!("shutting down");

    monitor.stop().await;
    orchestrator.registry().persist().await?;
    Ok(())
}

async fn shutdown_signal() -> DroidcoreResult<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> DroidcoreResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
