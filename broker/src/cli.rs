//! CLI argument parsing with clap derive

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use broker_common::{InstanceDetails, Parameters, PendingOperation};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::app::{AppContext, Backend, Substrate};
use crate::application::services::intake::UpdateRequest;
use crate::domain::error::ErrorKind;
use crate::infra::config;
use crate::infra::http_repository::HttpRepository;

/// How long a `--local` run waits on an empty queue before returning.
const LOCAL_DRAIN_IDLE: Duration = Duration::from_millis(50);

/// Helm-backed service broker
#[derive(Parser)]
#[command(
    name = "helm-broker",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Use in-process cache, locks and queue, and run accepted tasks inline
    #[arg(long, global = true)]
    pub local: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run queued lifecycle tasks until interrupted
    Worker,

    /// Provision a new instance
    Provision(ProvisionArgs),

    /// Change the plan or parameters of an instance
    Update(UpdateArgs),

    /// Create the binding of an instance
    Bind(BindingArgs),

    /// Remove the binding of an instance
    Unbind(BindingArgs),

    /// Uninstall an instance
    Deprovision(InstanceArgs),

    /// Show the last operation of an instance or its binding
    Status(StatusArgs),

    /// Remove finished and abandoned instance directories
    Clean,

    /// Mirror the addon repository, then rebuild the addon catalog from
    /// addon metadata on disk
    LoadCatalog(LoadCatalogArgs),
}

#[derive(Args)]
pub struct InstanceArgs {
    pub instance_id: String,
}

#[derive(Args)]
pub struct ProvisionArgs {
    pub instance_id: String,

    #[arg(long)]
    pub service_id: String,

    #[arg(long)]
    pub plan_id: String,

    /// Platform context as a JSON object (needs `instance_name` and `namespace`)
    #[arg(long, value_parser = parse_object)]
    pub context: BTreeMap<String, Value>,

    /// Chart parameters as a JSON object
    #[arg(long, value_parser = parse_parameters)]
    pub parameters: Option<Parameters>,
}

#[derive(Args)]
pub struct UpdateArgs {
    pub instance_id: String,

    /// Defaults to the instance's current service
    #[arg(long)]
    pub service_id: Option<String>,

    #[arg(long)]
    pub plan_id: Option<String>,

    #[arg(long, value_parser = parse_parameters)]
    pub parameters: Option<Parameters>,
}

#[derive(Args)]
pub struct BindingArgs {
    pub instance_id: String,

    #[arg(long)]
    pub binding_id: String,
}

#[derive(Args)]
pub struct LoadCatalogArgs {
    /// Repository index URL; defaults to the first entry of
    /// `config/repositories`. Without either, only the local scan runs.
    #[arg(long)]
    pub repository: Option<String>,
}

#[derive(Args)]
pub struct StatusArgs {
    pub instance_id: String,

    /// Show the binding (with credentials once it succeeded)
    #[arg(long)]
    pub binding: bool,
}

fn parse_object(raw: &str) -> Result<BTreeMap<String, Value>, String> {
    serde_json::from_str(raw).map_err(|e| format!("expected a JSON object: {e}"))
}

fn parse_parameters(raw: &str) -> Result<Parameters, String> {
    serde_json::from_str(raw).map_err(|e| format!("expected a JSON object: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering output")?);
    Ok(())
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration or the backend cannot be set up, or
    /// the broker rejects the request.
    pub async fn run(self) -> Result<()> {
        let Cli { local, command } = self;
        let config = config::load()?;
        let backend = if local { Backend::Local } else { Backend::Valkey };
        let substrate = Substrate::connect(&config, backend).await?;
        let ctx = AppContext::new(config, substrate);
        run_command(&ctx, command, local).await
    }
}

/// Dispatch one command against an already wired context.
///
/// # Errors
///
/// Returns the broker error of a rejected request.
pub async fn run_command(ctx: &AppContext, command: Command, local: bool) -> Result<()> {
    match command {
        Command::Worker => run_worker(ctx).await,
        Command::Provision(args) => {
            let details = InstanceDetails {
                service_id: args.service_id,
                plan_id: args.plan_id,
                context: args.context,
                parameters: args.parameters,
            };
            let pending = ctx.intake.provision(&args.instance_id, details).await?;
            accepted(ctx, &pending, local).await
        }
        Command::Update(args) => {
            let request = UpdateRequest {
                service_id: args.service_id,
                plan_id: args.plan_id,
                parameters: args.parameters,
            };
            let pending = ctx.intake.update(&args.instance_id, request).await?;
            accepted(ctx, &pending, local).await
        }
        Command::Bind(args) => {
            let pending = ctx.intake.bind(&args.instance_id, &args.binding_id).await?;
            accepted(ctx, &pending, local).await
        }
        Command::Unbind(args) => {
            let pending = ctx.intake.unbind(&args.instance_id, &args.binding_id).await?;
            accepted(ctx, &pending, local).await
        }
        Command::Deprovision(args) => {
            let pending = ctx.intake.deprovision(&args.instance_id).await?;
            accepted(ctx, &pending, local).await
        }
        Command::Status(args) => {
            if args.binding {
                match ctx.intake.get_binding(&args.instance_id).await {
                    Ok(binding) => print_json(&binding),
                    Err(e) if e.kind() == ErrorKind::Conflict => {
                        print_json(&ctx.intake.get_binding_operation(&args.instance_id).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            } else {
                let last = ctx.intake.get_operation(&args.instance_id).await?;
                print_json(&last)
            }
        }
        Command::Clean => {
            let reaped = ctx.reaper.clean().await?;
            print_json(&json!({ "reaped": reaped }))
        }
        Command::LoadCatalog(args) => {
            let http = HttpRepository::new(ctx.config.command_timeout())?;
            let sync = ctx.repository_sync(Arc::new(http));
            let url = match args.repository {
                Some(url) => Some(url),
                None => sync.configured_url().await?,
            };
            if let Some(url) = url {
                let changed = sync.sync(&url).await?;
                tracing::info!(url = %url, changed, "repository checked");
            }
            let catalog = ctx.catalog.load().await?;
            let names: Vec<&String> = catalog.addons.keys().collect();
            print_json(&json!({ "addons": names }))
        }
    }
}

/// Report an accepted request. With `--local` the task runs here first and
/// the resulting operation is reported alongside.
async fn accepted(ctx: &AppContext, pending: &PendingOperation, local: bool) -> Result<()> {
    if !local {
        return print_json(pending);
    }
    ctx.workers.drain(LOCAL_DRAIN_IDLE).await?;
    let last = if pending.operation.is_binding() {
        ctx.intake.get_binding_operation(&pending.instance_id).await
    } else {
        ctx.intake.get_operation(&pending.instance_id).await
    };
    let last_operation = match last {
        Ok(last) => serde_json::to_value(last)?,
        // Unbind removes the binding document on success.
        Err(e) if e.kind() == ErrorKind::NotFound => Value::Null,
        Err(e) => return Err(e.into()),
    };
    print_json(&json!({ "accepted": pending, "last_operation": last_operation }))
}

async fn run_worker(ctx: &AppContext) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    let pool = std::sync::Arc::clone(&ctx.workers);
    let mut handle = tokio::spawn(pool.run(rx));
    tokio::select! {
        joined = &mut handle => return joined.context("worker pool panicked"),
        signal = tokio::signal::ctrl_c() => signal.context("installing Ctrl-C handler")?,
    }
    tracing::info!("shutdown requested, finishing in-flight tasks");
    // A send error only means every worker already exited.
    let _ = tx.send(true);
    handle.await.context("worker pool panicked")
}
