//! # vandalctl
//!
//! Command-line interface for DataProfile and DataClone resources.
//!
//! ## Usage
//!
//! ```bash
//! # Create a profile from a manifest
//! vandalctl profile create -f nightly.yaml
//!
//! # List clones in a namespace
//! vandalctl --namespace dev clone list
//!
//! # Print connection details of a ready clone
//! vandalctl clone connection pr-123
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use vandal_controller::database::ConnectionInfo;
use vandal_controller::{Condition, DataClone, DataProfile};

/// Vandal CLI
#[derive(Parser)]
#[command(name = "vandalctl")]
#[command(about = "Manage DataProfile and DataClone resources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with DataProfile resources
    Profile {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Work with DataClone resources
    Clone {
        #[command(subcommand)]
        action: CloneAction,
    },
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Create a resource from a YAML manifest
    Create {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print a resource as YAML
    Get { name: String },
    /// List resources in the namespace
    List,
    /// Delete a resource
    Delete { name: String },
    /// Show phase and conditions of a resource
    Status { name: String },
}

#[derive(Subcommand)]
enum CloneAction {
    #[command(flatten)]
    Resource(ResourceAction),
    /// Print connection details of a ready clone
    Connection { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vandalctl=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client. Ensure kubeconfig is configured.")?;
    let ns = cli.namespace.as_str();

    match cli.command {
        Commands::Profile { action } => {
            let api: Api<DataProfile> = Api::namespaced(client, ns);
            run_resource_action(&api, ns, action, PROFILE_LISTING).await
        }
        Commands::Clone {
            action: CloneAction::Resource(action),
        } => {
            let api: Api<DataClone> = Api::namespaced(client, ns);
            run_resource_action(&api, ns, action, CLONE_LISTING).await
        }
        Commands::Clone {
            action: CloneAction::Connection { name },
        } => connection_command(client, ns, &name).await,
    }
}

/// How a resource kind is printed
struct Listing<K> {
    header: &'static str,
    row: fn(&K),
    status: fn(&K),
}

const PROFILE_LISTING: Listing<DataProfile> = Listing {
    header: "NAME                           SCHEDULE             PHASE              LAST SNAPSHOT",
    row: print_profile_row,
    status: print_profile_status,
};

const CLONE_LISTING: Listing<DataClone> = Listing {
    header: "NAME                           PROFILE              PHASE              EXPIRES",
    row: print_clone_row,
    status: print_clone_status,
};

async fn run_resource_action<K>(
    api: &Api<K>,
    ns: &str,
    action: ResourceAction,
    listing: Listing<K>,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let kind = K::kind(&());
    match action {
        ResourceAction::Create { file } => {
            let mut resource: K = read_manifest(&file)?;
            resource.meta_mut().namespace = Some(ns.to_string());
            let created = api
                .create(&PostParams::default(), &resource)
                .await
                .with_context(|| format!("Failed to create {kind} from {}", file.display()))?;
            println!("✅ {kind} '{}/{}' created", ns, created.name_any());
        }
        ResourceAction::Get { name } => {
            let resource = get(api, ns, &name).await?;
            print!("{}", serde_yaml::to_string(&resource)?);
        }
        ResourceAction::List => {
            let list = api
                .list(&ListParams::default())
                .await
                .with_context(|| format!("Failed to list {kind} resources in '{ns}'"))?;
            if list.items.is_empty() {
                println!("No {kind} resources found in namespace '{ns}'.");
                return Ok(());
            }
            println!("{}", listing.header);
            for resource in &list.items {
                (listing.row)(resource);
            }
        }
        ResourceAction::Delete { name } => {
            api.delete(&name, &DeleteParams::default())
                .await
                .with_context(|| format!("Failed to delete {kind} '{ns}/{name}'"))?;
            println!("🗑️  {kind} '{ns}/{name}' deletion requested");
        }
        ResourceAction::Status { name } => {
            let resource = get(api, ns, &name).await?;
            (listing.status)(&resource);
        }
    }
    Ok(())
}

fn read_manifest<K: DeserializeOwned>(path: &Path) -> Result<K> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Invalid manifest {}", path.display()))
}

async fn get<K>(api: &Api<K>, ns: &str, name: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    api.get(name)
        .await
        .with_context(|| format!("Failed to get {} '{ns}/{name}'", K::kind(&())))
}

fn print_conditions(conditions: &[Condition]) {
    if conditions.is_empty() {
        return;
    }
    println!("\nConditions:");
    for condition in conditions {
        println!("  {}: {}", condition.r#type, condition.status);
        if let Some(reason) = &condition.reason {
            println!("    Reason: {reason}");
        }
        if let Some(message) = &condition.message {
            println!("    Message: {message}");
        }
        if let Some(time) = &condition.last_transition_time {
            println!("    Last Transition: {time}");
        }
    }
}

fn print_profile_row(profile: &DataProfile) {
    let phase = profile
        .phase()
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    let last = profile
        .status
        .as_ref()
        .and_then(|s| s.last_snapshot_time.as_deref())
        .unwrap_or("-");
    println!(
        "{:<30} {:<20} {:<18} {}",
        profile.name_any(),
        profile.spec.schedule,
        phase,
        last
    );
}

fn print_profile_status(profile: &DataProfile) {
    println!("DataProfile '{}':", profile.name_any());
    println!("  Schedule: {}", profile.spec.schedule);
    println!("  Volume: {}", profile.spec.target.pvc_name);
    println!("  Engine: {}", profile.spec.target.engine.as_str());
    match profile.retention_count() {
        Some(count) => println!("  Retention: {count} snapshot(s)"),
        None => println!("  Retention: unlimited"),
    }
    let Some(status) = &profile.status else {
        println!("\nStatus: not reconciled yet");
        return;
    };
    println!("\nStatus:");
    if let Some(phase) = status.phase {
        println!("  Phase: {phase}");
    }
    if let Some(name) = &status.last_snapshot_name {
        println!("  Last Snapshot: {name}");
    }
    if let Some(time) = &status.last_snapshot_time {
        println!("  Last Snapshot Time: {time}");
    }
    print_conditions(&status.conditions);
}

fn print_clone_row(clone: &DataClone) {
    let expires = clone
        .status
        .as_ref()
        .and_then(|s| s.expires_at.as_deref())
        .unwrap_or("-");
    println!(
        "{:<30} {:<20} {:<18} {}",
        clone.name_any(),
        clone.spec.source_profile,
        clone.phase(),
        expires
    );
}

fn print_clone_status(clone: &DataClone) {
    println!("DataClone '{}':", clone.name_any());
    println!("  Source Profile: {}", clone.spec.source_profile);
    if let Some(snapshot) = &clone.spec.snapshot_name {
        println!("  Requested Snapshot: {snapshot}");
    }
    if let Some(ttl) = &clone.spec.ttl {
        println!("  TTL: {ttl}");
    }
    let Some(status) = &clone.status else {
        println!("\nStatus: not reconciled yet");
        return;
    };
    println!("\nStatus:");
    println!("  Phase: {}", clone.phase());
    if let Some(snapshot) = &status.snapshot_name {
        println!("  Restored From: {snapshot}");
    }
    if let Some(secret) = &status.connection_info_secret {
        println!("  Connection Secret: {secret}");
    }
    if let Some(time) = &status.ready_time {
        println!("  Ready Since: {time}");
    }
    if let Some(time) = &status.expires_at {
        println!("  Expires At: {time}");
    }
    print_conditions(&status.conditions);
}

async fn connection_command(client: Client, ns: &str, name: &str) -> Result<()> {
    let clones: Api<DataClone> = Api::namespaced(client.clone(), ns);
    let clone = get(&clones, ns, name).await?;
    let Some(secret_name) = clone
        .status
        .as_ref()
        .and_then(|s| s.connection_info_secret.clone())
    else {
        bail!(
            "DataClone '{ns}/{name}' is {} and has no connection details yet",
            clone.phase()
        );
    };

    let secrets: Api<Secret> = Api::namespaced(client, ns);
    let secret = secrets
        .get(&secret_name)
        .await
        .with_context(|| format!("Failed to read Secret '{ns}/{secret_name}'"))?;
    let info = ConnectionInfo::from_secret(&secret)?;

    println!("host:     {}", info.host);
    println!("port:     {}", info.port);
    println!("user:     {}", info.user);
    println!("password: {}", info.password);
    println!("dbname:   {}", info.dbname);
    Ok(())
}
