use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_api::{InProcApi, KeelApi, Response, LOCATION};
use keel_core::{LogicalResource, ResourceId};
use keel_ops::{ControllerConfig, OperationController};
use keel_persist::SqliteStore;
use keel_planes::{PlaneTable, Router};
use keel_render::{order_outputs, DependencyResolver, MemoryResources, Registry, RendererResource};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel control plane CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a resource id and show its parts
    ParseId { id: String },
    /// Show which plane serves a resource id
    Route { id: String },
    /// List the plane table (KEEL_PLANES_FILE or built-in)
    Planes,
    /// List resource types with a registered renderer
    Types,
    /// Render a manifest locally without deploying anything
    Render {
        /// YAML file with one `{id, properties}` document per resource
        file: String,
        /// Resource to render; defaults to the last document
        #[arg(long = "id")]
        id: Option<String>,
    },
    /// Create or update every resource in a manifest, in document order.
    /// Operations run in this process, so each one is followed to completion.
    Deploy { file: String },
    /// Delete a resource and wait for the operation
    Delete { id: String },
    /// Show a resource
    Get { id: String },
    /// List resources of one type, e.g. `/planes/radius/local/resourceGroups/rg/providers/Applications.Core/containers`
    Ls { collection: String },
    /// Show an operation by its status path
    Status { path: String },
    /// Show the secret values of a resource
    Secrets { id: String },
    /// Manage resource groups
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Delete expired operation records once
    Reap,
}

#[derive(Subcommand, Debug)]
enum GroupCommands {
    Create {
        id: String,
        /// key=value tags
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Show { id: String },
    Ls { scope: String },
    Rm { id: String },
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    id: String,
    #[serde(default)]
    properties: Json,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_manifest(path: &str) -> Result<Vec<ManifestDoc>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path))?;
    let mut docs = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(&text).enumerate() {
        let d = ManifestDoc::deserialize(doc).with_context(|| format!("parsing document {} of {}", i + 1, path))?;
        docs.push(d);
    }
    if docs.is_empty() {
        bail!("manifest {} holds no documents", path);
    }
    Ok(docs)
}

fn parse_tags(raw: &[String]) -> Result<serde_json::Map<String, Json>> {
    let mut tags = serde_json::Map::new();
    for t in raw {
        let (k, v) = t.split_once('=').ok_or_else(|| anyhow!("tag '{}' is not key=value", t))?;
        tags.insert(k.to_string(), json!(v));
    }
    Ok(tags)
}

async fn connect() -> Result<InProcApi> {
    let store = SqliteStore::open_default().context("opening keel store")?;
    let table = PlaneTable::from_env()?;
    let router = Router::connect(table).await;
    let ctl = OperationController::new(Arc::new(store), router, Registry::builtin(), ControllerConfig::from_env());
    Ok(InProcApi::new(ctl))
}

fn print_json(v: &Json) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_response(output: Output, r: &Response) -> Result<()> {
    match (output, &r.body) {
        (Output::Json, Some(body)) => print_json(body)?,
        (Output::Json, None) => println!("{}", json!({ "status": r.status })),
        (Output::Human, Some(body)) => {
            println!("{}", r.status);
            println!("{}", serde_yaml::to_string(body)?);
        }
        (Output::Human, None) => println!("{}", r.status),
    }
    Ok(())
}

/// Poll an accepted operation until it is terminal. Ctrl-C cancels it.
async fn follow(api: &InProcApi, accepted: &Response) -> Result<Json> {
    let Some(path) = accepted.header(LOCATION).map(|s| s.to_string()) else {
        return Ok(json!({ "status": accepted.status }));
    };
    let t0 = Instant::now();
    loop {
        let status = api.operation_status(&path).await.map_err(|e| anyhow!(e))?;
        let body = status.body.unwrap_or(Json::Null);
        match body["status"].as_str() {
            Some("Accepted") | Some("Running") => {}
            _ => {
                info!(path = %path, took_ms = %t0.elapsed().as_millis(), "operation finished");
                return Ok(body);
            }
        }
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!(path = %path, "interrupted, canceling operation");
                if let Err(e) = api.cancel_operation(&path).await {
                    warn!(error = %e, "cancel failed");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

/// Stand in for the store while rendering `root` locally: every other manifest
/// document is rendered in order and recorded with its bindings and computed values.
async fn preview(registry: &Registry, docs: &[ManifestDoc], root: &ResourceId) -> Result<(LogicalResource, MemoryResources)> {
    let reader = MemoryResources::new();
    let mut found = None;
    for d in docs {
        let id = ResourceId::parse(&d.id)?;
        let mut resource = LogicalResource::new(id.clone(), d.properties.clone());
        if &id == root {
            found = Some(resource);
            continue;
        }
        let resolution = DependencyResolver::new(registry, &reader).resolve(&resource).await?;
        let renderer = registry.get(&id.resource_type())?;
        let rr = RendererResource::from_logical(&resource);
        let out = renderer.render(&rr, &resolution.dependencies).map_err(|p| anyhow!("rendering dependency {}: {}", id, p))?;
        resource.status.bindings = renderer.allocate_bindings(&rr, &out.resources)?;
        for (k, v) in &out.computed_values {
            if let Ok(value) = v.resolve(&out.resources) {
                resource.status.computed_values.insert(k.clone(), value);
            }
        }
        reader.insert(resource);
    }
    let resource = found.ok_or_else(|| anyhow!("{} is not in the manifest", root))?;
    Ok((resource, reader))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::ParseId { id } => {
            let parsed = ResourceId::parse(&id)?;
            let v = json!({
                "id": parsed.to_string(),
                "key": parsed.key(),
                "plane": parsed.plane().map(|(t, n)| format!("{}/{}", t, n)),
                "resourceGroup": parsed.resource_group(),
                "provider": parsed.provider_namespace(),
                "type": parsed.resource_type(),
                "name": parsed.name(),
                "scope": parsed.root_scope().to_string(),
            });
            match cli.output {
                Output::Json => print_json(&v)?,
                Output::Human => {
                    for (k, val) in v.as_object().into_iter().flatten() {
                        println!("{:<14} {}", k, val.as_str().unwrap_or("-"));
                    }
                }
            }
        }
        Commands::Route { id } => {
            let table = PlaneTable::from_env()?;
            let parsed = ResourceId::parse(&id)?;
            let plane = table.resolve(&parsed)?;
            match cli.output {
                Output::Json => print_json(&json!(plane))?,
                Output::Human => println!("{} • {} • {}", parsed, plane.name, plane.kind),
            }
        }
        Commands::Planes => {
            let table = PlaneTable::from_env()?;
            match cli.output {
                Output::Json => print_json(&json!(table.planes()))?,
                Output::Human => {
                    println!("{:<12} {:<11} NAMESPACES", "NAME", "KIND");
                    for p in table.planes() {
                        println!("{:<12} {:<11} {}", p.name, p.kind.to_string(), p.namespaces.join(","));
                    }
                }
            }
        }
        Commands::Types => {
            let types = Registry::builtin().types();
            match cli.output {
                Output::Json => print_json(&json!(types))?,
                Output::Human => types.iter().for_each(|t| println!("{}", t)),
            }
        }
        Commands::Render { file, id } => {
            let docs = load_manifest(&file)?;
            let root = match id {
                Some(id) => ResourceId::parse(&id)?,
                None => ResourceId::parse(&docs[docs.len() - 1].id)?,
            };
            let registry = Registry::builtin();
            let (resource, reader) = preview(&registry, &docs, &root).await?;
            let t0 = Instant::now();
            let resolution = DependencyResolver::new(&registry, &reader).resolve(&resource).await?;
            let renderer = registry.get(&root.resource_type())?;
            let out = renderer
                .render(&RendererResource::from_logical(&resource), &resolution.dependencies)
                .map_err(|p| anyhow!("render failed: {}", p))?;
            let order = order_outputs(&out.resources)?;
            info!(id = %root, outputs = out.resources.len(), took_ms = %t0.elapsed().as_millis(), "render ok");
            match cli.output {
                Output::Json => {
                    let ordered: Vec<&keel_core::OutputResource> = order.iter().map(|&i| &out.resources[i]).collect();
                    print_json(&json!({ "outputResources": ordered, "computedValues": out.computed_values }))?;
                }
                Output::Human => {
                    for (n, &i) in order.iter().enumerate() {
                        let o = &out.resources[i];
                        println!("{}. {} • {}{}", n + 1, o.local_id, o.identity, if o.managed { "" } else { " (unmanaged)" });
                    }
                    for (k, v) in &out.computed_values {
                        println!("{} = {}", k, v.resolve(&out.resources).map(|v| v.to_string()).unwrap_or_else(|e| format!("<{}>", e)));
                    }
                }
            }
        }
        Commands::Deploy { file } => {
            let docs = load_manifest(&file)?;
            let api = connect().await?;
            for d in docs {
                let accepted = match api.create_or_update(&d.id, json!({ "properties": d.properties })).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(id = %d.id, error = %e, "deploy rejected");
                        print_json(&e.body())?;
                        bail!("deploy of {} rejected", d.id);
                    }
                };
                let status = follow(&api, &accepted).await?;
                print_json(&status)?;
                if status["status"] != "Succeeded" {
                    bail!("deploy of {} ended {}", d.id, status["status"]);
                }
            }
            api.controller().shutdown().await;
        }
        Commands::Delete { id } => {
            let api = connect().await?;
            let accepted = api.delete(&id).await.map_err(|e| anyhow!(e))?;
            if accepted.status == 204 {
                print_response(cli.output, &accepted)?;
            } else {
                print_json(&follow(&api, &accepted).await?)?;
            }
            api.controller().shutdown().await;
        }
        Commands::Get { id } => {
            let api = connect().await?;
            print_response(cli.output, &api.get(&id).await.map_err(|e| anyhow!(e))?)?;
        }
        Commands::Ls { collection } => {
            let api = connect().await?;
            print_response(cli.output, &api.list(&collection).await.map_err(|e| anyhow!(e))?)?;
        }
        Commands::Status { path } => {
            let api = connect().await?;
            print_response(cli.output, &api.operation_status(&path).await.map_err(|e| anyhow!(e))?)?;
        }
        Commands::Secrets { id } => {
            let api = connect().await?;
            print_response(cli.output, &api.list_secrets(&id).await.map_err(|e| anyhow!(e))?)?;
        }
        Commands::Group { command } => {
            let api = connect().await?;
            let res = match command {
                GroupCommands::Create { id, tags } => api.put_resource_group(&id, json!({ "tags": parse_tags(&tags)? })).await,
                GroupCommands::Show { id } => api.get_resource_group(&id).await,
                GroupCommands::Ls { scope } => api.list_resource_groups(&scope).await,
                GroupCommands::Rm { id } => api.delete_resource_group(&id).await,
            };
            print_response(cli.output, &res.map_err(|e| anyhow!(e))?)?;
        }
        Commands::Reap => {
            let api = connect().await?;
            let removed = api.controller().reclaim_expired().await?;
            match cli.output {
                Output::Json => print_json(&json!({ "removed": removed }))?,
                Output::Human => println!("removed {} operation record(s)", removed),
            }
        }
    }
    Ok(())
}
